//! Browser process supervision.
//!
//! Handles locating a browser executable, launching it with a dedicated
//! profile directory, discovering the DevTools endpoint from its output,
//! and tearing the process down again.
//!
//! Storage cleanup for a temporary profile runs exactly once no matter
//! which shutdown path fires; cleanup errors are logged, never escalated,
//! since there is no recovery action available during teardown.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use cdp_protocol::LaunchOptions;

use crate::error::{Error, Result};

/// Prefix of the browser's endpoint announcement line.
pub const DEVTOOLS_LISTENING_PREFIX: &str = "DevTools listening on ";

/// Registry of spawned browser process ids, owned by the supervisor.
///
/// Exists so force-kill bookkeeping is explicit state that tests can own
/// and inspect, not an ambient global.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
	pids: Mutex<HashSet<u32>>,
}

impl ProcessRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Records a spawned process id.
	pub fn register(&self, pid: u32) {
		self.pids.lock().insert(pid);
	}

	/// Forgets a process id after the process was reaped.
	pub fn release(&self, pid: u32) {
		self.pids.lock().remove(&pid);
	}

	/// Returns the currently tracked process ids.
	pub fn pids(&self) -> Vec<u32> {
		self.pids.lock().iter().copied().collect()
	}

	/// Force-kills every tracked process. Best effort.
	pub fn kill_all(&self) {
		let pids: Vec<u32> = self.pids.lock().drain().collect();
		for pid in pids {
			force_kill(pid);
		}
	}
}

#[cfg(unix)]
fn force_kill(pid: u32) {
	let _ = std::process::Command::new("kill")
		.args(["-9", &pid.to_string()])
		.status();
}

#[cfg(windows)]
fn force_kill(pid: u32) {
	let _ = std::process::Command::new("taskkill")
		.args(["/F", "/PID", &pid.to_string()])
		.status();
}

/// Handle to the profile directory used by one browser process.
///
/// A temporary profile is removed on [`cleanup`](Self::cleanup); a
/// caller-supplied directory is left alone. Cleanup is guarded so it runs
/// at most once regardless of which shutdown path invokes it.
pub struct StorageDir {
	path: PathBuf,
	temp: Mutex<Option<TempDir>>,
	cleaned: AtomicBool,
}

impl StorageDir {
	/// Creates a fresh temporary profile directory.
	pub fn create() -> Result<Self> {
		let temp = tempfile::Builder::new()
			.prefix("cdp-profile-")
			.tempdir()
			.map_err(|e| Error::LaunchFailed(format!("failed to create profile dir: {e}")))?;
		Ok(Self {
			path: temp.path().to_path_buf(),
			temp: Mutex::new(Some(temp)),
			cleaned: AtomicBool::new(false),
		})
	}

	/// Wraps a caller-supplied profile directory (never removed).
	pub fn external(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			temp: Mutex::new(None),
			cleaned: AtomicBool::new(false),
		}
	}

	/// Returns the profile directory path.
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Removes a temporary profile directory. Runs at most once; errors
	/// are logged and swallowed.
	pub fn cleanup(&self) {
		if self.cleaned.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(temp) = self.temp.lock().take() {
			if let Err(e) = temp.close() {
				tracing::warn!(error = %e, "failed to remove profile directory");
			} else {
				tracing::debug!(path = %self.path.display(), "profile directory removed");
			}
		}
	}
}

/// Find the browser executable in env override, PATH, or common locations.
///
/// # Errors
///
/// Returns [`Error::BrowserNotFound`] if no candidate exists.
pub fn find_browser_executable() -> Result<PathBuf> {
	// 1. Runtime override
	if let Ok(path) = std::env::var("CDP_BROWSER_PATH") {
		let path = PathBuf::from(path);
		if path.exists() {
			return Ok(path);
		}
		tracing::warn!(
			path = %path.display(),
			"CDP_BROWSER_PATH does not exist; trying fallbacks"
		);
	}

	// 2. PATH lookup
	#[cfg(not(windows))]
	let which_cmd = "which";
	#[cfg(windows)]
	let which_cmd = "where";

	const CANDIDATES: &[&str] = &[
		"chromium",
		"chromium-browser",
		"google-chrome",
		"google-chrome-stable",
		"chrome",
	];

	for candidate in CANDIDATES {
		if let Ok(output) = std::process::Command::new(which_cmd).arg(candidate).output() {
			if output.status.success() {
				let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
				if let Some(first) = found.lines().next() {
					let path = PathBuf::from(first);
					if path.exists() {
						return Ok(path);
					}
				}
			}
		}
	}

	// 3. Common install locations
	#[cfg(not(windows))]
	let common_locations = [
		"/usr/bin/chromium",
		"/usr/bin/chromium-browser",
		"/usr/bin/google-chrome",
		"/opt/google/chrome/chrome",
		"/Applications/Chromium.app/Contents/MacOS/Chromium",
		"/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
	];

	#[cfg(windows)]
	let common_locations = [
		"C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
		"C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
	];

	for location in &common_locations {
		let path = PathBuf::from(location);
		if path.exists() {
			return Ok(path);
		}
	}

	Err(Error::BrowserNotFound)
}

/// Default command line for a supervised browser.
fn default_args(options: &LaunchOptions, profile: &Path) -> Vec<String> {
	let mut args = vec![
		format!(
			"--remote-debugging-port={}",
			options.remote_debugging_port.unwrap_or(0)
		),
		format!("--user-data-dir={}", profile.display()),
		"--no-first-run".to_string(),
		"--no-default-browser-check".to_string(),
	];
	if options.headless.unwrap_or(true) {
		args.push("--headless=new".to_string());
	}
	args.extend(options.args.iter().cloned());
	args.push("about:blank".to_string());
	args
}

/// A supervised browser process with a discovered DevTools endpoint.
pub struct BrowserProcess {
	child: Child,
	pid: Option<u32>,
	ws_url: String,
	storage: StorageDir,
	closing: Arc<AtomicBool>,
	registry: Arc<ProcessRegistry>,
}

impl BrowserProcess {
	/// Returns the discovered DevTools WebSocket URL.
	pub fn ws_url(&self) -> &str {
		&self.ws_url
	}

	/// Returns the child's process id, if still known.
	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// Returns the profile directory in use.
	pub fn profile_dir(&self) -> &Path {
		self.storage.path()
	}

	/// Shared flag set once a deliberate shutdown begins.
	///
	/// Consumers use it to tell an expected connection loss apart from a
	/// crash.
	pub fn closing_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.closing)
	}

	/// Marks the process as deliberately closing.
	pub fn set_closing(&self) {
		self.closing.store(true, Ordering::SeqCst);
	}

	/// Returns true once a deliberate shutdown has begun.
	pub fn is_closing(&self) -> bool {
		self.closing.load(Ordering::SeqCst)
	}

	/// Waits up to `grace` for the process to exit on its own (the owner is
	/// expected to have asked the browser to close over the protocol first),
	/// then force-kills it. Cleans up storage.
	pub async fn graceful_close(&mut self, grace: Duration) {
		self.set_closing();
		if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
			tracing::debug!("graceful close timed out; killing browser process");
			let _ = self.child.start_kill();
			let _ = self.child.wait().await;
		}
		self.reap();
	}

	/// Kills the process unconditionally and cleans up storage.
	pub async fn terminate(&mut self) {
		self.set_closing();
		let _ = self.child.start_kill();
		let _ = self.child.wait().await;
		self.reap();
	}

	fn reap(&mut self) {
		if let Some(pid) = self.pid.take() {
			self.registry.release(pid);
		}
		self.storage.cleanup();
	}
}

impl Drop for BrowserProcess {
	fn drop(&mut self) {
		// kill_on_drop takes the child down; bookkeeping and storage still
		// need the guarded cleanup.
		if let Some(pid) = self.pid.take() {
			self.registry.release(pid);
		}
		self.storage.cleanup();
	}
}

impl std::fmt::Debug for BrowserProcess {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BrowserProcess")
			.field("pid", &self.pid)
			.field("ws_url", &self.ws_url)
			.field("closing", &self.closing.load(Ordering::SeqCst))
			.finish()
	}
}

/// Launches a browser process and discovers its DevTools endpoint.
///
/// The child is spawned with `kill_on_drop` so it cannot outlive its
/// supervisor, and its pid is recorded in `registry` until it is reaped.
///
/// # Errors
///
/// Returns [`Error::BrowserNotFound`] or [`Error::LaunchFailed`] when the
/// process cannot be started, [`Error::ProcessExited`] when it dies before
/// announcing the endpoint, and [`Error::Timeout`] when the announcement
/// does not arrive in time. Failure paths leave no process or temporary
/// profile behind.
pub async fn launch(
	options: &LaunchOptions,
	registry: Arc<ProcessRegistry>,
) -> Result<BrowserProcess> {
	let executable = match &options.executable_path {
		Some(path) => path.clone(),
		None => find_browser_executable()?,
	};

	let storage = match &options.user_data_dir {
		Some(dir) => StorageDir::external(dir),
		None => StorageDir::create()?,
	};

	let args = default_args(options, storage.path());
	tracing::debug!(
		executable = %executable.display(),
		?args,
		"launching browser"
	);

	let mut child = Command::new(&executable)
		.args(&args)
		.envs(options.env.iter())
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.map_err(|e| {
			storage.cleanup();
			Error::LaunchFailed(format!("failed to spawn {}: {e}", executable.display()))
		})?;

	let pid = child.id();
	if let Some(pid) = pid {
		registry.register(pid);
	}

	// The endpoint line goes to stderr.
	let stderr = child.stderr.take().ok_or_else(|| {
		Error::LaunchFailed("stderr of browser process was not captured".to_string())
	})?;

	let deadline = Duration::from_millis(options.timeout_ms());
	let discovered = {
		let wait = child.wait();
		let exited = async move {
			match wait.await {
				Ok(status) => format!("process exited with {status}"),
				Err(e) => format!("process wait failed: {e}"),
			}
		};
		scan_devtools_output(stderr, exited, deadline).await
	};

	match discovered {
		Ok(ws_url) => {
			tracing::debug!(%ws_url, pid, "DevTools endpoint discovered");
			Ok(BrowserProcess {
				child,
				pid,
				ws_url,
				storage,
				closing: Arc::new(AtomicBool::new(false)),
				registry,
			})
		}
		Err(e) => {
			// No half-launched browser may survive a failed launch.
			let _ = child.start_kill();
			let _ = child.wait().await;
			if let Some(pid) = pid {
				registry.release(pid);
			}
			storage.cleanup();
			Err(e)
		}
	}
}

/// Scans process output for the endpoint announcement.
///
/// Three conditions race: the announcement line (success), the process
/// ending first (failure carrying the first error-looking line, or the exit
/// status), and the deadline (failure). Diagnostic noise before the real
/// announcement is expected, so success wins even when earlier lines looked
/// like errors.
async fn scan_devtools_output<R, F>(output: R, exited: F, deadline: Duration) -> Result<String>
where
	R: AsyncRead + Unpin,
	F: Future<Output = String>,
{
	let mut lines = BufReader::new(output).lines();
	let mut first_error: Option<String> = None;
	tokio::pin!(exited);

	let scan = async {
		let mut exit_status: Option<String> = None;
		loop {
			tokio::select! {
				biased;
				line = lines.next_line() => match line {
					Ok(Some(line)) => {
						tracing::trace!(line = %line, "browser output");
						if let Some(url) = line.strip_prefix(DEVTOOLS_LISTENING_PREFIX) {
							return Ok(url.trim().to_string());
						}
						if first_error.is_none() && looks_like_error(&line) {
							first_error = Some(line);
						}
					}
					Ok(None) | Err(_) => break,
				},
				status = &mut exited => {
					exit_status = Some(status);
					break;
				}
			}
		}

		// The process ended or its pipe closed; the announcement may still
		// be buffered, so drain before declaring the launch dead.
		while let Ok(Some(line)) = lines.next_line().await {
			if let Some(url) = line.strip_prefix(DEVTOOLS_LISTENING_PREFIX) {
				return Ok(url.trim().to_string());
			}
			if first_error.is_none() && looks_like_error(&line) {
				first_error = Some(line);
			}
		}

		let status = match exit_status {
			Some(status) => status,
			None => exited.await,
		};
		Err(Error::ProcessExited {
			message: first_error.take().unwrap_or(status),
		})
	};

	match tokio::time::timeout(deadline, scan).await {
		Ok(result) => result,
		Err(_) => Err(Error::Timeout(
			"Timed out waiting for DevTools endpoint announcement".to_string(),
		)),
	}
}

/// Heuristic for error-looking diagnostic lines.
fn looks_like_error(line: &str) -> bool {
	let line = line.trim_start();
	line.starts_with("ERROR") || line.contains(":ERROR:") || line.starts_with("FATAL")
		|| line.contains(":FATAL:")
}
