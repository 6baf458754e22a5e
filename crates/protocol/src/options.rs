//! Configuration types for launching and connecting to a browser.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default timeout in milliseconds for lifecycle operations.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Options for launching a local browser process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOptions {
	/// Path to the browser executable; discovered automatically when unset
	#[serde(skip_serializing_if = "Option::is_none")]
	pub executable_path: Option<PathBuf>,

	/// Additional command-line arguments appended after the defaults
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub args: Vec<String>,

	/// Extra environment variables for the child process
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub env: HashMap<String, String>,

	/// Run without a visible window (default true)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub headless: Option<bool>,

	/// Profile directory to use; a temporary one is created (and removed
	/// on close) when unset
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_data_dir: Option<PathBuf>,

	/// Debugging port to request; 0 (the default) lets the browser pick
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_debugging_port: Option<u16>,

	/// Maximum time in milliseconds for launch and connect
	#[serde(skip_serializing_if = "Option::is_none")]
	pub timeout: Option<u64>,
}

impl LaunchOptions {
	/// Creates a new builder.
	pub fn builder() -> LaunchOptionsBuilder {
		LaunchOptionsBuilder::default()
	}

	/// Returns the configured timeout, or the default.
	pub fn timeout_ms(&self) -> u64 {
		self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)
	}
}

/// Builder for [`LaunchOptions`].
#[derive(Debug, Clone, Default)]
pub struct LaunchOptionsBuilder {
	inner: LaunchOptions,
}

impl LaunchOptionsBuilder {
	/// Sets the browser executable path.
	pub fn executable_path(mut self, path: impl Into<PathBuf>) -> Self {
		self.inner.executable_path = Some(path.into());
		self
	}

	/// Appends one command-line argument.
	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.inner.args.push(arg.into());
		self
	}

	/// Appends several command-line arguments.
	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.inner.args.extend(args.into_iter().map(Into::into));
		self
	}

	/// Sets one environment variable for the child process.
	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.inner.env.insert(key.into(), value.into());
		self
	}

	/// Sets headless mode.
	pub fn headless(mut self, headless: bool) -> Self {
		self.inner.headless = Some(headless);
		self
	}

	/// Sets the profile directory (disables temporary-profile cleanup).
	pub fn user_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.inner.user_data_dir = Some(dir.into());
		self
	}

	/// Sets the debugging port to request.
	pub fn remote_debugging_port(mut self, port: u16) -> Self {
		self.inner.remote_debugging_port = Some(port);
		self
	}

	/// Sets the launch timeout in milliseconds.
	pub fn timeout(mut self, timeout_ms: u64) -> Self {
		self.inner.timeout = Some(timeout_ms);
		self
	}

	/// Builds the options.
	pub fn build(self) -> LaunchOptions {
		self.inner
	}
}
