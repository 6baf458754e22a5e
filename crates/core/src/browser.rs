//! The browser handle and its target lifecycle.
//!
//! A [`Browser`] mirrors the remote target tree: attach notifications build
//! sessions and pages, detach notifications tear them down again, and an
//! explicit close shuts everything down exactly once.
//!
//! Each registry (contexts, pages, session-to-target) is guarded by its own
//! lock scoped to that container; the closing state is one compared-and-
//! swapped atomic so concurrent `close()` callers are safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::broadcast;

use cdp_protocol::{AttachedPayload, DetachedPayload, LaunchOptions};
use cdp_runtime::{
	BrowserProcess, CloseReason, Connection, Error, EventEmitter, ProcessRegistry, Result,
	WebSocketTransport, launcher,
};

use crate::context::BrowsingContext;
use crate::page::Page;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Handle to one running browser, local or remote.
pub struct Browser {
	connection: Arc<Connection>,
	/// Supervised process when we launched the browser ourselves
	process: TokioMutex<Option<BrowserProcess>>,
	registry: Arc<ProcessRegistry>,
	/// Open -> Closing -> Closed, never regresses
	state: AtomicU8,
	contexts: Mutex<HashMap<Arc<str>, Arc<BrowsingContext>>>,
	pages: Mutex<HashMap<Arc<str>, Arc<Page>>>,
	session_targets: Mutex<HashMap<Arc<str>, Arc<str>>>,
	/// Feed of freshly attached pages, consumed by page-creation waits
	attach_tx: broadcast::Sender<Arc<Page>>,
	events: EventEmitter,
	/// Serializes page creation; attach correlation is by target id alone
	page_create_lock: TokioMutex<()>,
	default_timeout: Duration,
}

impl Browser {
	/// Launches a local browser process and connects to it.
	///
	/// On any failure after the spawn, the process is terminated and its
	/// temporary profile removed; no half-launched browser survives.
	pub async fn launch(options: LaunchOptions) -> Result<Arc<Browser>> {
		let registry = Arc::new(ProcessRegistry::new());
		let timeout = Duration::from_millis(options.timeout_ms());

		let mut process = launcher::launch(&options, Arc::clone(&registry)).await?;

		match Self::connect_internal(process.ws_url().to_string(), timeout, registry).await {
			Ok(browser) => {
				*browser.process.lock().await = Some(process);
				Ok(browser)
			}
			Err(e) => {
				process.terminate().await;
				Err(e)
			}
		}
	}

	/// Connects to an already-running browser's debugging endpoint.
	pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Arc<Browser>> {
		Self::connect_internal(endpoint.to_string(), timeout, Arc::new(ProcessRegistry::new()))
			.await
	}

	async fn connect_internal(
		endpoint: String,
		timeout: Duration,
		registry: Arc<ProcessRegistry>,
	) -> Result<Arc<Browser>> {
		let (transport, message_rx) = WebSocketTransport::connect(&endpoint, timeout).await?;
		let parts = transport.into_transport_parts(message_rx);
		let connection = Arc::new(Connection::new(parts));
		{
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.run().await });
		}

		let (attach_tx, _) = broadcast::channel(64);
		let browser = Arc::new(Browser {
			connection: Arc::clone(&connection),
			process: TokioMutex::new(None),
			registry,
			state: AtomicU8::new(OPEN),
			contexts: Mutex::new(HashMap::new()),
			pages: Mutex::new(HashMap::new()),
			session_targets: Mutex::new(HashMap::new()),
			attach_tx,
			events: EventEmitter::new(),
			page_create_lock: TokioMutex::new(()),
			default_timeout: timeout,
		});

		// The default context exists from the moment we connect.
		let default_id: Arc<str> = Arc::from("");
		let default_context = Arc::new(BrowsingContext::new(
			Arc::clone(&default_id),
			Arc::downgrade(&browser),
		));
		browser.contexts.lock().insert(default_id, default_context);

		// Handlers must be live before discovery so no attach slips past.
		browser.wire_target_events().await;

		let setup: Result<()> = async {
			connection
				.send("Target.setDiscoverTargets", json!({"discover": true}))
				.await?;
			connection
				.send(
					"Target.setAutoAttach",
					json!({
						"autoAttach": true,
						"waitForDebuggerOnStart": false,
						"flatten": true,
					}),
				)
				.await?;
			Ok(())
		}
		.await;

		if let Err(e) = setup {
			connection.close().await;
			return Err(e);
		}

		Ok(browser)
	}

	/// Subscribes the target-lifecycle handler and the disconnect watcher.
	///
	/// Attach and detach share one subscription: per-subscriber ordering is
	/// guaranteed, cross-subscriber ordering is not, and a detach racing
	/// ahead of its own attach would strand a page.
	async fn wire_target_events(self: &Arc<Self>) {
		let mut target_events = self.connection.events().subscribe(None, 256).await;
		let weak = Arc::downgrade(self);
		tokio::spawn(async move {
			while let Some(event) = target_events.recv().await {
				let Some(browser) = weak.upgrade() else { break };
				match &*event.name {
					"Target.attachedToTarget" => {
						match serde_json::from_value::<AttachedPayload>(event.data) {
							Ok(payload) => browser.on_attached(payload).await,
							Err(e) => {
								tracing::warn!(error = %e, "malformed attach notification");
							}
						}
					}
					"Target.detachedFromTarget" => {
						match serde_json::from_value::<DetachedPayload>(event.data) {
							Ok(payload) => browser.on_detached(payload).await,
							Err(e) => {
								tracing::warn!(error = %e, "malformed detach notification");
							}
						}
					}
					_ => {}
				}
			}
		});

		let mut closed = self.connection.closed();
		let weak = Arc::downgrade(self);
		tokio::spawn(async move {
			while closed.borrow_and_update().is_none() {
				if closed.changed().await.is_err() {
					break;
				}
			}
			let reason = closed.borrow().clone();
			if let Some(browser) = weak.upgrade() {
				browser.on_connection_down(reason).await;
			}
		});
	}

	/// Builds graph state for a newly attached target.
	async fn on_attached(self: &Arc<Self>, payload: AttachedPayload) {
		let info = payload.target_info;
		if !info.is_attachable() {
			tracing::debug!(
				target = %info.target_id,
				kind = ?info.kind,
				url = %info.url,
				"ignoring non-attachable target"
			);
			return;
		}

		// The dispatcher registered the session before this notification was
		// fanned out; if it is gone again already, so is the target.
		let Some(session) = self.connection.session(&payload.session_id) else {
			tracing::debug!(
				session = %payload.session_id,
				"session ended before the graph caught up"
			);
			return;
		};

		self.session_targets.lock().insert(
			Arc::from(payload.session_id.as_str()),
			Arc::from(info.target_id.as_str()),
		);

		if !info.is_page() {
			return;
		}

		let context_id: Arc<str> = Arc::from(info.browser_context_id.as_deref().unwrap_or(""));
		let page = Arc::new(Page::new(
			Arc::from(info.target_id.as_str()),
			context_id,
			info.opener_id.as_deref().map(Arc::from),
			info.is_background(),
			session,
		));

		let inserted = {
			let mut pages = self.pages.lock();
			if pages.contains_key(info.target_id.as_str()) {
				false
			} else {
				pages.insert(Arc::from(info.target_id.as_str()), Arc::clone(&page));
				true
			}
		};

		if inserted {
			tracing::debug!(target = %info.target_id, "page attached");
			let _ = self.attach_tx.send(Arc::clone(&page));
			self.events
				.emit("page", json!({"targetId": info.target_id}))
				.await;
		}
	}

	/// Tears down graph state for a detached session.
	async fn on_detached(self: &Arc<Self>, payload: DetachedPayload) {
		// Remove the mapping first: a duplicate or racing detach for the
		// same session finds nothing and stops here.
		let target_id = self
			.session_targets
			.lock()
			.remove(payload.session_id.as_str());
		let Some(target_id) = target_id else {
			tracing::debug!(
				session = %payload.session_id,
				"detach for unknown session, already handled or never tracked"
			);
			return;
		};

		// Removal from the page map gates the close notification: even with
		// several sessions on one target, it fires exactly once.
		let page = self.pages.lock().remove(&target_id);
		if let Some(page) = page {
			if page.mark_closed() {
				tracing::debug!(target = %target_id, "page detached");
				self.events
					.emit("pageClosed", json!({"targetId": &*target_id}))
					.await;
			}
		}
	}

	/// Coordinated teardown when the connection goes away underneath us.
	async fn on_connection_down(self: &Arc<Self>, reason: Option<CloseReason>) {
		if matches!(reason, Some(CloseReason::Lost(_)) | None) {
			let deliberate = self
				.process
				.lock()
				.await
				.as_ref()
				.map(BrowserProcess::is_closing)
				.unwrap_or(false);
			if !deliberate && self.state.load(Ordering::SeqCst) == OPEN {
				tracing::warn!("browser connection lost unexpectedly");
			}
		}

		self.teardown_graph().await;
		self.state.store(CLOSED, Ordering::SeqCst);
		self.events.emit("disconnected", Value::Null).await;
	}

	/// Creates a new isolated browsing context.
	pub async fn new_context(self: &Arc<Self>) -> Result<Arc<BrowsingContext>> {
		self.ensure_open()?;
		let result = self
			.connection
			.send("Target.createBrowserContext", json!({}))
			.await?;
		let id = result["browserContextId"].as_str().ok_or_else(|| {
			Error::ProtocolError("createBrowserContext reply missing browserContextId".to_string())
		})?;

		let id: Arc<str> = Arc::from(id);
		let context = Arc::new(BrowsingContext::new(Arc::clone(&id), Arc::downgrade(self)));
		self.contexts.lock().insert(id, Arc::clone(&context));
		Ok(context)
	}

	/// Opens a new page in the default context.
	pub async fn new_page(self: &Arc<Self>) -> Result<Arc<Page>> {
		self.new_page_in_context("", self.default_timeout).await
	}

	/// Opens a page in the given context and waits for its target to attach.
	///
	/// The create command's reply names the target id; the page itself
	/// arrives through the attach notification, which carries no reference
	/// back to the request. Correlation is therefore by target id on a feed
	/// from the attach handler, and creation is serialized so concurrent
	/// calls cannot claim each other's targets.
	pub(crate) async fn new_page_in_context(
		self: &Arc<Self>,
		context_id: &str,
		timeout: Duration,
	) -> Result<Arc<Page>> {
		self.ensure_open()?;

		let _guard = self.page_create_lock.lock().await;

		// Subscribe before issuing the command so the attach cannot be missed.
		let mut attach_rx = self.attach_tx.subscribe();

		let mut params = json!({"url": "about:blank"});
		if !context_id.is_empty() {
			params["browserContextId"] = Value::String(context_id.to_string());
		}
		let result = self.connection.send("Target.createTarget", params).await?;
		let target_id = result["targetId"]
			.as_str()
			.ok_or_else(|| {
				Error::ProtocolError("createTarget reply missing targetId".to_string())
			})?
			.to_string();

		// The attach event may have raced in ahead of the reply.
		if let Some(page) = self.pages.lock().get(target_id.as_str()).cloned() {
			return Ok(page);
		}

		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return Err(Error::Timeout(format!(
					"Timed out waiting for new page {target_id} to attach"
				)));
			}
			match tokio::time::timeout(remaining, attach_rx.recv()).await {
				Ok(Ok(page)) if page.target_id() == target_id => return Ok(page),
				Ok(Ok(_)) => continue,
				Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
					tracing::warn!(dropped = n, "attach feed lagged");
					if let Some(page) = self.pages.lock().get(target_id.as_str()).cloned() {
						return Ok(page);
					}
				}
				Ok(Err(broadcast::error::RecvError::Closed)) => {
					return Err(Error::ConnectionClosed);
				}
				Err(_) => {
					return Err(Error::Timeout(format!(
						"Timed out waiting for new page {target_id} to attach"
					)));
				}
			}
		}
	}

	/// Closes the browser: protocol close, transport disconnect, process
	/// shutdown, storage cleanup.
	///
	/// One-shot under concurrency: the caller winning the Open -> Closing
	/// transition runs the whole sequence; every other call returns
	/// immediately.
	pub async fn close(&self) -> Result<()> {
		if self
			.state
			.compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return Ok(());
		}
		tracing::debug!("closing browser");

		// Flag the supervisor first so the imminent connection loss reads
		// as deliberate, not as a crash.
		if let Some(process) = self.process.lock().await.as_ref() {
			process.set_closing();
		}

		// Best effort: the browser may already be gone.
		let _ = tokio::time::timeout(
			Duration::from_secs(2),
			self.connection.send("Browser.close", json!({})),
		)
		.await;

		self.connection.close().await;

		if let Some(mut process) = self.process.lock().await.take() {
			process.graceful_close(Duration::from_secs(5)).await;
		}

		self.teardown_graph().await;
		self.state.store(CLOSED, Ordering::SeqCst);
		Ok(())
	}

	/// Fires remaining page-close notifications and clears every registry.
	/// Safe to run more than once.
	async fn teardown_graph(&self) {
		let pages: Vec<Arc<Page>> = {
			let mut map = self.pages.lock();
			map.drain().map(|(_, page)| page).collect()
		};
		for page in pages {
			if page.mark_closed() {
				self.events
					.emit("pageClosed", json!({"targetId": page.target_id()}))
					.await;
			}
		}
		self.contexts.lock().clear();
		self.session_targets.lock().clear();
	}

	fn ensure_open(&self) -> Result<()> {
		match self.state.load(Ordering::SeqCst) {
			OPEN => Ok(()),
			_ => Err(Error::TargetClosed(
				"browser is closing or closed".to_string(),
			)),
		}
	}

	/// Returns the default browsing context.
	pub fn default_context(&self) -> Arc<BrowsingContext> {
		self.contexts
			.lock()
			.get("")
			.cloned()
			.expect("default context is registered at connect time")
	}

	/// Returns a context by id.
	pub fn context(&self, id: &str) -> Option<Arc<BrowsingContext>> {
		self.contexts.lock().get(id).cloned()
	}

	/// Returns all live contexts, the default one included.
	pub fn contexts(&self) -> Vec<Arc<BrowsingContext>> {
		self.contexts.lock().values().cloned().collect()
	}

	pub(crate) fn remove_context(&self, id: &str) {
		self.contexts.lock().remove(id);
	}

	/// Returns a page by target id.
	pub fn page(&self, target_id: &str) -> Option<Arc<Page>> {
		self.pages.lock().get(target_id).cloned()
	}

	/// Returns all live pages across contexts.
	pub fn pages(&self) -> Vec<Arc<Page>> {
		self.pages.lock().values().cloned().collect()
	}

	/// Returns the underlying connection.
	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}

	/// Browser-level notifications ("page", "pageClosed", "disconnected").
	pub fn events(&self) -> &EventEmitter {
		&self.events
	}

	/// Registry of process ids this browser's supervisor spawned.
	pub fn process_registry(&self) -> &Arc<ProcessRegistry> {
		&self.registry
	}

	/// Default deadline for lifecycle waits.
	pub fn default_timeout(&self) -> Duration {
		self.default_timeout
	}

	/// Returns true once the browser is fully closed.
	pub fn is_closed(&self) -> bool {
		self.state.load(Ordering::SeqCst) == CLOSED
	}
}

impl std::fmt::Debug for Browser {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = match self.state.load(Ordering::SeqCst) {
			OPEN => "open",
			CLOSING => "closing",
			_ => "closed",
		};
		f.debug_struct("Browser")
			.field("state", &state)
			.field("pages", &self.pages.lock().len())
			.field("contexts", &self.contexts.lock().len())
			.finish()
	}
}
