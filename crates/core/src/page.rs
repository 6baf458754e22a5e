//! Page handles.
//!
//! A [`Page`] exists once both a session and a page-typed target are known
//! for a target id, and is destroyed exactly once when that target detaches
//! or the browser goes away.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::watch;

use cdp_runtime::{CommandExecutor, EventEmitter, Result, Session};

/// One page (tab) in the browser.
pub struct Page {
	target_id: Arc<str>,
	context_id: Arc<str>,
	opener_id: Option<Arc<str>>,
	background: bool,
	session: Arc<Session>,
	closed: AtomicBool,
	closed_tx: watch::Sender<bool>,
}

impl Page {
	pub(crate) fn new(
		target_id: Arc<str>,
		context_id: Arc<str>,
		opener_id: Option<Arc<str>>,
		background: bool,
		session: Arc<Session>,
	) -> Self {
		let (closed_tx, _) = watch::channel(false);
		Self {
			target_id,
			context_id,
			opener_id,
			background,
			session,
			closed: AtomicBool::new(false),
			closed_tx,
		}
	}

	/// Returns the page's target id.
	pub fn target_id(&self) -> &str {
		&self.target_id
	}

	/// Returns the id of the owning browsing context; empty for the
	/// default context.
	pub fn context_id(&self) -> &str {
		&self.context_id
	}

	/// Returns the target that opened this page, if any.
	pub fn opener_id(&self) -> Option<&str> {
		self.opener_id.as_deref()
	}

	/// Returns true if this page runs without a visible tab.
	pub fn is_background(&self) -> bool {
		self.background
	}

	/// Returns the session attached to this page's target.
	pub fn session(&self) -> &Arc<Session> {
		&self.session
	}

	/// Events scoped to this page's session.
	pub fn events(&self) -> &EventEmitter {
		self.session.events()
	}

	/// Sends a command scoped to this page and awaits the reply.
	pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
		self.session.execute(method, params).await
	}

	/// Asks the browser to close this page. The page object itself is
	/// removed when the matching detach notification arrives.
	pub async fn close(&self) -> Result<()> {
		self.session.execute("Page.close", Value::Null).await?;
		Ok(())
	}

	/// Returns true once the page has been removed from the graph.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Completes once the page has been removed from the graph.
	pub async fn wait_for_close(&self) {
		let mut rx = self.closed_tx.subscribe();
		loop {
			if *rx.borrow_and_update() {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	/// Flips the page to closed; only the first caller wins.
	pub(crate) fn mark_closed(&self) -> bool {
		if self
			.closed
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			let _ = self.closed_tx.send(true);
			true
		} else {
			false
		}
	}
}

impl CommandExecutor for Page {
	fn execute(
		&self,
		method: &str,
		params: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
		let method = method.to_string();
		Box::pin(async move { Page::execute(self, &method, params).await })
	}
}

impl std::fmt::Debug for Page {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Page")
			.field("target_id", &self.target_id)
			.field("context_id", &self.context_id)
			.field("background", &self.background)
			.field("closed", &self.is_closed())
			.finish()
	}
}
