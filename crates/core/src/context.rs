//! Isolated browsing contexts.
//!
//! A [`BrowsingContext`] is an isolated cookie/storage partition grouping
//! zero or more pages. One default context exists from the moment the
//! connection is up; further contexts are created on request and destroyed
//! by explicit disposal.
//!
//! Back-references go through the id-keyed registries on [`Browser`], so
//! teardown is map deletion rather than cycle breaking.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;

use cdp_runtime::{Error, Result};

use crate::browser::Browser;
use crate::page::Page;

/// One isolated browsing context (profile partition).
pub struct BrowsingContext {
	id: Arc<str>,
	browser: Weak<Browser>,
}

impl BrowsingContext {
	pub(crate) fn new(id: Arc<str>, browser: Weak<Browser>) -> Self {
		Self { id, browser }
	}

	/// Returns the context id; empty for the default context.
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Returns true for the context the browser starts with.
	pub fn is_default(&self) -> bool {
		self.id.is_empty()
	}

	/// Opens a new page in this context, waiting for its target to attach.
	pub async fn new_page(&self) -> Result<Arc<Page>> {
		let browser = self.upgrade()?;
		let timeout = browser.default_timeout();
		browser.new_page_in_context(&self.id, timeout).await
	}

	/// Opens a new page with an explicit deadline for the attach wait.
	pub async fn new_page_with_timeout(&self, timeout: Duration) -> Result<Arc<Page>> {
		let browser = self.upgrade()?;
		browser.new_page_in_context(&self.id, timeout).await
	}

	/// Returns the live pages belonging to this context.
	pub fn pages(&self) -> Vec<Arc<Page>> {
		match self.browser.upgrade() {
			Some(browser) => browser
				.pages()
				.into_iter()
				.filter(|page| page.context_id() == &*self.id)
				.collect(),
			None => Vec::new(),
		}
	}

	/// Disposes this context and everything in it.
	///
	/// The browser detaches the context's targets, which removes their
	/// pages through the ordinary detach path.
	pub async fn close(&self) -> Result<()> {
		if self.is_default() {
			return Err(Error::ProtocolError(
				"the default browsing context cannot be disposed".to_string(),
			));
		}
		let browser = self.upgrade()?;
		browser
			.connection()
			.send(
				"Target.disposeBrowserContext",
				json!({"browserContextId": &*self.id}),
			)
			.await?;
		browser.remove_context(&self.id);
		Ok(())
	}

	fn upgrade(&self) -> Result<Arc<Browser>> {
		self.browser.upgrade().ok_or(Error::ConnectionClosed)
	}
}

impl std::fmt::Debug for BrowsingContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BrowsingContext")
			.field("id", &self.id)
			.field("default", &self.is_default())
			.finish()
	}
}
