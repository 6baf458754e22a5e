//! cdp: drive Chromium-family browsers over the DevTools protocol.
//!
//! This crate provides the object graph mirroring the remote target tree:
//! a [`Browser`] owns isolated [`BrowsingContext`]s, each grouping
//! [`Page`]s, kept live by the attach/detach notifications flowing over
//! one multiplexed connection.
//!
//! # Example
//!
//! ```ignore
//! use cdp::{Browser, protocol::LaunchOptions};
//!
//! #[tokio::main]
//! async fn main() -> cdp::Result<()> {
//!     let browser = Browser::launch(LaunchOptions::default()).await?;
//!
//!     let context = browser.new_context().await?;
//!     let page = context.new_page().await?;
//!     page.execute("Page.navigate", serde_json::json!({"url": "https://example.com"})).await?;
//!
//!     browser.close().await?;
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod context;
pub mod page;

pub use browser::Browser;
pub use context::BrowsingContext;
pub use page::Page;

// Re-export the wire and runtime layers for callers that need them.
pub use cdp_protocol as protocol;
pub use cdp_runtime as runtime;

pub use cdp_protocol::DEFAULT_TIMEOUT_MS;
pub use cdp_runtime::{CommandExecutor, Error, EventSubscription, Result};
