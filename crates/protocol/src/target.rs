//! Target descriptors and attach/detach notification payloads.

use serde::{Deserialize, Serialize};

/// Kind of debuggable target, as reported in `TargetInfo.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
	/// An ordinary page (tab)
	Page,
	/// An extension background page
	BackgroundPage,
	/// An out-of-process iframe
	Iframe,
	/// A dedicated worker
	Worker,
	/// A shared worker
	SharedWorker,
	/// A service worker
	ServiceWorker,
	/// The top-level browser target itself
	Browser,
	/// An embedded webview
	Webview,
	/// A tab target (tab-level debugging)
	Tab,
	/// Anything the browser does not classify further
	Other,
	/// Forward-compatible catch-all for kinds this crate does not know
	#[serde(other)]
	Unknown,
}

/// Descriptor of a remote debuggable target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
	/// Opaque target id
	pub target_id: String,
	/// Target kind
	#[serde(rename = "type")]
	pub kind: TargetKind,
	/// Target title (page title for pages)
	#[serde(default)]
	pub title: String,
	/// Current URL
	#[serde(default)]
	pub url: String,
	/// Whether a debugging session is attached
	#[serde(default)]
	pub attached: bool,
	/// Target that opened this one, if any
	#[serde(skip_serializing_if = "Option::is_none")]
	pub opener_id: Option<String>,
	/// Browsing context this target belongs to; absent for the default context
	#[serde(skip_serializing_if = "Option::is_none")]
	pub browser_context_id: Option<String>,
}

impl TargetInfo {
	/// Returns `true` if this target should get its own debugging session.
	///
	/// The top-level browser target, generic "other" targets, and the
	/// browser's own debugger UI (`devtools://` pages) are driven through
	/// the root connection or not at all, and must not be attached to.
	pub fn is_attachable(&self) -> bool {
		!matches!(
			self.kind,
			TargetKind::Browser | TargetKind::Other | TargetKind::Unknown
		) && !self.url.starts_with("devtools://")
	}

	/// Returns `true` if this target materializes as a page in the object graph.
	pub fn is_page(&self) -> bool {
		matches!(self.kind, TargetKind::Page | TargetKind::BackgroundPage)
	}

	/// Returns `true` if this target runs without a visible tab.
	pub fn is_background(&self) -> bool {
		matches!(self.kind, TargetKind::BackgroundPage)
	}
}

/// Parameters of the "attached to target" notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedPayload {
	/// Id of the newly created session
	pub session_id: String,
	/// Descriptor of the target the session is attached to
	pub target_info: TargetInfo,
	/// Whether the target is paused waiting for a debugger
	#[serde(default)]
	pub waiting_for_debugger: bool,
}

/// Parameters of the "detached from target" notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedPayload {
	/// Id of the session that ended
	pub session_id: String,
	/// Target the session was attached to; not always echoed
	#[serde(skip_serializing_if = "Option::is_none")]
	pub target_id: Option<String>,
}
