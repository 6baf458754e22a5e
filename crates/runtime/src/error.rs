//! Error types for the DevTools runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the DevTools runtime.
#[derive(Debug, Error)]
pub enum Error {
	/// No browser executable could be located.
	#[error("Browser executable not found. Set CDP_BROWSER_PATH or install Chromium.")]
	BrowserNotFound,

	/// Failed to launch the browser process.
	#[error("Failed to launch browser: {0}")]
	LaunchFailed(String),

	/// The browser process exited before the debugging endpoint was ready.
	#[error("Browser process exited before the DevTools endpoint was ready: {message}")]
	ProcessExited {
		/// First error line from the process output, or the exit status
		message: String,
	},

	/// Failed to establish the WebSocket connection.
	#[error("Failed to connect to DevTools endpoint: {0}")]
	ConnectionFailed(String),

	/// The connection was closed deliberately on this side.
	#[error("Connection closed")]
	ConnectionClosed,

	/// The connection dropped without us asking for it.
	#[error("Connection lost: {0}")]
	ConnectionLost(String),

	/// Transport-level error (socket write, framing).
	#[error("Transport error: {0}")]
	TransportError(String),

	/// Protocol-level error (malformed or unexpected frame).
	#[error("Protocol error: {0}")]
	ProtocolError(String),

	/// Error payload returned by the browser for a specific command.
	#[error("{message} (code {code})")]
	Remote {
		/// Protocol error code
		code: i64,
		/// Human-readable error message
		message: String,
		/// Additional error detail, if any
		data: Option<String>,
	},

	/// Operation on a target that has already gone away.
	#[error("Target closed: {0}")]
	TargetClosed(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	/// Timeout waiting for an operation.
	#[error("Timeout: {0}")]
	Timeout(String),

	/// Channel closed unexpectedly.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,
}

impl Error {
	/// Returns true if this is a timeout error.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout(_))
	}

	/// Returns true if the connection dropped without a local close.
	pub fn is_connection_lost(&self) -> bool {
		matches!(self, Error::ConnectionLost(_))
	}

	/// Returns the protocol error code if this is a remote error.
	pub fn remote_code(&self) -> Option<i64> {
		match self {
			Error::Remote { code, .. } => Some(*code),
			_ => None,
		}
	}
}
