//! Protocol frame types.
//!
//! Every frame on the wire is one of three shapes:
//! - `{id, method, params, sessionId?}` - an outgoing command
//! - `{id, result|error, sessionId?}` - a reply correlated by `id`
//! - `{method, params, sessionId?}` - an asynchronous event
//!
//! A `sessionId` scopes the frame to one attached target; frames without it
//! address the browser-level connection itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
	/// Unique command id for correlating the reply
	pub id: u32,
	/// Method name to invoke (e.g. "Target.createTarget")
	pub method: String,
	/// Method parameters as a JSON object
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub params: Value,
	/// Session this command is scoped to, if any
	#[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Reply frame from the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	/// Command id this reply correlates to
	pub id: u32,
	/// Success result (mutually exclusive with error)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	/// Error result (mutually exclusive with result)
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
	/// Session the original command was scoped to, if any
	#[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Error object carried by a failed reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
	/// JSON-RPC style error code
	pub code: i64,
	/// Human-readable error message
	pub message: String,
	/// Additional error detail, if any
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
}

/// Asynchronous event frame pushed by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
	/// Event method name (e.g. "Target.attachedToTarget")
	pub method: String,
	/// Event parameters as a JSON object
	#[serde(default)]
	pub params: Value,
	/// Session this event is scoped to, if any
	#[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
}

/// Discriminated union of inbound protocol frames.
///
/// Classification is by shape: a frame carrying an `id` is a reply, a frame
/// carrying only a `method` is an event. Anything else falls through to the
/// forward-compatible catch-all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
	/// Reply frame (has `id`)
	Response(Response),
	/// Event frame (has `method`, no `id`)
	Event(EventMessage),
	/// Unknown frame shape (forward-compatible catch-all)
	Unknown(Value),
}

impl Message {
	/// Returns the session id the frame is scoped to, if any.
	pub fn session_id(&self) -> Option<&str> {
		match self {
			Message::Response(r) => r.session_id.as_deref(),
			Message::Event(e) => e.session_id.as_deref(),
			Message::Unknown(_) => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_serializes_without_session_id() {
		let cmd = Command {
			id: 7,
			method: "Target.setDiscoverTargets".to_string(),
			params: serde_json::json!({"discover": true}),
			session_id: None,
		};
		let json = serde_json::to_value(&cmd).unwrap();
		assert_eq!(json["id"], 7);
		assert_eq!(json["method"], "Target.setDiscoverTargets");
		assert_eq!(json["params"]["discover"], true);
		assert!(json.get("sessionId").is_none());
	}

	#[test]
	fn command_serializes_with_session_id() {
		let cmd = Command {
			id: 8,
			method: "Runtime.evaluate".to_string(),
			params: serde_json::json!({"expression": "1 + 1"}),
			session_id: Some("session-1".to_string()),
		};
		let json = serde_json::to_value(&cmd).unwrap();
		assert_eq!(json["sessionId"], "session-1");
	}

	#[test]
	fn reply_frame_classified_as_response() {
		let json = r#"{"id": 42, "result": {"targetId": "t1"}}"#;
		let message: Message = serde_json::from_str(json).unwrap();
		match message {
			Message::Response(response) => {
				assert_eq!(response.id, 42);
				assert!(response.result.is_some());
				assert!(response.error.is_none());
				assert!(response.session_id.is_none());
			}
			_ => panic!("Expected Response"),
		}
	}

	#[test]
	fn session_scoped_reply_keeps_session_id() {
		let json = r#"{"id": 3, "result": {}, "sessionId": "session-9"}"#;
		let message: Message = serde_json::from_str(json).unwrap();
		assert_eq!(message.session_id(), Some("session-9"));
	}

	#[test]
	fn event_frame_classified_as_event() {
		let json = r#"{"method": "Target.targetCreated", "params": {"targetInfo": {}}}"#;
		let message: Message = serde_json::from_str(json).unwrap();
		match message {
			Message::Event(event) => {
				assert_eq!(event.method, "Target.targetCreated");
				assert!(event.session_id.is_none());
			}
			_ => panic!("Expected Event"),
		}
	}

	#[test]
	fn unknown_frame_falls_through() {
		let json = r#"{"something": "else"}"#;
		let message: Message = serde_json::from_str(json).unwrap();
		assert!(matches!(message, Message::Unknown(_)));
	}

	#[test]
	fn error_payload_deserializes() {
		let json = r#"{"code": -32601, "message": "Method not found"}"#;
		let err: ErrorPayload = serde_json::from_str(json).unwrap();
		assert_eq!(err.code, -32601);
		assert_eq!(err.message, "Method not found");
		assert!(err.data.is_none());
	}
}
