//! Logical sessions multiplexed over one connection.
//!
//! A [`Session`] is an id-identified conversation with one attached target.
//! Frames scoped to the session are delivered, in order, to its inbound
//! queue and consumed by a dedicated task; commands issued through the
//! session carry its id on the wire. Upper layers talk to a session through
//! the same [`CommandExecutor`] interface as the root connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cdp_protocol::{EventMessage, Response};

use crate::connection::{CommandExecutor, Connection};
use crate::emitter::EventEmitter;
use crate::error::{Error, Result};

/// Inbound frame routed to a session's queue.
#[derive(Debug)]
pub(crate) enum SessionMessage {
	/// Reply to a command issued on this session
	Reply(Response),
	/// Event scoped to this session
	Event(EventMessage),
}

/// One logical conversation with an attached target.
pub struct Session {
	id: Arc<str>,
	target_id: Arc<str>,
	connection: Weak<Connection>,
	inbound_tx: mpsc::UnboundedSender<SessionMessage>,
	events: EventEmitter,
	cancel: CancellationToken,
}

impl Session {
	pub(crate) fn new(
		id: Arc<str>,
		target_id: Arc<str>,
		connection: Weak<Connection>,
		inbound_tx: mpsc::UnboundedSender<SessionMessage>,
		events: EventEmitter,
		cancel: CancellationToken,
	) -> Self {
		Self {
			id,
			target_id,
			connection,
			inbound_tx,
			events,
			cancel,
		}
	}

	/// Returns the session id.
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Returns the id of the target this session is attached to.
	pub fn target_id(&self) -> &str {
		&self.target_id
	}

	/// Events scoped to this session, fanned out by method name.
	pub fn events(&self) -> &EventEmitter {
		&self.events
	}

	/// Sends a command scoped to this session and awaits the reply.
	pub async fn execute(&self, method: &str, params: Value) -> Result<Value> {
		let connection = self.connection.upgrade().ok_or(Error::ConnectionClosed)?;
		connection.send_on_session(&self.id, method, params).await
	}

	/// Enqueues an inbound frame; returns false if the consumer is gone.
	pub(crate) fn push(&self, message: SessionMessage) -> bool {
		self.inbound_tx.send(message).is_ok()
	}

	/// Stops the consumer task. Safe to call more than once.
	pub(crate) fn cancel(&self) {
		self.cancel.cancel();
	}
}

impl CommandExecutor for Session {
	fn execute(
		&self,
		method: &str,
		params: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
		let method = method.to_string();
		Box::pin(async move { Session::execute(self, &method, params).await })
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.id)
			.field("target_id", &self.target_id)
			.finish()
	}
}
