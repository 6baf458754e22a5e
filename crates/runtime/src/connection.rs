//! Connection layer for the DevTools protocol.
//!
//! This module implements the request/response correlation layer on top of
//! the transport. It handles:
//! - Generating unique command IDs
//! - Correlating replies with pending commands
//! - Classifying inbound frames (reply, session-scoped message, event)
//! - Fanning connection-wide events out by method name
//! - The registry of logical sessions multiplexed over the socket
//!
//! # Message Flow
//!
//! 1. Caller invokes `send()` (or `send_on_session()`) with method and params
//! 2. Connection assigns a unique ID and registers a oneshot callback
//! 3. The frame is queued to the writer task and put on the wire
//! 4. Caller awaits the oneshot receiver
//! 5. The dispatch loop classifies each inbound frame
//! 6. Replies are correlated by ID and resolve the waiting caller;
//!    session frames go to that session's queue; bare events fan out
//!    through the emitter

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use cdp_protocol::{
	AttachedPayload, Command, DetachedPayload, ErrorPayload, EventMessage, Message, Response,
};

use crate::emitter::EventEmitter;
use crate::error::{Error, Result};
use crate::session::{Session, SessionMessage};
use crate::transport::{
	CloseReason, Transport, TransportParts, TransportReceiver, publish_close,
};

/// Command-execution capability shared by the root connection and sessions.
///
/// Upper layers hold a `dyn CommandExecutor` and stay agnostic to whether
/// they talk to the browser-level connection or to one attached target.
pub trait CommandExecutor: Send + Sync {
	/// Sends a command and awaits the correlated reply.
	fn execute(
		&self,
		method: &str,
		params: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>>;
}

/// A registered pending command awaiting its reply.
struct PendingCommand {
	tx: oneshot::Sender<Result<Value>>,
	session_id: Option<Arc<str>>,
}

/// Pending command callbacks keyed by command ID.
type CallbackMap = Arc<TokioMutex<HashMap<u32, PendingCommand>>>;

/// Frame or control message for the writer task.
enum Outbound {
	Frame(Value),
	Shutdown,
}

/// RAII guard ensuring callback cleanup when a command future is dropped.
struct CancelGuard {
	id: u32,
	callbacks: CallbackMap,
	completed: bool,
}

impl CancelGuard {
	fn new(id: u32, callbacks: CallbackMap) -> Self {
		Self {
			id,
			callbacks,
			completed: false,
		}
	}

	fn complete(&mut self) {
		self.completed = true;
	}
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		let id = self.id;
		let callbacks = Arc::clone(&self.callbacks);

		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				if callbacks.lock().await.remove(&id).is_some() {
					tracing::debug!(id, "CancelGuard: removed orphaned callback");
				}
			});
		}
	}
}

/// Future returned by [`Connection::send`] with automatic cancellation cleanup.
struct ResponseFuture {
	rx: oneshot::Receiver<Result<Value>>,
	guard: CancelGuard,
}

impl Future for ResponseFuture {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.complete();
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

/// One physical connection to the browser, multiplexing many sessions.
///
/// Owns the pending-command table and the session registry; each is guarded
/// by its own lock, scoped to that single container.
pub struct Connection {
	/// Sequential command ID counter
	last_id: AtomicU32,
	/// Pending command callbacks keyed by command ID
	callbacks: CallbackMap,
	/// Channel for handing frames to the writer task
	outbound_tx: mpsc::UnboundedSender<Outbound>,
	/// Registry of live sessions by session id
	sessions: Arc<DashMap<Arc<str>, Arc<Session>>>,
	/// Connection-wide events, fanned out by method name
	events: EventEmitter,
	/// Publisher for the shared close signal
	close_tx: Arc<watch::Sender<Option<CloseReason>>>,
	/// Subscriber side of the shared close signal
	close_rx: watch::Receiver<Option<CloseReason>>,
	/// Transport write half (taken by run() to start the writer task)
	transport_sender: TokioMutex<Option<Box<dyn Transport>>>,
	/// Transport read half (taken by run() to start the read loop)
	transport_receiver: TokioMutex<Option<Box<dyn TransportReceiver>>>,
	/// Inbound frames from the read loop (taken by run())
	message_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
	/// Outbound frames for the writer task (taken by run())
	outbound_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
}

impl Connection {
	/// Creates a new Connection over an established transport.
	pub fn new(parts: TransportParts) -> Self {
		let TransportParts {
			sender,
			receiver,
			message_rx,
			close_tx,
			close_rx,
		} = parts;

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

		Self {
			last_id: AtomicU32::new(0),
			callbacks: Arc::new(TokioMutex::new(HashMap::new())),
			outbound_tx,
			sessions: Arc::new(DashMap::new()),
			events: EventEmitter::new(),
			close_tx,
			close_rx,
			transport_sender: TokioMutex::new(Some(sender)),
			transport_receiver: TokioMutex::new(Some(receiver)),
			message_rx: TokioMutex::new(Some(message_rx)),
			outbound_rx: TokioMutex::new(Some(outbound_rx)),
		}
	}

	/// Connection-wide events (frames with a method and no session id).
	pub fn events(&self) -> &EventEmitter {
		&self.events
	}

	/// Returns a subscriber to the shared close signal.
	pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
		self.close_rx.clone()
	}

	/// Sends a browser-level command and awaits the reply.
	pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
		self.send_internal(None, method, params).await
	}

	/// Sends a command scoped to one session and awaits the reply.
	pub async fn send_on_session(
		&self,
		session_id: &str,
		method: &str,
		params: Value,
	) -> Result<Value> {
		self.send_internal(Some(Arc::from(session_id)), method, params)
			.await
	}

	async fn send_internal(
		&self,
		session_id: Option<Arc<str>>,
		method: &str,
		params: Value,
	) -> Result<Value> {
		let id = self.last_id.fetch_add(1, Ordering::SeqCst);

		tracing::debug!(id, method, session = session_id.as_deref(), "sending command");

		let command = Command {
			id,
			method: method.to_string(),
			params,
			session_id: session_id.as_deref().map(str::to_string),
		};
		let frame = serde_json::to_value(&command)?;

		let (tx, rx) = oneshot::channel();
		self.callbacks
			.lock()
			.await
			.insert(id, PendingCommand { tx, session_id });

		let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

		if self.outbound_tx.send(Outbound::Frame(frame)).is_err() {
			return Err(Error::ChannelClosed);
		}

		ResponseFuture { rx, guard }.await
	}

	/// Runs the dispatch loop until the transport stops.
	///
	/// Starts the exclusive read loop and the writer task, then classifies
	/// every inbound frame. When the loop ends, every pending command is
	/// failed with the close reason and every session is removed.
	pub async fn run(self: &Arc<Self>) {
		let transport_receiver = self
			.transport_receiver
			.lock()
			.await
			.take()
			.expect("run() can only be called once - transport receiver already taken");

		let mut transport_sender = self
			.transport_sender
			.lock()
			.await
			.take()
			.expect("run() can only be called once - transport sender already taken");

		let mut outbound_rx = self
			.outbound_rx
			.lock()
			.await
			.take()
			.expect("run() can only be called once - outbound receiver already taken");

		let reader_handle = tokio::spawn(async move {
			if let Err(e) = transport_receiver.run().await {
				tracing::warn!(error = %e, "transport read loop ended");
			}
		});

		let writer_handle = tokio::spawn(async move {
			while let Some(outbound) = outbound_rx.recv().await {
				match outbound {
					Outbound::Frame(frame) => {
						if let Err(e) = transport_sender.send(frame).await {
							tracing::error!(error = %e, "transport write error");
							break;
						}
					}
					Outbound::Shutdown => {
						let _ = transport_sender.close().await;
						break;
					}
				}
			}
		});

		let mut message_rx = self
			.message_rx
			.lock()
			.await
			.take()
			.expect("run() can only be called once - message receiver already taken");

		while let Some(frame) = message_rx.recv().await {
			match serde_json::from_value::<Message>(frame) {
				Ok(message) => self.dispatch_internal(message).await,
				Err(e) => tracing::error!(error = %e, "failed to parse inbound frame"),
			}
		}

		self.teardown().await;

		let _ = reader_handle.await;
		let _ = writer_handle.await;
	}

	/// Dispatch an inbound frame (test-only public version).
	#[cfg(test)]
	pub(crate) async fn dispatch(self: &Arc<Self>, message: Message) {
		self.dispatch_internal(message).await;
	}

	async fn dispatch_internal(self: &Arc<Self>, message: Message) {
		match message {
			// Session-scoped frames go to that session's inbound queue. A
			// missing session is an expected attach/detach race, not an
			// error: drop the frame silently.
			Message::Response(response) if response.session_id.is_some() => {
				let session_id = response.session_id.clone().unwrap();
				match self.sessions.get(session_id.as_str()) {
					Some(session) => {
						session.push(SessionMessage::Reply(response));
					}
					None => {
						tracing::debug!(
							session = %session_id,
							id = response.id,
							"dropping reply for unknown session"
						);
					}
				}
			}
			Message::Event(event) if event.session_id.is_some() => {
				let session_id = event.session_id.clone().unwrap();
				match self.sessions.get(session_id.as_str()) {
					Some(session) => {
						session.push(SessionMessage::Event(event));
					}
					None => {
						tracing::debug!(
							session = %session_id,
							method = %event.method,
							"dropping event for unknown session"
						);
					}
				}
			}
			// Bare events are connection-wide; fan out by method name.
			Message::Event(event) => {
				self.handle_target_lifecycle(&event);
				self.events.emit(event.method, event.params).await;
			}
			Message::Response(response) => {
				self.resolve_reply(response).await;
			}
			Message::Unknown(value) => {
				tracing::debug!(frame = %value, "ignoring unknown frame shape");
			}
		}
	}

	/// Keeps the session registry in step with attach/detach notifications.
	///
	/// Runs synchronously in the dispatch path: frames scoped to a new
	/// session follow its attach notification in socket order, so the
	/// session must exist before the next frame is classified. Target kinds
	/// that are never attached to (the browser itself, generic "other"
	/// targets, the debugger UI) are skipped.
	fn handle_target_lifecycle(self: &Arc<Self>, event: &EventMessage) {
		match event.method.as_str() {
			"Target.attachedToTarget" => {
				match serde_json::from_value::<AttachedPayload>(event.params.clone()) {
					Ok(payload) if payload.target_info.is_attachable() => {
						self.register_session(&payload.session_id, &payload.target_info.target_id);
					}
					Ok(payload) => {
						tracing::debug!(
							target = %payload.target_info.target_id,
							kind = ?payload.target_info.kind,
							"not attaching to target"
						);
					}
					Err(e) => tracing::warn!(error = %e, "malformed attach notification"),
				}
			}
			"Target.detachedFromTarget" => {
				match serde_json::from_value::<DetachedPayload>(event.params.clone()) {
					Ok(payload) => self.remove_session(&payload.session_id),
					Err(e) => tracing::warn!(error = %e, "malformed detach notification"),
				}
			}
			_ => {}
		}
	}

	/// Resolves the pending command matching a reply.
	pub(crate) async fn resolve_reply(&self, response: Response) {
		let pending = self.callbacks.lock().await.remove(&response.id);
		let Some(pending) = pending else {
			tracing::debug!(id = response.id, "reply for unknown command id");
			return;
		};

		let result = match response.error {
			// The remote is reporting that the addressed session already
			// ended. Remove the mapping instead of failing the caller.
			Some(error) if is_session_gone(&error) => {
				if let Some(session_id) = pending.session_id.as_deref() {
					tracing::debug!(session = session_id, "remote reports session gone");
					self.remove_session(session_id);
				}
				Ok(Value::Null)
			}
			Some(error) => Err(Error::Remote {
				code: error.code,
				message: error.message,
				data: error.data,
			}),
			None => Ok(response.result.unwrap_or(Value::Null)),
		};

		let _ = pending.tx.send(result);
	}

	/// Registers a session, spawning its consumer task.
	///
	/// Idempotent: registering an id that is already live returns the
	/// existing session, never a second one.
	pub fn register_session(self: &Arc<Self>, session_id: &str, target_id: &str) -> Arc<Session> {
		use dashmap::mapref::entry::Entry;

		match self.sessions.entry(Arc::from(session_id)) {
			Entry::Occupied(entry) => Arc::clone(entry.get()),
			Entry::Vacant(entry) => {
				let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
				let events = EventEmitter::new();
				let cancel = CancellationToken::new();
				let session = Arc::new(Session::new(
					Arc::from(session_id),
					Arc::from(target_id),
					Arc::downgrade(self),
					inbound_tx,
					events.clone(),
					cancel.clone(),
				));
				entry.insert(Arc::clone(&session));
				spawn_session_consumer(Arc::downgrade(self), inbound_rx, cancel, events);
				tracing::debug!(session = session_id, target = target_id, "session registered");
				session
			}
		}
	}

	/// Attaches to a target and registers the resulting session.
	///
	/// The attach *event* may race in before the command's reply; since
	/// registration is idempotent on the session id, both paths converge on
	/// one live session.
	pub async fn create_session(self: &Arc<Self>, target_id: &str) -> Result<Arc<Session>> {
		let result = self
			.send(
				"Target.attachToTarget",
				serde_json::json!({"targetId": target_id, "flatten": true}),
			)
			.await?;
		let session_id = result["sessionId"].as_str().ok_or_else(|| {
			Error::ProtocolError("attach reply missing sessionId".to_string())
		})?;
		Ok(self.register_session(session_id, target_id))
	}

	/// Removes a session and stops its consumer.
	///
	/// Safe under concurrent or duplicate calls: removing an id that is
	/// already gone is a no-op.
	pub fn remove_session(&self, session_id: &str) {
		if let Some((_, session)) = self.sessions.remove(session_id) {
			session.cancel();
			tracing::debug!(session = session_id, "session removed");
		}
	}

	/// Looks up a live session by id.
	pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
		self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
	}

	/// Closes the connection deliberately.
	///
	/// The close reason is published before the socket goes down so that
	/// the read loop's exit is not misread as a loss.
	pub async fn close(&self) {
		publish_close(&self.close_tx, CloseReason::Closed);
		let _ = self.outbound_tx.send(Outbound::Shutdown);
	}

	/// Fails every pending command and removes every session.
	async fn teardown(&self) {
		let reason = self
			.close_rx
			.borrow()
			.clone()
			.unwrap_or_else(|| CloseReason::Lost("connection terminated".to_string()));

		let mut callbacks = self.callbacks.lock().await;
		for (_, pending) in callbacks.drain() {
			let _ = pending.tx.send(Err(reason.clone().into_error()));
		}
		drop(callbacks);

		let ids: Vec<Arc<str>> = self.sessions.iter().map(|e| Arc::clone(e.key())).collect();
		for id in ids {
			self.remove_session(&id);
		}

		tracing::debug!(?reason, "connection teardown complete");
	}
}

impl CommandExecutor for Connection {
	fn execute(
		&self,
		method: &str,
		params: Value,
	) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + '_>> {
		let method = method.to_string();
		Box::pin(async move { Connection::send(self, &method, params).await })
	}
}

/// Returns true for the error payload reporting an already-ended session.
fn is_session_gone(error: &ErrorPayload) -> bool {
	error.message.to_ascii_lowercase().contains("session with given id")
}

/// Consumer task draining one session's inbound queue in order.
fn spawn_session_consumer(
	connection: std::sync::Weak<Connection>,
	mut inbound_rx: mpsc::UnboundedReceiver<SessionMessage>,
	cancel: CancellationToken,
	events: EventEmitter,
) {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				message = inbound_rx.recv() => match message {
					None => break,
					Some(SessionMessage::Reply(reply)) => {
						let Some(connection) = connection.upgrade() else { break };
						connection.resolve_reply(reply).await;
					}
					Some(SessionMessage::Event(event)) => {
						events.emit(event.method, event.params).await;
					}
				},
			}
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::TransportFuture;
	use cdp_protocol::EventMessage;

	/// Test transport capturing outgoing frames on a channel.
	struct ChannelTransport {
		frames: mpsc::UnboundedSender<Value>,
		close: Arc<watch::Sender<Option<CloseReason>>>,
	}

	impl Transport for ChannelTransport {
		fn send(&mut self, message: Value) -> TransportFuture<'_> {
			let result = self
				.frames
				.send(message)
				.map_err(|_| Error::TransportError("test sink closed".to_string()));
			Box::pin(async move { result })
		}

		fn close(&mut self) -> TransportFuture<'_> {
			publish_close(&self.close, CloseReason::Closed);
			Box::pin(async move { Ok(()) })
		}
	}

	/// Test receiver that idles until the close signal fires.
	struct IdleReceiver {
		close: watch::Receiver<Option<CloseReason>>,
	}

	impl TransportReceiver for IdleReceiver {
		fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
			let mut close = self.close;
			Box::pin(async move {
				while close.borrow_and_update().is_none() {
					if close.changed().await.is_err() {
						break;
					}
				}
				Ok(())
			})
		}
	}

	struct TestWires {
		frames_rx: mpsc::UnboundedReceiver<Value>,
		message_tx: mpsc::UnboundedSender<Value>,
	}

	fn create_test_connection() -> (Arc<Connection>, TestWires) {
		let (frames_tx, frames_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let (close_tx, close_rx) = watch::channel(None);
		let close_tx = Arc::new(close_tx);

		let parts = TransportParts {
			sender: Box::new(ChannelTransport {
				frames: frames_tx,
				close: Arc::clone(&close_tx),
			}),
			receiver: Box::new(IdleReceiver {
				close: close_rx.clone(),
			}),
			message_rx,
			close_tx,
			close_rx,
		};

		(
			Arc::new(Connection::new(parts)),
			TestWires {
				frames_rx,
				message_tx,
			},
		)
	}

	fn reply(id: u32, result: Value) -> Message {
		Message::Response(Response {
			id,
			result: Some(result),
			error: None,
			session_id: None,
		})
	}

	#[tokio::test]
	async fn command_ids_increment() {
		let (connection, _wires) = create_test_connection();

		let id1 = connection.last_id.fetch_add(1, Ordering::SeqCst);
		let id2 = connection.last_id.fetch_add(1, Ordering::SeqCst);
		let id3 = connection.last_id.fetch_add(1, Ordering::SeqCst);

		assert_eq!(id1, 0);
		assert_eq!(id2, 1);
		assert_eq!(id3, 2);
	}

	#[tokio::test]
	async fn dispatch_reply_resolves_pending() {
		let (connection, _wires) = create_test_connection();

		let (tx, rx) = oneshot::channel();
		connection
			.callbacks
			.lock()
			.await
			.insert(5, PendingCommand { tx, session_id: None });

		connection
			.dispatch(reply(5, serde_json::json!({"status": "ok"})))
			.await;

		let result = rx.await.unwrap().unwrap();
		assert_eq!(result["status"], "ok");
	}

	#[tokio::test]
	async fn dispatch_error_reply_fails_only_that_caller() {
		let (connection, _wires) = create_test_connection();

		let (tx, rx) = oneshot::channel();
		connection
			.callbacks
			.lock()
			.await
			.insert(7, PendingCommand { tx, session_id: None });

		connection
			.dispatch(Message::Response(Response {
				id: 7,
				result: None,
				error: Some(ErrorPayload {
					code: -32000,
					message: "Target closed".to_string(),
					data: None,
				}),
				session_id: None,
			}))
			.await;

		let err = rx.await.unwrap().unwrap_err();
		assert_eq!(err.remote_code(), Some(-32000));
	}

	#[tokio::test]
	async fn bare_events_fan_out_by_method() {
		let (connection, _wires) = create_test_connection();
		let mut created = connection
			.events()
			.subscribe(Some("Target.targetCreated"), 16)
			.await;

		connection
			.dispatch(Message::Event(EventMessage {
				method: "Target.targetCreated".to_string(),
				params: serde_json::json!({"targetInfo": {"targetId": "t1"}}),
				session_id: None,
			}))
			.await;

		let event = created.recv().await.unwrap();
		assert_eq!(event.data["targetInfo"]["targetId"], "t1");
	}

	#[tokio::test]
	async fn session_scoped_events_route_to_that_session() {
		let (connection, _wires) = create_test_connection();
		let session = connection.register_session("session-1", "target-1");
		let mut console = session.events().subscribe(Some("Runtime.consoleAPICalled"), 16).await;

		connection
			.dispatch(Message::Event(EventMessage {
				method: "Runtime.consoleAPICalled".to_string(),
				params: serde_json::json!({"type": "log"}),
				session_id: Some("session-1".to_string()),
			}))
			.await;

		let event = console.recv().await.unwrap();
		assert_eq!(event.data["type"], "log");
	}

	#[tokio::test]
	async fn frames_for_unknown_sessions_are_dropped_silently() {
		let (connection, _wires) = create_test_connection();

		// Must not panic or error; the race is expected.
		connection
			.dispatch(Message::Event(EventMessage {
				method: "Runtime.consoleAPICalled".to_string(),
				params: Value::Null,
				session_id: Some("never-registered".to_string()),
			}))
			.await;
		connection
			.dispatch(Message::Response(Response {
				id: 99,
				result: Some(Value::Null),
				error: None,
				session_id: Some("never-registered".to_string()),
			}))
			.await;
	}

	fn attach_event(session_id: &str, target_id: &str, kind: &str) -> Message {
		Message::Event(EventMessage {
			method: "Target.attachedToTarget".to_string(),
			params: serde_json::json!({
				"sessionId": session_id,
				"targetInfo": {
					"targetId": target_id,
					"type": kind,
					"url": "about:blank",
					"attached": true,
				},
				"waitingForDebugger": false,
			}),
			session_id: None,
		})
	}

	#[tokio::test]
	async fn attach_notification_registers_before_further_dispatch() {
		let (connection, _wires) = create_test_connection();

		connection.dispatch(attach_event("session-1", "target-1", "page")).await;

		// The session exists as soon as the attach frame was classified,
		// so the very next session-scoped frame finds it.
		let session = connection.session("session-1").expect("session registered");
		let mut loads = session.events().subscribe(Some("Page.loadEventFired"), 16).await;

		connection
			.dispatch(Message::Event(EventMessage {
				method: "Page.loadEventFired".to_string(),
				params: serde_json::json!({"timestamp": 1.0}),
				session_id: Some("session-1".to_string()),
			}))
			.await;

		let event = loads.recv().await.unwrap();
		assert_eq!(event.data["timestamp"], 1.0);
	}

	#[tokio::test]
	async fn attach_for_browser_and_other_targets_is_skipped() {
		let (connection, _wires) = create_test_connection();

		connection.dispatch(attach_event("session-b", "target-b", "browser")).await;
		connection.dispatch(attach_event("session-o", "target-o", "other")).await;

		assert!(connection.session("session-b").is_none());
		assert!(connection.session("session-o").is_none());
	}

	#[tokio::test]
	async fn detach_notification_removes_the_session() {
		let (connection, _wires) = create_test_connection();

		connection.dispatch(attach_event("session-1", "target-1", "page")).await;
		assert!(connection.session("session-1").is_some());

		let detach = Message::Event(EventMessage {
			method: "Target.detachedFromTarget".to_string(),
			params: serde_json::json!({"sessionId": "session-1"}),
			session_id: None,
		});
		connection.dispatch(detach.clone()).await;
		assert!(connection.session("session-1").is_none());

		// A duplicate detach is a no-op.
		connection.dispatch(detach).await;
		assert!(connection.session("session-1").is_none());
	}

	#[tokio::test]
	async fn duplicate_registration_returns_the_same_session() {
		let (connection, _wires) = create_test_connection();

		let first = connection.register_session("session-1", "target-1");
		let second = connection.register_session("session-1", "target-1");

		assert!(Arc::ptr_eq(&first, &second));
	}

	#[tokio::test]
	async fn remove_session_is_idempotent() {
		let (connection, _wires) = create_test_connection();

		connection.register_session("session-1", "target-1");
		assert!(connection.session("session-1").is_some());

		connection.remove_session("session-1");
		connection.remove_session("session-1");
		assert!(connection.session("session-1").is_none());
	}

	#[tokio::test]
	async fn session_gone_error_removes_session_without_failing_caller() {
		let (connection, _wires) = create_test_connection();
		connection.register_session("session-1", "target-1");

		let (tx, rx) = oneshot::channel();
		connection.callbacks.lock().await.insert(
			3,
			PendingCommand {
				tx,
				session_id: Some(Arc::from("session-1")),
			},
		);

		connection
			.dispatch(Message::Response(Response {
				id: 3,
				result: None,
				error: Some(ErrorPayload {
					code: -32001,
					message: "Session with given id not found.".to_string(),
					data: None,
				}),
				session_id: None,
			}))
			.await;

		let result = rx.await.unwrap();
		assert!(result.is_ok(), "caller must not see the session-gone error");
		assert!(connection.session("session-1").is_none());
	}

	#[tokio::test]
	async fn send_writes_frame_and_resolves_on_reply() {
		let (connection, mut wires) = create_test_connection();
		{
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.run().await });
		}

		let caller = {
			let connection = Arc::clone(&connection);
			tokio::spawn(async move {
				connection
					.send("Browser.getVersion", serde_json::json!({}))
					.await
			})
		};

		let frame = wires.frames_rx.recv().await.unwrap();
		assert_eq!(frame["method"], "Browser.getVersion");
		let id = frame["id"].as_u64().unwrap();

		wires
			.message_tx
			.send(serde_json::json!({"id": id, "result": {"product": "Chromium"}}))
			.unwrap();

		let result = caller.await.unwrap().unwrap();
		assert_eq!(result["product"], "Chromium");
	}

	#[tokio::test]
	async fn teardown_fails_pending_commands_with_close_reason() {
		let (connection, mut wires) = create_test_connection();
		{
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.run().await });
		}

		let caller = {
			let connection = Arc::clone(&connection);
			tokio::spawn(async move {
				connection.send("Browser.getVersion", serde_json::json!({})).await
			})
		};

		// Wait for the command to hit the wire, then kill the inbound side
		// without a local close: the connection was lost.
		let _frame = wires.frames_rx.recv().await.unwrap();
		drop(wires.message_tx);

		let err = caller.await.unwrap().unwrap_err();
		assert!(err.is_connection_lost(), "got: {err:?}");
	}

	#[tokio::test]
	async fn explicit_close_fails_pending_with_closed() {
		let (connection, mut wires) = create_test_connection();
		{
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.run().await });
		}

		let caller = {
			let connection = Arc::clone(&connection);
			tokio::spawn(async move {
				connection.send("Browser.getVersion", serde_json::json!({})).await
			})
		};
		let _frame = wires.frames_rx.recv().await.unwrap();

		connection.close().await;
		// The test receiver exits on the close signal; dropping the inbound
		// sender here stands in for the read loop finishing.
		drop(wires.message_tx);

		let err = caller.await.unwrap().unwrap_err();
		assert!(matches!(err, Error::ConnectionClosed), "got: {err:?}");
	}

	#[tokio::test]
	async fn teardown_removes_all_sessions() {
		let (connection, wires) = create_test_connection();
		connection.register_session("session-1", "target-1");
		connection.register_session("session-2", "target-2");

		{
			let connection = Arc::clone(&connection);
			tokio::spawn(async move { connection.run().await });
		}
		drop(wires.message_tx);

		// Give the run loop a moment to tear down.
		tokio::time::sleep(std::time::Duration::from_millis(50)).await;
		assert!(connection.session("session-1").is_none());
		assert!(connection.session("session-2").is_none());
	}
}
