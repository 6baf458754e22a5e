//! WebSocket transport for the DevTools wire protocol.
//!
//! One transport owns one socket. The sender half serializes outgoing frames;
//! the receiver half runs the single read loop for the connection, forwarding
//! each parsed frame to the inbound channel. There is no reconnect logic: a
//! transport that stops is gone.
//!
//! Closure is published through a [`watch`] channel so every dependent
//! component observes the same reason. A deliberate local close and an
//! unexpected loss are distinguishable; whichever is published first wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Why the connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
	/// Closed deliberately on this side.
	Closed,
	/// Dropped without a local close.
	Lost(String),
}

impl CloseReason {
	/// Converts the reason into the error a pending caller should see.
	pub fn into_error(self) -> Error {
		match self {
			CloseReason::Closed => Error::ConnectionClosed,
			CloseReason::Lost(message) => Error::ConnectionLost(message),
		}
	}
}

/// Shared close-signal publisher. First published reason wins.
pub(crate) fn publish_close(close: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
	close.send_if_modified(|slot| {
		if slot.is_none() {
			*slot = Some(reason);
			true
		} else {
			false
		}
	});
}

/// Boxed future returned by transport trait methods.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Write half of a transport.
pub trait Transport: Send {
	/// Serializes and writes one frame.
	fn send(&mut self, message: Value) -> TransportFuture<'_>;

	/// Closes the connection deliberately.
	fn close(&mut self) -> TransportFuture<'_>;
}

/// Read half of a transport; `run` is the connection's only read loop.
pub trait TransportReceiver: Send {
	/// Runs the read loop until close or failure.
	fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Everything a connection needs from an established transport.
pub struct TransportParts {
	/// Write half.
	pub sender: Box<dyn Transport>,
	/// Read half, to be driven by a dedicated task.
	pub receiver: Box<dyn TransportReceiver>,
	/// Inbound frames produced by the read loop.
	pub message_rx: mpsc::UnboundedReceiver<Value>,
	/// Publisher for the shared close signal.
	pub close_tx: Arc<watch::Sender<Option<CloseReason>>>,
	/// Subscriber side of the shared close signal.
	pub close_rx: watch::Receiver<Option<CloseReason>>,
}

/// WebSocket transport to a browser's debugging endpoint.
pub struct WebSocketTransport {
	sender: WebSocketSender,
	receiver: WebSocketReceiver,
	close_tx: Arc<watch::Sender<Option<CloseReason>>>,
	close_rx: watch::Receiver<Option<CloseReason>>,
}

impl WebSocketTransport {
	/// Performs the WebSocket handshake against `endpoint`, bounded by
	/// `timeout`, and returns the transport plus the inbound frame channel.
	pub async fn connect(
		endpoint: &str,
		timeout: Duration,
	) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
		tracing::debug!(endpoint, "connecting to DevTools endpoint");

		let (ws, _response) = tokio::time::timeout(timeout, connect_async(endpoint))
			.await
			.map_err(|_| Error::Timeout(format!("Timed out connecting to {endpoint}")))?
			.map_err(|e| Error::ConnectionFailed(e.to_string()))?;

		let (sink, stream) = ws.split();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let (close_tx, close_rx) = watch::channel(None);
		let close_tx = Arc::new(close_tx);

		tracing::debug!(endpoint, "DevTools connection established");

		Ok((
			Self {
				sender: WebSocketSender {
					sink,
					close: Arc::clone(&close_tx),
				},
				receiver: WebSocketReceiver {
					stream,
					message_tx,
					close: Arc::clone(&close_tx),
				},
				close_tx,
				close_rx,
			},
			message_rx,
		))
	}

	/// Returns a subscriber to the shared close signal.
	pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
		self.close_rx.clone()
	}

	/// Splits into concrete write and read halves.
	pub fn into_parts(self) -> (WebSocketSender, WebSocketReceiver) {
		(self.sender, self.receiver)
	}

	/// Packages the transport for handoff to a connection.
	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
		TransportParts {
			sender: Box::new(self.sender),
			receiver: Box::new(self.receiver),
			message_rx,
			close_tx: self.close_tx,
			close_rx: self.close_rx,
		}
	}
}

/// Write half of a [`WebSocketTransport`].
pub struct WebSocketSender {
	sink: WsSink,
	close: Arc<watch::Sender<Option<CloseReason>>>,
}

impl WebSocketSender {
	/// Serializes `message` and writes one text frame.
	pub async fn send(&mut self, message: Value) -> Result<()> {
		let text = serde_json::to_string(&message)?;
		if let Err(e) = self.sink.send(WsMessage::Text(text)).await {
			publish_close(&self.close, CloseReason::Lost(e.to_string()));
			return Err(Error::TransportError(format!("write failed: {e}")));
		}
		Ok(())
	}

	/// Closes the socket deliberately, publishing [`CloseReason::Closed`].
	pub async fn close(&mut self) -> Result<()> {
		publish_close(&self.close, CloseReason::Closed);
		let _ = self.sink.send(WsMessage::Close(None)).await;
		let _ = self.sink.close().await;
		Ok(())
	}
}

impl Transport for WebSocketSender {
	fn send(&mut self, message: Value) -> TransportFuture<'_> {
		Box::pin(async move { WebSocketSender::send(self, message).await })
	}

	fn close(&mut self) -> TransportFuture<'_> {
		Box::pin(async move { WebSocketSender::close(self).await })
	}
}

/// Read half of a [`WebSocketTransport`].
pub struct WebSocketReceiver {
	stream: WsStream,
	message_tx: mpsc::UnboundedSender<Value>,
	close: Arc<watch::Sender<Option<CloseReason>>>,
}

impl WebSocketReceiver {
	/// Runs the read loop until the socket closes or fails.
	///
	/// Returns `Ok` on a deliberate close and `Err` when the connection was
	/// lost unexpectedly; either way the close signal has been published
	/// before this returns.
	pub async fn run(mut self) -> Result<()> {
		while let Some(frame) = self.stream.next().await {
			let text = match frame {
				Ok(WsMessage::Text(text)) => text,
				Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
					Ok(text) => text,
					Err(_) => {
						tracing::debug!("ignoring non-UTF-8 binary frame");
						continue;
					}
				},
				Ok(WsMessage::Close(_)) => {
					tracing::debug!("close frame from remote");
					break;
				}
				Ok(_) => continue,
				Err(e) => {
					publish_close(&self.close, CloseReason::Lost(e.to_string()));
					return self.finish();
				}
			};

			let message: Value = match serde_json::from_str(&text) {
				Ok(value) => value,
				Err(e) => {
					tracing::warn!(error = %e, "failed to parse inbound frame");
					continue;
				}
			};

			if self.message_tx.send(message).is_err() {
				// Inbound consumer is gone; this side is shutting down.
				publish_close(&self.close, CloseReason::Closed);
				return Ok(());
			}
		}

		publish_close(
			&self.close,
			CloseReason::Lost("connection closed by remote".to_string()),
		);
		self.finish()
	}

	/// Maps the final published reason onto the loop's return value.
	fn finish(&self) -> Result<()> {
		match &*self.close.borrow() {
			Some(CloseReason::Closed) | None => Ok(()),
			Some(CloseReason::Lost(message)) => Err(Error::ConnectionLost(message.clone())),
		}
	}
}

impl TransportReceiver for WebSocketReceiver {
	fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move { WebSocketReceiver::run(*self).await })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;
	use tokio_tungstenite::accept_async;

	async fn bind() -> (TcpListener, String) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("ws://{}", listener.local_addr().unwrap());
		(listener, url)
	}

	#[tokio::test]
	async fn send_and_receive_frames() {
		let (listener, url) = bind().await;

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = accept_async(stream).await.unwrap();

			let frame = ws.next().await.unwrap().unwrap();
			let command: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
			assert_eq!(command["method"], "Browser.getVersion");

			let reply = serde_json::json!({"id": command["id"], "result": {}});
			ws.send(WsMessage::Text(reply.to_string())).await.unwrap();
			ws
		});

		let (transport, mut message_rx) =
			WebSocketTransport::connect(&url, Duration::from_secs(5)).await.unwrap();
		let (mut sender, receiver) = transport.into_parts();
		tokio::spawn(receiver.run());

		sender
			.send(serde_json::json!({"id": 1, "method": "Browser.getVersion", "params": {}}))
			.await
			.unwrap();

		let inbound = message_rx.recv().await.unwrap();
		assert_eq!(inbound["id"], 1);
		assert_eq!(inbound["result"], serde_json::json!({}));

		let _ws = server.await.unwrap();
	}

	#[tokio::test]
	async fn abrupt_server_drop_publishes_lost() {
		let (listener, url) = bind().await;

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let ws = accept_async(stream).await.unwrap();
			drop(ws);
		});

		let (transport, _message_rx) =
			WebSocketTransport::connect(&url, Duration::from_secs(5)).await.unwrap();
		let mut closed = transport.closed();
		let (_sender, receiver) = transport.into_parts();
		let read_task = tokio::spawn(receiver.run());

		server.await.unwrap();
		while closed.borrow_and_update().is_none() {
			closed.changed().await.unwrap();
		}
		assert!(matches!(&*closed.borrow(), Some(CloseReason::Lost(_))));

		let result = read_task.await.unwrap();
		assert!(result.is_err());
		assert!(result.unwrap_err().is_connection_lost());
	}

	#[tokio::test]
	async fn local_close_publishes_closed() {
		let (listener, url) = bind().await;

		let _server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut ws = accept_async(stream).await.unwrap();
			// Drain until the client goes away.
			while ws.next().await.is_some() {}
		});

		let (transport, _message_rx) =
			WebSocketTransport::connect(&url, Duration::from_secs(5)).await.unwrap();
		let mut closed = transport.closed();
		let (mut sender, receiver) = transport.into_parts();
		let read_task = tokio::spawn(receiver.run());

		sender.close().await.unwrap();

		while closed.borrow_and_update().is_none() {
			closed.changed().await.unwrap();
		}
		assert_eq!(*closed.borrow(), Some(CloseReason::Closed));

		// A deliberate close is not an error for the read loop.
		assert!(read_task.await.unwrap().is_ok());
	}

	#[tokio::test]
	async fn connect_times_out_when_handshake_stalls() {
		// Bound but never accepted: the TCP connect succeeds, the WebSocket
		// handshake never completes.
		let (_listener, url) = bind().await;

		let result = WebSocketTransport::connect(&url, Duration::from_millis(200)).await;
		assert!(matches!(result, Err(Error::Timeout(_))));
	}
}
