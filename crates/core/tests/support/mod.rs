//! Scripted stand-in for a browser's DevTools endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Knobs for the scripted endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeBrowserConfig {
	/// Emit the attach notification before the createTarget reply, the way
	/// a real browser often does.
	pub attach_before_reply: bool,
}

/// One scripted DevTools endpoint serving a single connection.
pub struct FakeBrowser {
	pub url: String,
	push_tx: mpsc::UnboundedSender<Value>,
	commands: Arc<Mutex<Vec<Value>>>,
	browser_close_count: Arc<AtomicUsize>,
}

impl FakeBrowser {
	pub async fn start() -> Self {
		Self::start_with(FakeBrowserConfig::default()).await
	}

	pub async fn start_with(config: FakeBrowserConfig) -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let url = format!("ws://{}", listener.local_addr().unwrap());
		let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Value>();
		let commands = Arc::new(Mutex::new(Vec::new()));
		let browser_close_count = Arc::new(AtomicUsize::new(0));

		{
			let commands = Arc::clone(&commands);
			let close_count = Arc::clone(&browser_close_count);
			tokio::spawn(async move {
				let (tcp, _) = listener.accept().await.unwrap();
				let ws = accept_async(tcp).await.unwrap();
				let (mut sink, mut stream) = ws.split();
				let mut serial = 0u32;

				loop {
					tokio::select! {
						pushed = push_rx.recv() => match pushed {
							Some(frame) => {
								if sink.send(WsMessage::Text(frame.to_string())).await.is_err() {
									break;
								}
							}
							None => break,
						},
						frame = stream.next() => {
							let Some(Ok(frame)) = frame else { break };
							let Ok(text) = frame.into_text() else { continue };
							let Ok(command) = serde_json::from_str::<Value>(&text) else {
								continue;
							};
							commands.lock().push(command.clone());

							let id = command["id"].clone();
							let method = command["method"].as_str().unwrap_or_default();
							match method {
								"Target.createTarget" => {
									serial += 1;
									let target_id = format!("target-{serial}");
									let session_id = format!("session-{serial}");
									let context_id = command["params"]["browserContextId"]
										.as_str()
										.map(str::to_string);

									let attach = attached_event(
										&session_id,
										&target_id,
										"page",
										"about:blank",
										context_id.as_deref(),
									);
									let reply =
										json!({"id": id, "result": {"targetId": target_id}});

									if config.attach_before_reply {
										let _ = sink.send(WsMessage::Text(attach.to_string())).await;
										let _ = sink.send(WsMessage::Text(reply.to_string())).await;
									} else {
										let _ = sink.send(WsMessage::Text(reply.to_string())).await;
										let _ = sink.send(WsMessage::Text(attach.to_string())).await;
									}
								}
								"Target.createBrowserContext" => {
									serial += 1;
									let reply = json!({
										"id": id,
										"result": {"browserContextId": format!("ctx-{serial}")}
									});
									let _ = sink.send(WsMessage::Text(reply.to_string())).await;
								}
								"Browser.close" => {
									close_count.fetch_add(1, Ordering::SeqCst);
									let reply = json!({"id": id, "result": {}});
									let _ = sink.send(WsMessage::Text(reply.to_string())).await;
									let _ = sink.send(WsMessage::Close(None)).await;
									break;
								}
								"Page.close" => {
									let session = command["sessionId"]
										.as_str()
										.unwrap_or_default()
										.to_string();
									let reply = json!({
										"id": id,
										"sessionId": session,
										"result": {}
									});
									let _ = sink.send(WsMessage::Text(reply.to_string())).await;
									let detach = json!({
										"method": "Target.detachedFromTarget",
										"params": {"sessionId": session}
									});
									let _ = sink.send(WsMessage::Text(detach.to_string())).await;
								}
								_ => {
									let reply = json!({"id": id, "result": {}});
									let _ = sink.send(WsMessage::Text(reply.to_string())).await;
								}
							}
						}
					}
				}
			});
		}

		Self {
			url,
			push_tx,
			commands,
			browser_close_count,
		}
	}

	/// Pushes an arbitrary frame to the client.
	pub fn push(&self, frame: Value) {
		let _ = self.push_tx.send(frame);
	}

	/// Pushes an "attached to target" notification.
	pub fn push_attached(&self, session_id: &str, target_id: &str, kind: &str, url: &str) {
		self.push(attached_event(session_id, target_id, kind, url, None));
	}

	/// Pushes a "detached from target" notification.
	pub fn push_detached(&self, session_id: &str) {
		self.push(json!({
			"method": "Target.detachedFromTarget",
			"params": {"sessionId": session_id}
		}));
	}

	/// Every command frame received so far.
	pub fn commands(&self) -> Vec<Value> {
		self.commands.lock().clone()
	}

	/// How many times the client asked the browser to close.
	pub fn browser_close_count(&self) -> usize {
		self.browser_close_count.load(Ordering::SeqCst)
	}
}

/// Builds an "attached to target" event frame.
pub fn attached_event(
	session_id: &str,
	target_id: &str,
	kind: &str,
	url: &str,
	context_id: Option<&str>,
) -> Value {
	let mut target_info = json!({
		"targetId": target_id,
		"type": kind,
		"title": "",
		"url": url,
		"attached": true,
	});
	if let Some(ctx) = context_id {
		target_info["browserContextId"] = Value::String(ctx.to_string());
	}
	json!({
		"method": "Target.attachedToTarget",
		"params": {
			"sessionId": session_id,
			"targetInfo": target_info,
			"waitingForDebugger": false,
		}
	})
}
