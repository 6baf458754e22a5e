// Copyright 2024 Paul Adamson
// Licensed under the Apache License, Version 2.0

//! Ordered, cancellation-safe event fan-out.
//!
//! An [`EventEmitter`] lets any number of independent subscribers observe a
//! stream of named events, each in the exact order emitted, without one slow
//! or cancelled subscriber delaying delivery to any other.
//!
//! # Design
//!
//! All registration, emission, and pruning for one emitter instance are
//! serialized through a single owning task (an actor) that receives requests
//! over a queue and acknowledges each when done. The emitter's internal state
//! is therefore never shared across tasks, and unrelated emitter instances
//! never contend on a common lock.
//!
//! Each subscription owns a [`DoubleBuffer`]: emission appends to the write
//! buffer under a narrow lock, while a dedicated delivery task drains the
//! read buffer it owns exclusively, swapping the two when it runs dry. An
//! emit therefore never blocks on a slow consumer beyond the cost of an
//! append, and delivery never competes with emission for the same buffer.
//!
//! Delivery to a subscriber's destination queue is a blocking send raced
//! against that subscriber's cancellation token. Once cancelled, no further
//! delivery occurs, and the subscription is pruned from the active set on
//! the next emission pass. Dropped delivery to a cancelled subscriber is
//! silent by design.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A named event with an opaque payload.
#[derive(Debug, Clone)]
pub struct Emitted {
	/// Event name (method name for protocol events)
	pub name: Arc<str>,
	/// Event payload, opaque to the emitter
	pub data: Value,
}

/// Two-buffer FIFO shared between one producer side and one consumer.
///
/// Producers append to the `write` buffer under a short lock. The single
/// consumer drains a read buffer it owns exclusively and calls
/// [`swap_into`](Self::swap_into) when that runs dry, exchanging the two
/// buffers in O(1).
///
/// Invariants:
/// - there is exactly one consumer, and `swap_into` is only called with an
///   empty read buffer;
/// - elements move write-to-read in a single swap, preserving append order;
/// - an element pushed after a swap lands in the fresh write buffer and is
///   picked up by the next swap, never lost.
pub struct DoubleBuffer<T> {
	write: Mutex<Vec<T>>,
	notify: Notify,
}

impl<T> DoubleBuffer<T> {
	/// Creates an empty buffer pair.
	pub fn new() -> Self {
		Self {
			write: Mutex::new(Vec::new()),
			notify: Notify::new(),
		}
	}

	/// Appends one element to the write buffer and wakes the consumer.
	pub fn push(&self, value: T) {
		self.write.lock().push(value);
		self.notify.notify_one();
	}

	/// Exchanges the write buffer with the consumer's (empty) read buffer.
	pub fn swap_into(&self, read: &mut Vec<T>) {
		debug_assert!(read.is_empty(), "swap_into requires a drained read buffer");
		std::mem::swap(&mut *self.write.lock(), read);
	}

	/// Waits until at least one push happened since the last wakeup.
	pub async fn wait(&self) {
		self.notify.notified().await;
	}

	/// Number of elements currently pending on the write side.
	pub fn pending(&self) -> usize {
		self.write.lock().len()
	}
}

impl<T> Default for DoubleBuffer<T> {
	fn default() -> Self {
		Self::new()
	}
}

/// A subscription request handed to the emitter.
pub struct SubscriptionRequest {
	/// Only events with this exact name are delivered; `None` means all
	pub filter: Option<Arc<str>>,
	/// Destination queue for delivered events
	pub destination: mpsc::Sender<Emitted>,
	/// Cancelling this token stops delivery and prunes the subscription
	pub cancel: CancellationToken,
}

struct ActiveSubscription {
	filter: Option<Arc<str>>,
	buffer: Arc<DoubleBuffer<Emitted>>,
	cancel: CancellationToken,
}

enum EmitterOp {
	Subscribe {
		request: SubscriptionRequest,
		done: oneshot::Sender<()>,
	},
	Emit {
		name: Arc<str>,
		data: Value,
		done: oneshot::Sender<()>,
	},
	Count {
		reply: oneshot::Sender<usize>,
	},
}

/// Ordered pub/sub dispatcher backed by a single owning actor task.
#[derive(Clone)]
pub struct EventEmitter {
	ops: mpsc::UnboundedSender<EmitterOp>,
}

impl EventEmitter {
	/// Creates the emitter and spawns its owning actor task.
	///
	/// The actor exits when the last emitter handle is dropped, cancelling
	/// every remaining subscription.
	pub fn new() -> Self {
		let (ops_tx, mut ops_rx) = mpsc::unbounded_channel();

		tokio::spawn(async move {
			let mut subscriptions: Vec<ActiveSubscription> = Vec::new();

			while let Some(op) = ops_rx.recv().await {
				match op {
					EmitterOp::Subscribe { request, done } => {
						subscriptions.push(spawn_delivery(request));
						let _ = done.send(());
					}
					EmitterOp::Emit { name, data, done } => {
						subscriptions.retain(|sub| !sub.cancel.is_cancelled());
						for sub in &subscriptions {
							if sub.filter.as_deref().is_none_or(|f| f == &*name) {
								sub.buffer.push(Emitted {
									name: Arc::clone(&name),
									data: data.clone(),
								});
							}
						}
						let _ = done.send(());
					}
					EmitterOp::Count { reply } => {
						subscriptions.retain(|sub| !sub.cancel.is_cancelled());
						let _ = reply.send(subscriptions.len());
					}
				}
			}

			for sub in subscriptions {
				sub.cancel.cancel();
			}
		});

		Self { ops: ops_tx }
	}

	/// Emits one event, returning once it has been appended to every
	/// matching subscription's buffer.
	pub async fn emit(&self, name: impl Into<Arc<str>>, data: Value) {
		let (done_tx, done_rx) = oneshot::channel();
		let op = EmitterOp::Emit {
			name: name.into(),
			data,
			done: done_tx,
		};
		if self.ops.send(op).is_ok() {
			let _ = done_rx.await;
		}
	}

	/// Registers a subscription with a caller-supplied destination queue and
	/// cancellation token.
	pub async fn subscribe_with(
		&self,
		filter: Option<&str>,
		destination: mpsc::Sender<Emitted>,
		cancel: CancellationToken,
	) {
		let (done_tx, done_rx) = oneshot::channel();
		let op = EmitterOp::Subscribe {
			request: SubscriptionRequest {
				filter: filter.map(Arc::from),
				destination,
				cancel,
			},
			done: done_tx,
		};
		if self.ops.send(op).is_ok() {
			let _ = done_rx.await;
		}
	}

	/// Registers a subscription and returns an RAII handle that cancels it
	/// on drop.
	pub async fn subscribe(&self, filter: Option<&str>, capacity: usize) -> EventSubscription {
		let (tx, rx) = mpsc::channel(capacity);
		let cancel = CancellationToken::new();
		self.subscribe_with(filter, tx, cancel.clone()).await;
		EventSubscription {
			receiver: rx,
			cancel,
		}
	}

	/// Number of live (not yet pruned) subscriptions.
	pub async fn subscription_count(&self) -> usize {
		let (reply_tx, reply_rx) = oneshot::channel();
		if self.ops.send(EmitterOp::Count { reply: reply_tx }).is_err() {
			return 0;
		}
		reply_rx.await.unwrap_or(0)
	}
}

impl Default for EventEmitter {
	fn default() -> Self {
		Self::new()
	}
}

/// Spawns the per-subscription delivery task and returns its bookkeeping.
fn spawn_delivery(request: SubscriptionRequest) -> ActiveSubscription {
	let SubscriptionRequest {
		filter,
		destination,
		cancel,
	} = request;

	let buffer = Arc::new(DoubleBuffer::new());
	let task_buffer = Arc::clone(&buffer);
	let task_cancel = cancel.clone();

	tokio::spawn(async move {
		let mut read: Vec<Emitted> = Vec::new();
		loop {
			if read.is_empty() {
				task_buffer.swap_into(&mut read);
			}
			if read.is_empty() {
				tokio::select! {
					_ = task_cancel.cancelled() => return,
					_ = task_buffer.wait() => continue,
				}
			}
			for event in read.drain(..) {
				tokio::select! {
					biased;
					_ = task_cancel.cancelled() => return,
					sent = destination.send(event) => {
						if sent.is_err() {
							// Receiver side is gone; cancel so the next
							// emission pass prunes this subscription.
							task_cancel.cancel();
							return;
						}
					}
				}
			}
		}
	});

	ActiveSubscription {
		filter,
		buffer,
		cancel,
	}
}

/// RAII handle for an emitter subscription; cancels on drop.
pub struct EventSubscription {
	receiver: mpsc::Receiver<Emitted>,
	cancel: CancellationToken,
}

impl EventSubscription {
	/// Receives the next delivered event, or `None` after cancellation once
	/// the queue is drained.
	pub async fn recv(&mut self) -> Option<Emitted> {
		self.receiver.recv().await
	}

	/// Attempts to receive without blocking.
	pub fn try_recv(&mut self) -> Option<Emitted> {
		self.receiver.try_recv().ok()
	}

	/// Stops delivery; the subscription is pruned on the next emission.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Returns a clone of this subscription's cancellation token.
	pub fn cancel_token(&self) -> CancellationToken {
		self.cancel.clone()
	}
}

impl Drop for EventSubscription {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

impl std::fmt::Debug for EventSubscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSubscription")
			.field("cancelled", &self.cancel.is_cancelled())
			.finish()
	}
}
