//! DevTools runtime - browser process lifecycle, connection, and sessions.
//!
//! This crate provides the low-level runtime infrastructure for driving a
//! Chromium-family browser over its remote debugging socket:
//!
//! - **Launcher**: Spawning a local browser and discovering its endpoint
//! - **Transport**: One WebSocket, one read loop, a shared close signal
//! - **Connection**: Command/reply correlation and frame classification
//! - **Sessions**: One logical conversation per attached target
//! - **Emitter**: Ordered, cancellation-safe event fan-out
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   cdp-rs    │  Object graph (Browser, BrowsingContext, Page)
//! └──────┬──────┘
//!        │ drives
//! ┌──────▼──────┐
//! │ cdp-runtime │  This crate
//! │  ┌────────┐ │
//! │  │ Conn   │ │  Correlation, classification, session registry
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Emitter│ │  Ordered per-subscriber fan-out
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  WebSocket transport
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Launch │ │  Process supervision
//! │  └────────┘ │
//! └─────────────┘
//! ```
//!
//! Scheduling is many small tasks, not one event loop: each connection has
//! one read loop and one writer task, each session one consumer task, each
//! emitter one owning actor, and each subscription one delivery task. Every
//! blocking wait is raced against a caller-supplied deadline or cancellation.

pub mod connection;
pub mod emitter;
pub mod error;
pub mod launcher;
pub mod session;
pub mod transport;

// Re-export key types at crate root
pub use connection::{CommandExecutor, Connection};
pub use emitter::{DoubleBuffer, Emitted, EventEmitter, EventSubscription};
pub use error::{Error, Result};
pub use launcher::{
	BrowserProcess, DEVTOOLS_LISTENING_PREFIX, ProcessRegistry, StorageDir,
	find_browser_executable, launch,
};
pub use session::Session;
pub use transport::{
	CloseReason, Transport, TransportParts, TransportReceiver, WebSocketReceiver,
	WebSocketSender, WebSocketTransport,
};
