//! Wire types for the Chrome DevTools Protocol.
//!
//! This crate contains the serde-serializable types used for communication
//! with a Chromium-family browser over its remote debugging socket. These
//! types represent the "protocol layer" - the shapes of data as they appear
//! on the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with protocol**: Match the DevTools JSON framing exactly
//! - **Stable**: Changes only when the wire protocol changes
//!
//! Higher-level ergonomic APIs are built on top of these types in `cdp-rs`.

pub mod message;
pub mod options;
pub mod target;

pub use message::*;
pub use options::*;
pub use target::*;
