//! Resilient client for length-prefixed JSON command bridges, built on std::net.
//!
//! This crate keeps exactly one long-lived TCP connection to a remote
//! command processor and exposes a synchronous, thread-safe "execute one
//! command, get one result" operation that survives transient network
//! failures.
//!
//! # Features
//!
//! - Length-prefixed JSON framing with a 100 MiB sanity ceiling
//! - Explicit connection state machine
//! - Exponential reconnect backoff with a bounded attempt count
//! - Single bounded retry of a command after connection loss
//! - Background heartbeat on idle connections
//! - Uniform result envelope with a `recoverable` flag
//!
//! # Example
//!
//! ```no_run
//! use cmdlink::{ConnectionConfig, PersistentConnection};
//! use serde_json::json;
//!
//! let conn = PersistentConnection::new(ConnectionConfig::default());
//! if !conn.connect() {
//!     eprintln!("bridge not reachable yet, will retry on first command");
//! }
//!
//! let params = json!({"name": "BP_Door"}).as_object().cloned();
//! let result = conn.execute("create_blueprint", params);
//!
//! if result.success {
//!     println!("created: {:?}", result.data);
//! } else if result.recoverable {
//!     println!("try again later: {:?}", result.error());
//! }
//! ```
//!
//! # Protocol Overview
//!
//! Each message, in either direction, is a 4-byte big-endian length
//! followed by that many bytes of UTF-8 JSON:
//!
//! ```text
//! request:  {"type": "<command>", "params": {...}}
//! response: {"status": "success" | "...", "result": {...},
//!            "error": "...", "recoverable": true | false}
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod message;
pub mod transport;

// Async modules (require tokio feature)
#[cfg(feature = "tokio")]
pub mod codec_async;

// Re-export commonly used types at the crate root
pub use codec::{MAX_FRAME_SIZE, decode, encode};
pub use connection::{
    ConnectionConfig, ConnectionState, ConnectionStats, PersistentConnection, ReconnectPolicy,
};
pub use error::{BridgeError, Result};
pub use message::{Command, CommandResult, Params, Response};
pub use transport::DEFAULT_PORT;
