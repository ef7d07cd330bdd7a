//! Connection management for bridge clients.
//!
//! This module provides:
//! - A persistent, thread-safe connection manager
//! - The connection state machine
//! - Exponential reconnect backoff
//! - An idle heartbeat that surfaces dead connections early
//!
//! # Example
//!
//! ```no_run
//! use cmdlink::connection::{ConnectionConfig, PersistentConnection};
//! use std::time::Duration;
//!
//! let config = ConnectionConfig::new("127.0.0.1", 55558)
//!     .with_io_timeout(Duration::from_secs(10))
//!     .with_max_reconnect_attempts(3);
//!
//! let conn = PersistentConnection::new(config);
//! conn.connect();
//!
//! // Reconnects transparently if the peer went away since the last call.
//! let result = conn.execute("get_context", None);
//! println!("{}", result.to_json_pretty());
//! ```

mod config;
mod heartbeat;
mod manager;
mod reconnect;
mod state;

pub use config::{ConnectionConfig, DEFAULT_HOST};
pub use manager::{HEARTBEAT_JOIN_TIMEOUT, NOT_CONNECTED, PersistentConnection};
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, ConnectionStats};
