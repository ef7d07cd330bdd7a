//! Transport layer for the bridge protocol.
//!
//! This module provides the framed TCP stream the connection manager owns,
//! and a listener for peers speaking the same protocol.

pub mod tcp;

pub use tcp::{DEFAULT_PORT, TcpConnection, TcpServer};
