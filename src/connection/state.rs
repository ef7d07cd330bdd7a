//! Connection state management.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected. Initial state, and the state after `disconnect()`.
    #[default]
    Disconnected = 0,
    /// Explicit connect in progress.
    Connecting = 1,
    /// Connected and ready; the only state in which commands are sent.
    Connected = 2,
    /// Backoff reconnect loop in progress.
    Reconnecting = 3,
    /// Last connect or I/O failed. Cleared by a reconnect or `connect()`.
    Error = 4,
}

impl ConnectionState {
    /// Check if the connection is usable.
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }

    /// Check if a connection attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }

    /// Check if the connection has failed.
    pub fn is_error(&self) -> bool {
        *self == ConnectionState::Error
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (*self, next) {
            // disconnect() is always allowed and always lands here.
            (_, Disconnected) => true,
            (Disconnected | Error, Connecting) => true,
            (Connecting, Connected | Error) => true,
            (Connected, Connected | Error) => true,
            (Disconnected | Error, Reconnecting) => true,
            (Reconnecting, Connected | Error) => true,
            _ => false,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A state cell that is written under the manager's lock but can be read
/// from anywhere without it.
#[derive(Debug, Default)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Connection statistics.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of successful connections.
    pub connect_count: u64,
    /// Number of failed connection attempts.
    pub failure_count: u64,
    /// Number of reconnection attempts.
    pub reconnect_count: u64,
    /// Number of commands sent.
    pub commands_sent: u64,
    /// Number of replies received (including discarded late ones).
    pub replies_received: u64,
    /// Number of commands that timed out.
    pub timeouts: u64,
    /// Number of heartbeat monitors started.
    pub heartbeat_starts: u64,
    /// Total bytes sent.
    pub bytes_sent: u64,
    /// Total bytes received.
    pub bytes_received: u64,
    /// Time of last successful connection.
    pub last_connected: Option<Instant>,
    /// Time of last disconnect.
    pub last_disconnected: Option<Instant>,
    /// Time of last error.
    pub last_error: Option<Instant>,
}

impl ConnectionStats {
    /// Record a successful connection.
    pub fn record_connect(&mut self) {
        self.connect_count += 1;
        self.last_connected = Some(Instant::now());
    }

    /// Record a disconnection.
    pub fn record_disconnect(&mut self) {
        self.last_disconnected = Some(Instant::now());
    }

    /// Record a connection failure.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_error = Some(Instant::now());
    }

    /// Record a reconnection attempt.
    pub fn record_reconnect(&mut self) {
        self.reconnect_count += 1;
    }

    /// Record a sent command.
    pub fn record_send(&mut self, bytes: usize) {
        self.commands_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a received reply.
    pub fn record_receive(&mut self, bytes: usize) {
        self.replies_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record a timed-out command.
    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.last_error = Some(Instant::now());
    }

    /// Record a heartbeat monitor start.
    pub fn record_heartbeat_start(&mut self) {
        self.heartbeat_starts += 1;
    }

    /// Get uptime if connected.
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.last_connected.map(|t| t.elapsed())
    }
}
