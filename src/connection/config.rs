//! Connection configuration types.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use super::reconnect::ReconnectPolicy;
use crate::transport::DEFAULT_PORT;

/// Default host of the command bridge.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Connection configuration.
///
/// Built once and handed to the connection manager, which never mutates it.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Peer host name or address.
    pub host: String,
    /// Peer TCP port.
    pub port: u16,
    /// Bound on connect, and on each send and each receive.
    pub io_timeout: Duration,
    /// Idle interval after which the heartbeat probes. `None` or zero
    /// disables it.
    pub heartbeat_interval: Option<Duration>,
    /// Reconnect strategy.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            io_timeout: Duration::from_secs(30),
            heartbeat_interval: Some(Duration::from_secs(5)),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for `host:port` with default timings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set host and port from a socket address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.host = addr.ip().to_string();
        self.port = addr.port();
        self
    }

    /// Set the I/O timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the heartbeat interval. A zero interval disables the heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    /// Disable the heartbeat monitor.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    /// Set the maximum number of reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    /// Set the reconnect backoff base and ceiling.
    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect.base_delay = base;
        self.reconnect.max_delay = max;
        self
    }

    /// Set the whole reconnect policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Resolve `host:port` into socket addresses.
    pub fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}:{} resolved to no addresses", self.host, self.port),
            ));
        }
        Ok(addrs)
    }

    /// `host:port` for display.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
