//! Persistent connection manager.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::codec::encode;
use crate::error::{BridgeError, Result};
use crate::message::{Command, CommandResult, Params, Response};
use crate::transport::TcpConnection;

use super::config::ConnectionConfig;
use super::heartbeat::{HeartbeatMonitor, HeartbeatTarget};
use super::state::{ConnectionState, ConnectionStats, SharedState};

/// How long `disconnect` waits for the heartbeat thread to exit.
pub const HEARTBEAT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error text returned when no connection could be established.
pub const NOT_CONNECTED: &str = "not connected";

/// Sends per `execute`: the original one plus a single retry after a
/// successful reconnect.
const MAX_SENDS: usize = 2;

/// A single long-lived connection to a command processor.
///
/// All operations take `&self` and are safe to call from many threads:
/// `connect`, `disconnect` and `execute` (including any reconnect and retry
/// inside it) each hold one exclusive lock for their whole duration, so at
/// most one round trip is ever in flight on the socket. The reconnect
/// backoff sleeps while holding that lock; other callers queue behind it.
///
/// While connected, a background heartbeat probes the peer whenever the
/// connection has been idle for the configured interval.
///
/// Dropping the manager disconnects it.
pub struct PersistentConnection {
    shared: Arc<Shared>,
}

struct Shared {
    this: Weak<Shared>,
    config: ConnectionConfig,
    state: SharedState,
    last_activity: Mutex<Instant>,
    core: Mutex<Core>,
}

/// Everything guarded by the manager's exclusive lock.
#[derive(Default)]
struct Core {
    state: ConnectionState,
    /// `Some` iff `state` is `Connected`.
    transport: Option<TcpConnection>,
    reconnect_attempts: u32,
    /// Replies the peer still owes us, including the one for the command in
    /// flight. Anything beyond one belongs to commands that timed out.
    owed_replies: u32,
    stats: ConnectionStats,
    heartbeat: Option<HeartbeatMonitor>,
    /// Bumped on every disconnect; a monitor from an older epoch is fenced off.
    epoch: u64,
}

impl PersistentConnection {
    /// Create a disconnected manager.
    pub fn new(config: ConnectionConfig) -> Self {
        let shared = Arc::new_cyclic(|this| Shared {
            this: this.clone(),
            config,
            state: SharedState::default(),
            last_activity: Mutex::new(Instant::now()),
            core: Mutex::new(Core::default()),
        });
        Self { shared }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Get the current connection state without waiting for the lock.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// Check if the manager is connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Time since the last successful round trip (or connect).
    pub fn idle_time(&self) -> Duration {
        self.shared.idle_time()
    }

    /// Failed reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// Snapshot of the connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        self.shared.lock().stats.clone()
    }

    /// Local address of the live socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let core = self.shared.lock();
        core.transport.as_ref().and_then(|t| t.local_addr().ok())
    }

    /// Peer address of the live socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let core = self.shared.lock();
        core.transport.as_ref().map(TcpConnection::peer_addr)
    }

    /// Check if a heartbeat monitor is running.
    pub fn heartbeat_running(&self) -> bool {
        self.shared.lock().heartbeat.is_some()
    }

    /// Connect to the peer.
    ///
    /// A no-op returning `true` if already connected. On failure the state
    /// is `Error` and `false` is returned; no error escapes.
    pub fn connect(&self) -> bool {
        let mut core = self.shared.lock();
        self.shared.connect_locked(&mut core)
    }

    /// Disconnect from the peer.
    ///
    /// Stops the heartbeat, sends a best-effort close notification, releases
    /// the socket and leaves the manager `Disconnected`. Never fails.
    pub fn disconnect(&self) {
        let monitor = {
            let mut core = self.shared.lock();
            self.shared.disconnect_locked(&mut core)
        };

        // Joined outside the lock: the monitor may be queued on it.
        if let Some(monitor) = monitor {
            monitor.join(HEARTBEAT_JOIN_TIMEOUT);
        }
    }

    /// Execute one command and wait for its result.
    pub fn execute(&self, command_type: &str, params: Option<Params>) -> CommandResult {
        let command = match params {
            Some(params) => Command::with_params(command_type, params),
            None => Command::new(command_type),
        };
        self.execute_command(&command)
    }

    /// Execute a prepared command and wait for its result.
    pub fn execute_command(&self, command: &Command) -> CommandResult {
        let mut core = self.shared.lock();
        self.shared.execute_locked(&mut core, command)
    }

    /// Check liveness: `true` if the peer acknowledged a probe.
    pub fn probe(&self) -> bool {
        let mut core = self.shared.lock();
        self.shared.probe_locked(&mut core)
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("endpoint", &self.shared.config.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn transition(&self, core: &mut Core, next: ConnectionState) {
        let current = core.state;
        if current != next {
            debug_assert!(
                current.can_transition_to(next),
                "illegal transition {current} -> {next}"
            );
            debug!(from = %current, to = %next, "state transition");
        }
        core.state = next;
        self.state.store(next);
    }

    fn close_transport(core: &mut Core) {
        if let Some(transport) = core.transport.take() {
            // Already-dead sockets refuse shutdown.
            let _ = transport.shutdown();
        }
    }

    /// Drop the socket and settle in `Error`.
    fn fail(&self, core: &mut Core) {
        Self::close_transport(core);
        core.stats.last_error = Some(Instant::now());
        self.transition(core, ConnectionState::Error);
    }

    fn connect_locked(&self, core: &mut Core) -> bool {
        if core.state.is_connected() {
            debug!("already connected");
            return true;
        }

        self.transition(core, ConnectionState::Connecting);
        match self.open(core) {
            Ok(()) => true,
            Err(e) => {
                error!(endpoint = %self.config.endpoint(), error = %e, "failed to connect");
                core.stats.record_failure();
                self.fail(core);
                false
            }
        }
    }

    /// Open the socket and move to `Connected`. Leaves the state alone on
    /// failure.
    fn open(&self, core: &mut Core) -> Result<()> {
        Self::close_transport(core);

        let addrs = self.config.socket_addrs()?;
        let transport = TcpConnection::connect(&addrs, self.config.io_timeout)?;
        info!(addr = %transport.peer_addr(), "connected");

        core.transport = Some(transport);
        core.reconnect_attempts = 0;
        core.owed_replies = 0;
        core.stats.record_connect();
        self.transition(core, ConnectionState::Connected);
        self.touch();
        self.ensure_heartbeat(core);
        Ok(())
    }

    fn ensure_heartbeat(&self, core: &mut Core) {
        // The public field can still carry a zero interval.
        let Some(interval) = self.config.heartbeat_interval.filter(|i| !i.is_zero()) else {
            return;
        };
        if core.heartbeat.is_some() {
            return;
        }

        match HeartbeatMonitor::spawn(self.this.clone(), interval, core.epoch) {
            Ok(monitor) => {
                core.stats.record_heartbeat_start();
                core.heartbeat = Some(monitor);
            }
            Err(e) => warn!(error = %e, "failed to start heartbeat"),
        }
    }

    /// Run the reconnect strategy. Returns `true` once connected.
    fn reconnect_locked(&self, core: &mut Core) -> bool {
        Self::close_transport(core);
        self.transition(core, ConnectionState::Reconnecting);

        let policy = self.config.reconnect.clone();
        let mut attempts = core.reconnect_attempts;
        let connected = policy.run(&mut attempts, thread::sleep, || {
            core.stats.record_reconnect();
            match self.open(core) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed");
                    core.stats.record_failure();
                    false
                }
            }
        });

        if connected {
            // `open` has reset the counter.
            return true;
        }

        core.reconnect_attempts = attempts;
        self.transition(core, ConnectionState::Error);
        false
    }

    fn disconnect_locked(&self, core: &mut Core) -> Option<HeartbeatMonitor> {
        core.epoch += 1;
        let monitor = core.heartbeat.take();
        if let Some(monitor) = &monitor {
            debug!(epoch = monitor.epoch(), "stopping heartbeat");
            monitor.signal_stop();
        }

        let was = core.state;
        if let Some(transport) = core.transport.as_mut() {
            if was.is_connected() {
                if let Err(e) = transport.write_frame(&Command::close()) {
                    debug!(error = %e, "close notification failed");
                }
            }
        }
        Self::close_transport(core);

        if was != ConnectionState::Disconnected || monitor.is_some() {
            core.stats.record_disconnect();
            info!(endpoint = %self.config.endpoint(), "disconnected");
        }
        self.transition(core, ConnectionState::Disconnected);
        monitor
    }

    fn execute_locked(&self, core: &mut Core, command: &Command) -> CommandResult {
        let frame = match encode(command) {
            Ok(frame) => frame,
            Err(e) => return CommandResult::failure(e.to_string(), false),
        };
        let name = command.command_type.as_str();

        for send in 1..=MAX_SENDS {
            if !core.state.is_connected() && !self.reconnect_locked(core) {
                return CommandResult::failure(NOT_CONNECTED, true);
            }

            let err = match self.round_trip(core, &frame) {
                Ok(reply) => return reply.into_result(),
                Err(err) => err,
            };

            if err.is_timeout() {
                core.stats.record_timeout();
                warn!(command = name, timeout = ?self.config.io_timeout, "command timed out");
                return CommandResult::failure(
                    format!(
                        "Command '{name}' timed out after {}s",
                        self.config.io_timeout.as_secs_f64()
                    ),
                    true,
                );
            }

            if err.is_connection_loss() {
                warn!(command = name, error = %err, "connection lost");
                self.fail(core);
                if send < MAX_SENDS {
                    if self.reconnect_locked(core) {
                        debug!(command = name, "retrying after reconnect");
                        continue;
                    }
                    return CommandResult::failure("Connection lost and reconnect failed", true);
                }
                return CommandResult::failure(err.to_string(), true);
            }

            error!(command = name, error = %err, "transport error");
            self.fail(core);
            return CommandResult::failure(err.to_string(), err.is_recoverable());
        }

        CommandResult::failure(NOT_CONNECTED, true)
    }

    /// Send one frame and read its reply, skipping replies owed to commands
    /// that timed out earlier.
    fn round_trip(&self, core: &mut Core, frame: &Bytes) -> Result<Response> {
        let transport = core.transport.as_mut().ok_or(BridgeError::NotConnected)?;

        transport.write_encoded(frame)?;
        core.stats.record_send(frame.len());
        core.owed_replies += 1;

        loop {
            let (reply, size): (Response, usize) = transport.read_frame_sized()?;
            core.stats.record_receive(size);
            core.owed_replies = core.owed_replies.saturating_sub(1);

            if core.owed_replies > 0 {
                debug!(remaining = core.owed_replies, "discarding late reply");
                continue;
            }

            self.touch();
            return Ok(reply);
        }
    }

    fn probe_locked(&self, core: &mut Core) -> bool {
        let result = self.execute_locked(core, &Command::ping());
        result.success && result.data.get("pong") == Some(&Value::Bool(true))
    }
}

impl HeartbeatTarget for Shared {
    fn idle_time(&self) -> Duration {
        Shared::idle_time(self)
    }

    fn heartbeat(&self, epoch: u64) -> bool {
        let mut core = self.lock();
        if core.epoch != epoch {
            debug!(epoch, current = core.epoch, "stale heartbeat skipped");
            return true;
        }
        self.probe_locked(&mut core)
    }
}
