//! Idle-connection heartbeat monitor.
//!
//! The monitor never touches the socket. Each tick it asks its target how
//! long the connection has been idle and, past the interval, asks the target
//! to probe through its ordinary locked command path.

use std::io;
use std::sync::Weak;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// What the monitor watches.
pub(crate) trait HeartbeatTarget: Send + Sync + 'static {
    /// Time since the last successful round trip.
    fn idle_time(&self) -> Duration;

    /// Probe the peer on behalf of monitor `epoch`. `false` means the probe
    /// was not acknowledged.
    fn heartbeat(&self, epoch: u64) -> bool;
}

/// Handle to a running heartbeat thread.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    epoch: u64,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start a monitor thread. It exits on `signal_stop`, when this handle
    /// is dropped, or once the target is gone.
    pub(crate) fn spawn<T: HeartbeatTarget>(
        target: Weak<T>,
        interval: Duration,
        epoch: u64,
    ) -> io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("cmdlink-heartbeat-{epoch}"))
            .spawn(move || run(target, interval, epoch, stop_rx))?;

        Ok(Self {
            epoch,
            stop,
            handle,
        })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Ask the loop to exit. Does not wait.
    pub(crate) fn signal_stop(&self) {
        // The loop may already be gone.
        let _ = self.stop.send(());
    }

    /// Wait up to `wait` for the thread to exit. Returns `false` (and
    /// detaches the thread) if it is still running at the deadline.
    pub(crate) fn join(self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    epoch = self.epoch,
                    ?wait,
                    "heartbeat did not stop in time, detaching"
                );
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if self.handle.join().is_err() {
            warn!(epoch = self.epoch, "heartbeat thread panicked");
        }
        true
    }

    /// Signal and join.
    #[cfg(test)]
    pub(crate) fn stop(self, wait: Duration) -> bool {
        self.signal_stop();
        self.join(wait)
    }
}

fn run<T: HeartbeatTarget>(target: Weak<T>, interval: Duration, epoch: u64, stop: Receiver<()>) {
    debug!(epoch, ?interval, "heartbeat started");

    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(target) = target.upgrade() else {
            break;
        };

        let idle = target.idle_time();
        if idle >= interval && !target.heartbeat(epoch) {
            warn!(epoch, ?idle, "heartbeat failed, connection may be stale");
        }
    }

    debug!(epoch, "heartbeat stopped");
}
