use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::registry::ConnHandle;

struct Probe {
    handle: ConnHandle,
    cancel: CancellationToken,
    /// A ping went out and no pong has come back yet.
    pending: bool,
}

/// Periodic liveness probe over every open socket, authenticated or not.
///
/// Each sweep declares sockets that never answered the previous ping dead and
/// cancels them; the connection task then runs its normal disconnect path.
/// Everything else is pinged and marked pending. A silent socket is therefore
/// pruned within two intervals.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    probes: Arc<Mutex<HashMap<Uuid, Probe>>>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            probes: Arc::new(Mutex::new(HashMap::new())),
            interval,
        }
    }

    // A panic mid-sweep leaves the map consistent, so poisoning is ignored.
    fn probes(&self) -> MutexGuard<'_, HashMap<Uuid, Probe>> {
        self.probes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start watching a socket. `cancel` is fired if it stops answering.
    pub fn track(&self, handle: ConnHandle, cancel: CancellationToken) {
        let mut probes = self.probes();
        probes.insert(
            handle.conn_id(),
            Probe {
                handle,
                cancel,
                pending: false,
            },
        );
    }

    pub fn untrack(&self, conn_id: Uuid) {
        let mut probes = self.probes();
        probes.remove(&conn_id);
    }

    /// Record a pong (or any proof of life) from the socket.
    pub fn mark_alive(&self, conn_id: Uuid) {
        let mut probes = self.probes();
        if let Some(probe) = probes.get_mut(&conn_id) {
            probe.pending = false;
        }
    }

    pub fn tracked(&self) -> usize {
        self.probes().len()
    }

    /// One heartbeat tick. Returns the connections declared dead.
    pub fn sweep(&self) -> Vec<Uuid> {
        let mut probes = self.probes();
        let mut dead = Vec::new();

        probes.retain(|&conn_id, probe| {
            if probe.pending || !probe.handle.ping() {
                probe.cancel.cancel();
                dead.push(conn_id);
                return false;
            }
            probe.pending = true;
            true
        });

        if !dead.is_empty() {
            warn!("Heartbeat: pruned {} unresponsive connection(s)", dead.len());
        }
        trace!("Heartbeat: {} connection(s) pinged", probes.len());
        dead
    }

    /// Sweep forever at the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;

    #[test]
    fn silent_socket_is_pruned_on_second_sweep() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        let (handle, mut rx) = ConnHandle::new();
        let cancel = CancellationToken::new();
        monitor.track(handle.clone(), cancel.clone());

        assert!(monitor.sweep().is_empty());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));
        assert!(!cancel.is_cancelled());

        assert_eq!(monitor.sweep(), vec![handle.conn_id()]);
        assert!(cancel.is_cancelled());
        assert_eq!(monitor.tracked(), 0);
    }

    #[test]
    fn pong_keeps_socket_alive() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        let (handle, _rx) = ConnHandle::new();
        let cancel = CancellationToken::new();
        monitor.track(handle.clone(), cancel.clone());

        for _ in 0..5 {
            assert!(monitor.sweep().is_empty());
            monitor.mark_alive(handle.conn_id());
        }
        assert!(!cancel.is_cancelled());
        assert_eq!(monitor.tracked(), 1);
    }

    #[test]
    fn closed_writer_counts_as_dead() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(30));
        let (handle, rx) = ConnHandle::new();
        let cancel = CancellationToken::new();
        monitor.track(handle, cancel.clone());
        drop(rx);

        assert_eq!(monitor.sweep().len(), 1);
        assert!(cancel.is_cancelled());
    }
}
