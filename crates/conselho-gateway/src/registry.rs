use std::collections::HashMap;
use std::sync::Arc;

use conselho_types::events::ServerFrame;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

/// What a connection's writer task puts on the wire.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    /// WebSocket-level ping from the heartbeat monitor
    Ping,
    /// Flush what is queued, send a close frame and stop
    Close,
}

/// Sending half of one socket's outbound queue.
///
/// Cloned into the registry, the room slot and the heartbeat monitor. Sending
/// to a socket that has gone away is not an error: the socket's own
/// disconnect path cleans up after it.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue a frame. Returns `false` if the socket is already gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Maps an authenticated identity to its current socket.
///
/// At most one socket per identity is addressable. A newer registration
/// replaces the older one without closing it. The older socket stays open but
/// stops receiving notifications.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, ConnHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the current socket of `user_id`. Returns the
    /// handle it replaced, if any.
    pub async fn register(&self, user_id: Uuid, handle: ConnHandle) -> Option<ConnHandle> {
        let previous = self.inner.write().await.insert(user_id, handle);
        if let Some(prev) = &previous {
            debug!("user {} re-registered, superseding conn {}", user_id, prev.conn_id());
        }
        previous
    }

    pub async fn lookup(&self, user_id: Uuid) -> Option<ConnHandle> {
        self.inner
            .read()
            .await
            .get(&user_id)
            .filter(|h| h.is_open())
            .cloned()
    }

    /// Remove the entry, but only if `conn_id` still owns it.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        match map.get(&user_id) {
            Some(current) if current.conn_id() == conn_id => {
                map.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newer_registration_wins_and_old_unregister_is_ignored() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = ConnHandle::new();
        let (second, _rx2) = ConnHandle::new();

        assert!(registry.register(user, first.clone()).await.is_none());
        let replaced = registry.register(user, second.clone()).await.unwrap();
        assert_eq!(replaced.conn_id(), first.conn_id());
        assert_eq!(registry.lookup(user).await.unwrap().conn_id(), second.conn_id());

        // The superseded tab disconnecting must not evict the new one.
        assert!(!registry.unregister(user, first.conn_id()).await);
        assert_eq!(registry.lookup(user).await.unwrap().conn_id(), second.conn_id());

        assert!(registry.unregister(user, second.conn_id()).await);
        assert!(registry.lookup(user).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn superseded_handle_still_receives_direct_frames() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (first, mut rx1) = ConnHandle::new();
        let (second, _rx2) = ConnHandle::new();
        registry.register(user, first.clone()).await;
        registry.register(user, second).await;

        assert!(first.send(ServerFrame::AuthRequired));
        assert!(matches!(rx1.recv().await, Some(Outbound::Frame(ServerFrame::AuthRequired))));
    }

    #[tokio::test]
    async fn closed_sockets_are_not_addressable() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (handle, rx) = ConnHandle::new();
        registry.register(user, handle.clone()).await;
        drop(rx);

        assert!(!handle.send(ServerFrame::AuthRequired));
        assert!(registry.lookup(user).await.is_none());
    }
}
