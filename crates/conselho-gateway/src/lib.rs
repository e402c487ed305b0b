pub mod auth;
pub mod billing;
pub mod connection;
pub mod heartbeat;
pub mod notify;
pub mod registry;
pub mod rooms;

use std::sync::Arc;
use std::time::Duration;

use conselho_db::Database;
use conselho_types::events::SessionEndReason;
use conselho_types::models::Consultation;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::heartbeat::HeartbeatMonitor;
use crate::notify::NotificationBridge;
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomError, RoomManager};

#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub heartbeat_interval: Duration,
    /// One billable minute.
    pub billing_period: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            billing_period: Duration::from_secs(60),
        }
    }
}

struct GatewayInner {
    db: Arc<Database>,
    auth: AuthGate,
    registry: ConnectionRegistry,
    heartbeat: HeartbeatMonitor,
    notifications: NotificationBridge,
    rooms: RoomManager,
}

/// Everything a socket handler needs, shared across connections.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(db: Arc<Database>, auth: AuthGate, config: GatewayConfig) -> Self {
        let registry = ConnectionRegistry::new();
        let notifications = NotificationBridge::new(registry.clone());
        let rooms = RoomManager::new(db.clone(), notifications.clone(), config.billing_period);
        Self {
            inner: Arc::new(GatewayInner {
                db,
                auth,
                registry,
                heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
                notifications,
                rooms,
            }),
        }
    }

    pub fn db(&self) -> Arc<Database> {
        self.inner.db.clone()
    }

    pub fn auth(&self) -> &AuthGate {
        &self.inner.auth
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.inner.heartbeat
    }

    pub fn notifications(&self) -> &NotificationBridge {
        &self.inner.notifications
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.inner.rooms
    }

    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        tokio::spawn(self.inner.heartbeat.clone().run())
    }

    /// End a consultation whether or not anyone is in its room.
    pub async fn end_consultation(
        &self,
        consultation_id: Uuid,
        reason: SessionEndReason,
    ) -> Result<Consultation, RoomError> {
        self.inner.rooms.end(consultation_id, reason).await
    }
}
