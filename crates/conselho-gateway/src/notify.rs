use conselho_types::events::{Notification, NotificationEvent, ServerFrame};
use tracing::debug;
use uuid::Uuid;

use crate::registry::ConnectionRegistry;

/// Pushes out-of-band events to a user's current socket.
///
/// Delivery is best-effort: a user without a live socket simply misses the
/// event. Nothing is queued for later.
#[derive(Clone)]
pub struct NotificationBridge {
    registry: ConnectionRegistry,
}

impl NotificationBridge {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub async fn notify(&self, user_id: Uuid, event: NotificationEvent) -> Notification {
        let mut notification = Notification::new(user_id, event);
        match self.registry.lookup(user_id).await {
            Some(handle) => {
                notification.delivered = handle.send(ServerFrame::Notification {
                    notification: notification.clone(),
                });
            }
            None => debug!("No live socket for {}, notification dropped", user_id),
        }
        notification
    }
}
