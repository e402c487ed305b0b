use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use conselho_db::Database;
use conselho_db::consultations::ConsultationError;
use conselho_types::events::{
    ChatSender, ErrorCode, NotificationEvent, ServerFrame, SessionEndReason,
};
use conselho_types::models::{Consultation, Role};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::billing::MeterHandle;
use crate::notify::NotificationBridge;
use crate::registry::ConnHandle;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("consultation not found")]
    NotFound,

    #[error("not a participant of this consultation")]
    NotParticipant,

    #[error("consultation is not active")]
    NotActive,

    #[error("not in a consultation room")]
    NotInRoom,

    #[error("message content is empty")]
    EmptyMessage,

    #[error("internal error")]
    Store(#[from] anyhow::Error),
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(_) => ErrorCode::TransactionError,
            _ => ErrorCode::RoomError,
        }
    }

    pub fn frame(&self) -> ServerFrame {
        ServerFrame::error(self.code(), self.to_string())
    }
}

impl From<ConsultationError> for RoomError {
    fn from(e: ConsultationError) -> Self {
        match e {
            ConsultationError::NotFound => Self::NotFound,
            ConsultationError::NotParticipant => Self::NotParticipant,
            ConsultationError::Store(e) => Self::Store(e),
            other => Self::Store(other.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Created,
    SingleJoined,
    Active,
    Closing,
    Closed,
}

struct Slot {
    user_id: Uuid,
    handle: ConnHandle,
}

struct Room {
    consultation: Consultation,
    client: Option<Slot>,
    consultant: Option<Slot>,
    state: RoomState,
    last_activity: Instant,
    meter: Option<MeterHandle>,
    /// Charges made by every meter this room has run.
    charges: Arc<AtomicU64>,
}

impl Room {
    fn new(consultation: Consultation) -> Self {
        Self {
            consultation,
            client: None,
            consultant: None,
            state: RoomState::Created,
            last_activity: Instant::now(),
            meter: None,
            charges: Arc::new(AtomicU64::new(0)),
        }
    }

    fn slot(&self, role: Role) -> Option<&Slot> {
        match role {
            Role::Client => self.client.as_ref(),
            Role::Consultant => self.consultant.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Slot> {
        match role {
            Role::Client => &mut self.client,
            Role::Consultant => &mut self.consultant,
        }
    }

    /// Which slot `conn_id` currently holds, if any.
    fn role_of_conn(&self, conn_id: Uuid) -> Option<Role> {
        [Role::Client, Role::Consultant]
            .into_iter()
            .find(|&role| self.slot(role).is_some_and(|s| s.handle.conn_id() == conn_id))
    }

    fn is_empty(&self) -> bool {
        self.client.is_none() && self.consultant.is_none()
    }

    fn broadcast(&self, frame: &ServerFrame) {
        for slot in [&self.client, &self.consultant].into_iter().flatten() {
            slot.handle.send(frame.clone());
        }
    }
}

struct RoomManagerInner {
    rooms: Mutex<HashMap<Uuid, Room>>,
    db: Arc<Database>,
    bridge: NotificationBridge,
    billing_period: Duration,
}

/// Owns every live room. Room mutations happen under the map lock; meters
/// are always stopped after the lock is released.
#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<RoomManagerInner>,
}

impl RoomManager {
    pub fn new(db: Arc<Database>, bridge: NotificationBridge, billing_period: Duration) -> Self {
        Self {
            inner: Arc::new(RoomManagerInner {
                rooms: Mutex::new(HashMap::new()),
                db,
                bridge,
                billing_period,
            }),
        }
    }

    pub fn db(&self) -> Arc<Database> {
        self.inner.db.clone()
    }

    /// Check that `user_id` may enter the room of `consultation_id` and which
    /// slot it takes.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        consultation_id: Uuid,
    ) -> Result<(Consultation, Role), RoomError> {
        let db = self.db();
        let consultation = tokio::task::spawn_blocking(move || {
            db.consultation_for_participant(consultation_id, user_id)
        })
        .await
        .map_err(|e| RoomError::Store(e.into()))??;

        if !consultation.is_active() {
            return Err(RoomError::NotActive);
        }
        let role = consultation
            .role_of(user_id)
            .ok_or(RoomError::NotParticipant)?;
        Ok((consultation, role))
    }

    /// Put `handle` in the `role` slot of the consultation's room, creating
    /// the room if needed. A previous socket in that slot is replaced. Once
    /// both slots are filled the room becomes active and billing starts.
    ///
    /// A room that is being closed accepts no one.
    pub async fn attach(
        &self,
        consultation: Consultation,
        role: Role,
        user_id: Uuid,
        handle: ConnHandle,
    ) -> Result<(), RoomError> {
        let id = consultation.id;
        let mut rooms = self.inner.rooms.lock().await;
        let room = rooms
            .entry(id)
            .or_insert_with(|| Room::new(consultation.clone()));
        if room.state == RoomState::Closing {
            return Err(RoomError::NotActive);
        }

        let previous = room.slot_mut(role).replace(Slot {
            user_id,
            handle: handle.clone(),
        });
        if let Some(prev) = previous {
            if prev.handle.conn_id() != handle.conn_id() {
                debug!(
                    "Conn {} supersedes conn {} as {} of {}",
                    handle.conn_id(),
                    prev.handle.conn_id(),
                    role.as_str(),
                    id
                );
            }
        }
        room.consultation = consultation.clone();
        room.last_activity = Instant::now();

        handle.send(ServerFrame::JoinedConsultation {
            consultation_id: id,
            consultation,
        });

        if room.slot(role.other()).is_none() {
            room.state = RoomState::SingleJoined;
            debug!("{} joined room {} alone", role.as_str(), id);
            return Ok(());
        }

        room.broadcast(&ServerFrame::ParticipantJoined {
            consultation_id: id,
        });
        self.activate(room);
        info!("Room {} is active", id);
        Ok(())
    }

    /// Mark a room with both slots filled as active and make sure it bills.
    fn activate(&self, room: &mut Room) {
        room.state = RoomState::Active;
        if room.meter.is_none() {
            room.meter = Some(MeterHandle::start(
                self.clone(),
                &room.consultation,
                self.inner.billing_period,
                room.charges.clone(),
            ));
        }
    }

    /// Remove `conn_id` from the room. The peer is told, billing pauses, and
    /// a room left empty is closed and its consultation ended.
    pub async fn leave(&self, consultation_id: Uuid, conn_id: Uuid) {
        let (meter, closed) = {
            let mut rooms = self.inner.rooms.lock().await;
            let Some(room) = rooms.get_mut(&consultation_id) else {
                return;
            };
            let Some(role) = room.role_of_conn(conn_id) else {
                return;
            };

            room.slot_mut(role).take();
            room.last_activity = Instant::now();
            if room.state == RoomState::Closing {
                // `end` owns the meter and the consultation from here.
                return;
            }
            if let Some(peer) = room.slot(role.other()) {
                peer.handle.send(ServerFrame::ParticipantLeft { consultation_id });
            }
            let meter = room.meter.take();

            if room.is_empty() {
                room.state = RoomState::Closed;
                rooms.remove(&consultation_id);
                (meter, true)
            } else {
                room.state = RoomState::SingleJoined;
                (meter, false)
            }
        };
        debug!("Conn {} left room {}", conn_id, consultation_id);

        if let Some(meter) = meter {
            meter.stop_and_flush(self.db()).await;
        }
        if closed {
            info!("Room {} emptied, ending consultation", consultation_id);
            if let Err(e) = self.end_persisted(consultation_id).await {
                error!("Failed to end consultation {}: {}", consultation_id, e);
            }
        }
    }

    /// Persist and relay a chat line from the socket `sender`.
    pub async fn chat(
        &self,
        consultation_id: Uuid,
        sender: &ConnHandle,
        content: String,
    ) -> Result<(), RoomError> {
        if content.trim().is_empty() {
            return Err(RoomError::EmptyMessage);
        }

        let role = {
            let mut rooms = self.inner.rooms.lock().await;
            let room = rooms
                .get_mut(&consultation_id)
                .ok_or(RoomError::NotInRoom)?;
            let role = room
                .role_of_conn(sender.conn_id())
                .ok_or(RoomError::NotInRoom)?;
            if room.state == RoomState::Closing {
                return Err(RoomError::NotActive);
            }
            room.last_activity = Instant::now();
            role
        };

        let db = self.db();
        let message = tokio::task::spawn_blocking(move || {
            db.insert_message(consultation_id, role, &content)
        })
        .await
        .map_err(|e| RoomError::Store(e.into()))??;

        sender.send(ServerFrame::MessageSent {
            message: message.clone(),
        });

        let rooms = self.inner.rooms.lock().await;
        if let Some(room) = rooms.get(&consultation_id) {
            let from = room.slot(role).map(|s| s.user_id);
            if let (Some(peer), Some(from)) = (room.slot(role.other()), from) {
                peer.handle.send(ServerFrame::ChatMessage {
                    message,
                    sender: ChatSender { id: from, role },
                });
            }
        }
        Ok(())
    }

    /// Relay a typing indicator to the peer. Dropped if there is none.
    pub async fn typing(&self, consultation_id: Uuid, conn_id: Uuid, is_typing: bool) {
        let rooms = self.inner.rooms.lock().await;
        let Some(room) = rooms.get(&consultation_id) else {
            return;
        };
        let Some(role) = room.role_of_conn(conn_id) else {
            return;
        };
        if let (Some(me), Some(peer)) = (room.slot(role), room.slot(role.other())) {
            peer.handle.send(ServerFrame::Typing {
                is_typing,
                user_id: me.user_id,
            });
        }
    }

    /// Close a consultation from outside the room: stop billing, end the
    /// consultation and tell whoever is still connected.
    ///
    /// The room stays in the map as `Closing` until the consultation is
    /// persisted as ended, so no one can rejoin it meanwhile. Out-of-funds
    /// closes skip the partial flush. Returns `NotActive` if there was
    /// neither a room nor an active consultation to end, or if another close
    /// is already under way.
    pub async fn end(
        &self,
        consultation_id: Uuid,
        reason: SessionEndReason,
    ) -> Result<Consultation, RoomError> {
        let (had_room, meter) = {
            let mut rooms = self.inner.rooms.lock().await;
            match rooms.get_mut(&consultation_id) {
                Some(room) if room.state == RoomState::Closing => {
                    return Err(RoomError::NotActive);
                }
                Some(room) => {
                    room.state = RoomState::Closing;
                    (true, room.meter.take())
                }
                None => (false, None),
            }
        };

        if let Some(meter) = meter {
            if reason == SessionEndReason::InsufficientFunds {
                meter.stop().await;
            } else {
                meter.stop_and_flush(self.db()).await;
            }
        }

        let ended = match self.end_persisted(consultation_id).await {
            Ok(ended) => ended,
            Err(e) => {
                self.reopen(consultation_id).await;
                return Err(e);
            }
        };
        let room = if had_room {
            self.inner.rooms.lock().await.remove(&consultation_id)
        } else {
            None
        };
        let consultation = match (ended, &room) {
            (Some(c), _) => c,
            (None, Some(_)) => {
                // Ended elsewhere while the room was still open.
                let db = self.db();
                tokio::task::spawn_blocking(move || db.get_consultation(consultation_id))
                    .await
                    .map_err(|e| RoomError::Store(e.into()))??
                    .ok_or(RoomError::NotFound)?
            }
            (None, None) => return Err(RoomError::NotActive),
        };

        let frame = ServerFrame::SessionEnded {
            consultation_id,
            reason,
            total_charged: consultation.total_charged,
        };
        let mut in_room = Vec::new();
        if let Some(mut room) = room {
            room.broadcast(&frame);
            in_room.extend(room.client.as_ref().map(|s| s.user_id));
            in_room.extend(room.consultant.as_ref().map(|s| s.user_id));
            room.state = RoomState::Closed;
        }
        for user in [consultation.client_id, consultation.consultant_id] {
            if !in_room.contains(&user) {
                self.inner
                    .bridge
                    .notify(
                        user,
                        NotificationEvent::SessionEnded {
                            consultation_id,
                            reason,
                        },
                    )
                    .await;
            }
        }

        info!(
            "Consultation {} ended ({}), total charged {}",
            consultation_id,
            reason.as_str(),
            consultation.total_charged
        );
        Ok(consultation)
    }

    /// Undo a `Closing` mark after the consultation could not be ended.
    async fn reopen(&self, consultation_id: Uuid) {
        let mut rooms = self.inner.rooms.lock().await;
        let Some(room) = rooms.get_mut(&consultation_id) else {
            return;
        };
        if room.is_empty() {
            rooms.remove(&consultation_id);
        } else if room.client.is_some() && room.consultant.is_some() {
            self.activate(room);
        } else {
            room.state = RoomState::SingleJoined;
        }
    }

    pub(crate) async fn close_for_insufficient_funds(
        self,
        consultation_id: Uuid,
        client_id: Uuid,
        balance: Decimal,
        required: Decimal,
    ) {
        if let Err(e) = self
            .end(consultation_id, SessionEndReason::InsufficientFunds)
            .await
        {
            error!("Failed to close consultation {}: {}", consultation_id, e);
        }
        self.inner
            .bridge
            .notify(
                client_id,
                NotificationEvent::LowBalance {
                    consultation_id,
                    balance,
                    required,
                },
            )
            .await;
    }

    pub(crate) async fn close_ended_elsewhere(self, consultation_id: Uuid) {
        if let Err(e) = self
            .end(consultation_id, SessionEndReason::EndedByParticipant)
            .await
        {
            debug!("Room {} already closed: {}", consultation_id, e);
        }
    }

    async fn end_persisted(&self, consultation_id: Uuid) -> Result<Option<Consultation>, RoomError> {
        let db = self.db();
        let ended = tokio::task::spawn_blocking(move || db.end_consultation(consultation_id))
            .await
            .map_err(|e| RoomError::Store(e.into()))??;
        Ok(ended)
    }

    pub async fn room_state(&self, consultation_id: Uuid) -> Option<RoomState> {
        self.inner
            .rooms
            .lock()
            .await
            .get(&consultation_id)
            .map(|r| r.state)
    }

    pub async fn active_rooms(&self) -> usize {
        self.inner.rooms.lock().await.len()
    }

    /// Time since the last join, leave or chat line.
    pub async fn idle_for(&self, consultation_id: Uuid) -> Option<Duration> {
        self.inner
            .rooms
            .lock()
            .await
            .get(&consultation_id)
            .map(|r| r.last_activity.elapsed())
    }
}
