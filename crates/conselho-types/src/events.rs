use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, Consultation, Role};

/// Frames sent FROM client TO server over the `/ws` socket.
///
/// Anything that does not deserialize into one of these variants is answered
/// with a `protocol_error` and otherwise ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Authenticate the socket. Must be the first frame.
    Auth { token: String },

    /// Enter the room of a consultation the caller takes part in
    JoinConsultation { consultation_id: Uuid },

    /// Leave the current room
    LeaveConsultation {},

    /// Post a chat line to the current room
    ChatMessage { content: String },

    /// Typing indicator, relayed to the peer only
    Typing { is_typing: bool },

    /// Application-level keepalive
    Ping {},
}

/// Frames sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Sent as soon as the socket opens
    AuthRequired,

    AuthSuccess { identity: Uuid, role: Role },

    /// The user already has a running consultation they can re-join
    ActiveConsultation { consultation_id: Uuid },

    JoinedConsultation {
        consultation_id: Uuid,
        consultation: Consultation,
    },

    ParticipantJoined { consultation_id: Uuid },

    ParticipantLeft { consultation_id: Uuid },

    /// A chat line relayed from the peer
    ChatMessage {
        message: ChatMessage,
        sender: ChatSender,
    },

    /// Acknowledges a chat line to its sender
    MessageSent { message: ChatMessage },

    Typing { is_typing: bool, user_id: Uuid },

    /// The room was closed by the server
    SessionEnded {
        consultation_id: Uuid,
        reason: SessionEndReason,
        total_charged: Decimal,
    },

    Pong { timestamp: i64 },

    Notification { notification: Notification },

    Error { error: String, code: ErrorCode },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSender {
    pub id: Uuid,
    pub role: Role,
}

/// Error classes reported in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    RoomError,
    TransactionError,
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    InsufficientFunds,
    EndedByParticipant,
}

impl SessionEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientFunds => "insufficient_funds",
            Self::EndedByParticipant => "ended_by_participant",
        }
    }
}

/// Events pushed to a user's current socket, whether or not they are in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum NotificationEvent {
    CreditsAdded {
        amount: Decimal,
        balance: Decimal,
        reference_id: String,
    },
    CreditsDebited {
        amount: Decimal,
        balance: Decimal,
        reference_id: String,
    },
    TransferReceived {
        from_user_id: Uuid,
        amount: Decimal,
        balance: Decimal,
    },
    LowBalance {
        consultation_id: Uuid,
        balance: Decimal,
        required: Decimal,
    },
    SessionEnded {
        consultation_id: Uuid,
        reason: SessionEndReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(flatten)]
    pub event: NotificationEvent,
    pub created_at: DateTime<Utc>,
    /// Set by the bridge once the frame was handed to a live socket.
    #[serde(skip)]
    pub delivered: bool,
}

impl Notification {
    pub fn new(user_id: Uuid, event: NotificationEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            event,
            created_at: Utc::now(),
            delivered: false,
        }
    }
}
