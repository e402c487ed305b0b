use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use conselho_types::events::{ClientFrame, ErrorCode, ServerFrame};

use crate::Gateway;
use crate::auth::{AuthError, Identity};
use crate::registry::{ConnHandle, Outbound};
use crate::rooms::RoomError;

/// How long a closing socket gets to flush its last frames.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-socket state machine.
#[derive(Debug, Clone)]
enum ConnState {
    Unauthenticated,
    Authenticated(Identity),
    InRoom(Identity, Uuid),
}

/// Drive one `/ws` socket from `auth_required` to disconnect.
///
/// Outbound frames go through the socket's own queue and writer task, so
/// rooms, the notification bridge and the heartbeat never touch the socket
/// directly. Whatever ends the connection (client close, read error,
/// heartbeat prune, auth failure) runs the same cleanup.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut outbound) = ConnHandle::new();
    let conn_id = handle.conn_id();
    let cancel = CancellationToken::new();

    gateway.heartbeat().track(handle.clone(), cancel.clone());
    handle.send(ServerFrame::AuthRequired);
    debug!("Conn {} opened", conn_id);

    let mut writer = tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            let msg = match out {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        error!("Failed to serialize frame: {}", e);
                        continue;
                    }
                },
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        gateway: gateway.clone(),
        handle: handle.clone(),
        state: ConnState::Unauthenticated,
    };

    let flow = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Conn {} missed its heartbeat, dropping", conn_id);
                break Flow::Close;
            }
            _ = &mut writer => break Flow::Continue,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if session.handle_text(&text).await == Flow::Close {
                        break Flow::Close;
                    }
                }
                Some(Ok(Message::Pong(_))) => gateway.heartbeat().mark_alive(conn_id),
                Some(Ok(Message::Binary(_))) => {
                    handle.send(ServerFrame::error(
                        ErrorCode::ProtocolError,
                        "binary frames are not supported",
                    ));
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break Flow::Continue,
                Some(Err(e)) => {
                    debug!("Conn {} read error: {}", conn_id, e);
                    break Flow::Continue;
                }
            }
        }
    };

    session.disconnect().await;
    gateway.heartbeat().untrack(conn_id);

    if flow == Flow::Close {
        handle.close();
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        writer.abort();
    }
    debug!("Conn {} closed", conn_id);
}

struct Session {
    gateway: Gateway,
    handle: ConnHandle,
    state: ConnState,
}

impl Session {
    async fn handle_text(&mut self, text: &str) -> Flow {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "Conn {} bad frame: {} -- raw: {}",
                    self.handle.conn_id(),
                    e,
                    text.chars().take(200).collect::<String>()
                );
                self.handle.send(ServerFrame::error(
                    ErrorCode::ProtocolError,
                    format!("malformed frame: {}", e),
                ));
                return Flow::Continue;
            }
        };
        trace!("Conn {} <- {:?}", self.handle.conn_id(), frame);

        let identity = match &self.state {
            ConnState::Unauthenticated => None,
            ConnState::Authenticated(identity) | ConnState::InRoom(identity, _) => {
                Some(identity.clone())
            }
        };
        let (identity, frame) = match (identity, frame) {
            (_, ClientFrame::Ping {}) => {
                self.gateway.heartbeat().mark_alive(self.handle.conn_id());
                self.handle.send(ServerFrame::Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                return Flow::Continue;
            }
            (None, ClientFrame::Auth { token }) => return self.authenticate(&token).await,
            (None, _) => return self.reject(AuthError::NotAuthenticated),
            (Some(_), ClientFrame::Auth { .. }) => {
                self.handle.send(ServerFrame::error(
                    ErrorCode::ProtocolError,
                    "already authenticated",
                ));
                return Flow::Continue;
            }
            (Some(identity), frame) => (identity, frame),
        };
        match frame {
            ClientFrame::JoinConsultation { consultation_id } => {
                self.join(identity, consultation_id).await;
            }
            ClientFrame::LeaveConsultation {} => {
                if let ConnState::InRoom(_, room) = self.state {
                    self.gateway.rooms().leave(room, self.handle.conn_id()).await;
                    self.state = ConnState::Authenticated(identity);
                }
            }
            ClientFrame::ChatMessage { content } => {
                let ConnState::InRoom(_, room) = self.state else {
                    self.handle.send(RoomError::NotInRoom.frame());
                    return Flow::Continue;
                };
                if let Err(e) = self.gateway.rooms().chat(room, &self.handle, content).await {
                    self.room_error(e, identity);
                }
            }
            ClientFrame::Typing { is_typing } => {
                if let ConnState::InRoom(_, room) = self.state {
                    self.gateway
                        .rooms()
                        .typing(room, self.handle.conn_id(), is_typing)
                        .await;
                }
            }
            ClientFrame::Auth { .. } | ClientFrame::Ping {} => {}
        }
        Flow::Continue
    }

    async fn authenticate(&mut self, token: &str) -> Flow {
        let identity = match self.gateway.auth().verify(token) {
            Ok(identity) => identity,
            Err(e) => return self.reject(e),
        };

        self.gateway
            .registry()
            .register(identity.user_id, self.handle.clone())
            .await;
        self.handle.send(ServerFrame::AuthSuccess {
            identity: identity.user_id,
            role: identity.role,
        });
        info!(
            "{} ({}) authenticated on conn {}",
            identity.username,
            identity.user_id,
            self.handle.conn_id()
        );

        let db = self.gateway.db();
        let user_id = identity.user_id;
        match tokio::task::spawn_blocking(move || db.active_consultation_for(user_id)).await {
            Ok(Ok(Some(consultation))) => {
                self.handle.send(ServerFrame::ActiveConsultation {
                    consultation_id: consultation.id,
                });
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => error!("Active consultation lookup for {} failed: {}", user_id, e),
            Err(e) => error!("spawn_blocking join error: {}", e),
        }

        self.state = ConnState::Authenticated(identity);
        Flow::Continue
    }

    fn reject(&self, e: AuthError) -> Flow {
        warn!("Conn {} auth rejected: {}", self.handle.conn_id(), e);
        self.handle
            .send(ServerFrame::error(ErrorCode::AuthError, e.to_string()));
        Flow::Close
    }

    async fn join(&mut self, identity: Identity, consultation_id: Uuid) {
        let rooms = self.gateway.rooms();
        let (consultation, role) = match rooms.authorize(identity.user_id, consultation_id).await {
            Ok(found) => found,
            Err(e) => {
                debug!(
                    "{} cannot join {}: {}",
                    identity.user_id, consultation_id, e
                );
                if let RoomError::Store(inner) = &e {
                    error!("Join lookup failed: {:#}", inner);
                }
                self.handle.send(e.frame());
                return;
            }
        };

        if let ConnState::InRoom(_, current) = self.state {
            if current != consultation_id {
                rooms.leave(current, self.handle.conn_id()).await;
            }
        }
        match rooms
            .attach(consultation, role, identity.user_id, self.handle.clone())
            .await
        {
            Ok(()) => self.state = ConnState::InRoom(identity, consultation_id),
            Err(e) => {
                debug!("{} cannot join {}: {}", identity.user_id, consultation_id, e);
                if matches!(self.state, ConnState::InRoom(..)) {
                    self.state = ConnState::Authenticated(identity);
                }
                self.handle.send(e.frame());
            }
        }
    }

    fn room_error(&mut self, e: RoomError, identity: Identity) {
        match &e {
            // The slot was taken over by a newer socket or the room closed.
            RoomError::NotInRoom => self.state = ConnState::Authenticated(identity),
            RoomError::Store(inner) => error!("Room operation failed: {:#}", inner),
            _ => {}
        }
        self.handle.send(e.frame());
    }

    /// Same path for leave, close, read error and heartbeat prune.
    async fn disconnect(&mut self) {
        let conn_id = self.handle.conn_id();
        let state = std::mem::replace(&mut self.state, ConnState::Unauthenticated);
        let identity = match state {
            ConnState::Unauthenticated => return,
            ConnState::Authenticated(identity) => identity,
            ConnState::InRoom(identity, room) => {
                self.gateway.rooms().leave(room, conn_id).await;
                identity
            }
        };
        self.gateway
            .registry()
            .unregister(identity.user_id, conn_id)
            .await;
        info!("{} ({}) disconnected", identity.username, identity.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayConfig;
    use crate::auth::AuthGate;
    use conselho_db::Database;
    use conselho_types::models::Role;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    type Outbox = mpsc::UnboundedReceiver<Outbound>;

    struct Harness {
        _dir: tempfile::TempDir,
        gateway: Gateway,
        client: Uuid,
        consultant: Uuid,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conn.db");
        conselho_db::migrate(&path).unwrap();
        let db = Arc::new(Database::open(&path).unwrap());
        let client = Uuid::new_v4();
        let consultant = Uuid::new_v4();
        db.create_user(client, "cliente", "h", Role::Client).unwrap();
        db.create_consultant(consultant, "taro", "h", Decimal::new(350, 2))
            .unwrap();
        let gateway = Gateway::new(db, AuthGate::new("conn-test"), GatewayConfig::default());
        Harness {
            _dir: dir,
            gateway,
            client,
            consultant,
        }
    }

    fn session(gateway: &Gateway) -> (Session, Outbox) {
        let (handle, rx) = ConnHandle::new();
        (
            Session {
                gateway: gateway.clone(),
                handle,
                state: ConnState::Unauthenticated,
            },
            rx,
        )
    }

    fn frames(rx: &mut Outbox) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    async fn send(session: &mut Session, value: serde_json::Value) -> Flow {
        session.handle_text(&value.to_string()).await
    }

    #[tokio::test]
    async fn room_frames_before_auth_close_the_socket() {
        let h = harness();
        let (mut s, mut rx) = session(&h.gateway);

        let flow = send(
            &mut s,
            serde_json::json!({ "type": "join_consultation", "consultationId": Uuid::new_v4() }),
        )
        .await;
        assert_eq!(flow, Flow::Close);
        assert!(matches!(
            frames(&mut rx).as_slice(),
            [ServerFrame::Error { code: ErrorCode::AuthError, .. }]
        ));
        assert_eq!(h.gateway.rooms().active_rooms().await, 0);
    }

    #[tokio::test]
    async fn bad_token_closes_and_good_token_registers() {
        let h = harness();
        let (mut bad, mut bad_rx) = session(&h.gateway);
        let flow = send(&mut bad, serde_json::json!({ "type": "auth", "token": "nope" })).await;
        assert_eq!(flow, Flow::Close);
        assert!(matches!(
            frames(&mut bad_rx).as_slice(),
            [ServerFrame::Error { code: ErrorCode::AuthError, .. }]
        ));

        let token = h.gateway.auth().issue(h.client, "cliente", Role::Client).unwrap();
        let (mut good, mut good_rx) = session(&h.gateway);
        let flow = send(&mut good, serde_json::json!({ "type": "auth", "token": token })).await;
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(
            frames(&mut good_rx).as_slice(),
            [ServerFrame::AuthSuccess { identity, role: Role::Client }] if *identity == h.client
        ));
        assert!(h.gateway.registry().lookup(h.client).await.is_some());

        good.disconnect().await;
        assert!(h.gateway.registry().lookup(h.client).await.is_none());
    }

    #[tokio::test]
    async fn malformed_frames_get_protocol_error_and_keep_socket() {
        let h = harness();
        let (mut s, mut rx) = session(&h.gateway);
        assert_eq!(s.handle_text("{not json").await, Flow::Continue);
        assert_eq!(
            send(&mut s, serde_json::json!({ "type": "teleport" })).await,
            Flow::Continue
        );
        let got = frames(&mut rx);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|f| matches!(
            f,
            ServerFrame::Error { code: ErrorCode::ProtocolError, .. }
        )));

        assert_eq!(send(&mut s, serde_json::json!({ "type": "ping" })).await, Flow::Continue);
        assert!(matches!(frames(&mut rx).as_slice(), [ServerFrame::Pong { .. }]));
    }

    #[tokio::test]
    async fn reconnecting_user_is_told_about_active_consultation() {
        let h = harness();
        let consultation = h
            .gateway
            .db()
            .start_consultation(h.client, h.consultant)
            .unwrap();
        let token = h
            .gateway
            .auth()
            .issue(h.consultant, "taro", Role::Consultant)
            .unwrap();
        let (mut s, mut rx) = session(&h.gateway);
        send(&mut s, serde_json::json!({ "type": "auth", "token": token })).await;

        assert!(matches!(
            frames(&mut rx).as_slice(),
            [ServerFrame::AuthSuccess { .. }, ServerFrame::ActiveConsultation { consultation_id }]
                if *consultation_id == consultation.id
        ));
    }

    #[tokio::test]
    async fn join_chat_and_disconnect_through_sessions() {
        let h = harness();
        let consultation = h
            .gateway
            .db()
            .start_consultation(h.client, h.consultant)
            .unwrap();
        let auth = h.gateway.auth().clone();

        let (mut client, mut client_rx) = session(&h.gateway);
        let token = auth.issue(h.client, "cliente", Role::Client).unwrap();
        send(&mut client, serde_json::json!({ "type": "auth", "token": token })).await;
        let (mut consultant, mut consultant_rx) = session(&h.gateway);
        let token = auth.issue(h.consultant, "taro", Role::Consultant).unwrap();
        send(&mut consultant, serde_json::json!({ "type": "auth", "token": token })).await;
        frames(&mut client_rx);
        frames(&mut consultant_rx);

        // Chat before joining is a room error.
        send(&mut client, serde_json::json!({ "type": "chat_message", "content": "oi" })).await;
        assert!(matches!(
            frames(&mut client_rx).as_slice(),
            [ServerFrame::Error { code: ErrorCode::RoomError, .. }]
        ));

        let join = serde_json::json!({ "type": "join_consultation", "consultationId": consultation.id });
        send(&mut client, join.clone()).await;
        send(&mut consultant, join).await;
        frames(&mut client_rx);
        frames(&mut consultant_rx);

        send(&mut client, serde_json::json!({ "type": "chat_message", "content": "oi" })).await;
        assert!(matches!(frames(&mut client_rx).as_slice(), [ServerFrame::MessageSent { .. }]));
        assert!(matches!(
            frames(&mut consultant_rx).as_slice(),
            [ServerFrame::ChatMessage { .. }]
        ));

        consultant.disconnect().await;
        assert!(matches!(
            frames(&mut client_rx).as_slice(),
            [ServerFrame::ParticipantLeft { .. }]
        ));
        client.disconnect().await;
        assert_eq!(h.gateway.rooms().active_rooms().await, 0);
        assert!(!h
            .gateway
            .db()
            .get_consultation(consultation.id)
            .unwrap()
            .unwrap()
            .is_active());
    }

    #[tokio::test]
    async fn strangers_cannot_join() {
        let h = harness();
        let consultation = h
            .gateway
            .db()
            .start_consultation(h.client, h.consultant)
            .unwrap();
        let stranger = Uuid::new_v4();
        h.gateway
            .db()
            .create_user(stranger, "curioso", "h", Role::Client)
            .unwrap();
        let token = h.gateway.auth().issue(stranger, "curioso", Role::Client).unwrap();

        let (mut s, mut rx) = session(&h.gateway);
        send(&mut s, serde_json::json!({ "type": "auth", "token": token })).await;
        frames(&mut rx);
        let flow = send(
            &mut s,
            serde_json::json!({ "type": "join_consultation", "consultationId": consultation.id }),
        )
        .await;
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(
            frames(&mut rx).as_slice(),
            [ServerFrame::Error { code: ErrorCode::RoomError, .. }]
        ));
        assert_eq!(h.gateway.rooms().active_rooms().await, 0);
    }
}
