//! End-to-end tests over a real socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use conselho_api::AppStateInner;
use conselho_db::Database;
use conselho_gateway::auth::AuthGate;
use conselho_gateway::rooms::RoomState;
use conselho_gateway::{Gateway, GatewayConfig};
use conselho_server::build_router;
use conselho_types::models::{Consultation, Role};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    _dir: tempfile::TempDir,
    url: String,
    db: Arc<Database>,
    gateway: Gateway,
    client: Uuid,
    consultant: Uuid,
}

impl TestServer {
    fn token(&self, user: Uuid, role: Role) -> String {
        self.gateway.auth().issue(user, "tester", role).unwrap()
    }

    fn start_consultation(&self) -> Consultation {
        self.db.start_consultation(self.client, self.consultant).unwrap()
    }
}

/// Boot a server on an ephemeral port with a seeded client and consultant.
async fn boot_server(config: GatewayConfig, client_funds: Option<&str>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("e2e.db");
    conselho_db::migrate(&path).unwrap();
    let db = Arc::new(Database::open(&path).unwrap());

    let client = Uuid::new_v4();
    let consultant = Uuid::new_v4();
    db.create_user(client, "cliente", "h", Role::Client).unwrap();
    db.create_consultant(consultant, "taro", "h", Decimal::new(350, 2))
        .unwrap();
    if let Some(funds) = client_funds {
        db.add_credits(client, funds.parse().unwrap(), "seed").unwrap();
    }

    let gateway = Gateway::new(db.clone(), AuthGate::new("e2e-secret"), config);
    let app = build_router(AppStateInner::new(gateway.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        _dir: dir,
        url: format!("ws://{}/ws", addr),
        db,
        gateway,
        client,
        consultant,
    }
}

async fn connect(url: &str) -> WsStream {
    let (mut ws, _) = connect_async(url).await.unwrap();
    assert_eq!(read_json(&mut ws).await["type"], "auth_required");
    ws
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until a frame of `frame_type` arrives.
async fn read_until(ws: &mut WsStream, frame_type: &str) -> Value {
    loop {
        let frame = read_json(ws).await;
        if frame["type"] == frame_type {
            return frame;
        }
    }
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn authenticate(ws: &mut WsStream, token: &str) -> Value {
    send(ws, json!({ "type": "auth", "token": token })).await;
    read_json(ws).await
}

#[tokio::test]
async fn invalid_token_gets_one_error_then_close() {
    let server = boot_server(GatewayConfig::default(), None).await;
    let mut ws = connect(&server.url).await;

    let frame = authenticate(&mut ws, "not-a-token").await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "auth_error");

    // Nothing but the close handshake follows.
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("socket left open") {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(Message::Text(text))) => panic!("unexpected frame after auth error: {}", text),
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn room_frames_before_auth_are_rejected() {
    let server = boot_server(GatewayConfig::default(), None).await;
    let consultation = server.start_consultation();
    let mut ws = connect(&server.url).await;

    send(
        &mut ws,
        json!({ "type": "join_consultation", "consultationId": consultation.id }),
    )
    .await;
    let frame = read_json(&mut ws).await;
    assert_eq!(frame["code"], "auth_error");
    assert_eq!(server.gateway.rooms().active_rooms().await, 0);
}

#[tokio::test]
async fn join_chat_and_leave_end_to_end() {
    let server = boot_server(GatewayConfig::default(), Some("100.00")).await;
    let consultation = server.start_consultation();
    let id = consultation.id.to_string();

    let mut client = connect(&server.url).await;
    let frame = authenticate(&mut client, &server.token(server.client, Role::Client)).await;
    assert_eq!(frame["type"], "auth_success");
    assert_eq!(frame["role"], "client");
    let frame = read_json(&mut client).await;
    assert_eq!(frame["type"], "active_consultation");
    assert_eq!(frame["consultationId"], id.as_str());

    let mut consultant = connect(&server.url).await;
    authenticate(&mut consultant, &server.token(server.consultant, Role::Consultant)).await;
    read_until(&mut consultant, "active_consultation").await;

    send(&mut client, json!({ "type": "join_consultation", "consultationId": id })).await;
    let frame = read_json(&mut client).await;
    assert_eq!(frame["type"], "joined_consultation");
    assert_eq!(frame["consultation"]["price_per_minute_snapshot"], "3.50");

    send(&mut consultant, json!({ "type": "join_consultation", "consultationId": id })).await;
    assert_eq!(read_json(&mut consultant).await["type"], "joined_consultation");
    assert_eq!(read_json(&mut consultant).await["type"], "participant_joined");
    assert_eq!(read_json(&mut client).await["type"], "participant_joined");

    send(&mut client, json!({ "type": "chat_message", "content": "Boa noite" })).await;
    let ack = read_json(&mut client).await;
    assert_eq!(ack["type"], "message_sent");
    assert_eq!(ack["message"]["content"], "Boa noite");
    let relayed = read_json(&mut consultant).await;
    assert_eq!(relayed["type"], "chat_message");
    assert_eq!(relayed["sender"]["role"], "client");
    assert_eq!(relayed["sender"]["id"], server.client.to_string());

    send(&mut consultant, json!({ "type": "typing", "isTyping": true })).await;
    let typing = read_json(&mut client).await;
    assert_eq!(typing["type"], "typing");
    assert_eq!(typing["isTyping"], true);

    send(&mut client, json!({ "type": "ping" })).await;
    assert_eq!(read_json(&mut client).await["type"], "pong");

    client.close(None).await.unwrap();
    assert_eq!(read_json(&mut consultant).await["type"], "participant_left");
}

#[tokio::test]
async fn empty_balance_ends_session_on_first_tick() {
    let config = GatewayConfig {
        heartbeat_interval: Duration::from_secs(30),
        billing_period: Duration::from_millis(100),
    };
    let server = boot_server(config, None).await;
    let consultation = server.start_consultation();
    let id = consultation.id.to_string();

    let mut client = connect(&server.url).await;
    authenticate(&mut client, &server.token(server.client, Role::Client)).await;
    let mut consultant = connect(&server.url).await;
    authenticate(&mut consultant, &server.token(server.consultant, Role::Consultant)).await;

    for ws in [&mut client, &mut consultant] {
        send(ws, json!({ "type": "join_consultation", "consultationId": id })).await;
    }

    for ws in [&mut client, &mut consultant] {
        let ended = read_until(ws, "session_ended").await;
        assert_eq!(ended["reason"], "insufficient_funds");
        assert_eq!(ended["consultationId"], id.as_str());
        assert_eq!(ended["totalCharged"], "0.00");
    }

    let notification = read_until(&mut client, "notification").await;
    assert_eq!(notification["notification"]["kind"], "low_balance");

    let stored = server.db.get_consultation(consultation.id).unwrap().unwrap();
    assert!(!stored.is_active());
}

#[tokio::test]
async fn silent_socket_is_pruned_from_its_room_by_heartbeat() {
    let config = GatewayConfig {
        heartbeat_interval: Duration::from_millis(150),
        billing_period: Duration::from_millis(100),
    };
    let server = boot_server(config, Some("100.00")).await;
    server.gateway.spawn_heartbeat();
    let consultation = server.start_consultation();
    let id = consultation.id.to_string();

    let mut consultant = connect(&server.url).await;
    authenticate(&mut consultant, &server.token(server.consultant, Role::Consultant)).await;
    send(&mut consultant, json!({ "type": "join_consultation", "consultationId": id })).await;
    read_until(&mut consultant, "joined_consultation").await;

    // A raw client that never reads never answers pings.
    let (mut silent, _) = connect_async(&server.url).await.unwrap();
    send(&mut silent, json!({ "type": "auth", "token": server.token(server.client, Role::Client) }))
        .await;
    send(&mut silent, json!({ "type": "join_consultation", "consultationId": id })).await;

    read_until(&mut consultant, "participant_joined").await;
    let left = read_until(&mut consultant, "participant_left").await;
    assert_eq!(left["consultationId"], id.as_str());

    let rooms = server.gateway.rooms();
    assert_eq!(rooms.room_state(consultation.id).await, Some(RoomState::SingleJoined));
    assert!(server.gateway.registry().lookup(server.client).await.is_none());
    assert!(
        server
            .db
            .get_consultation(consultation.id)
            .unwrap()
            .unwrap()
            .is_active()
    );

    // Billing is paused: no further charges while the consultant waits,
    // and reading keeps the consultant answering pings.
    let _ = timeout(Duration::from_millis(150), read_until(&mut consultant, "never")).await;
    let charged = server.db.all_transactions(server.client).unwrap().len();
    let _ = timeout(Duration::from_millis(500), read_until(&mut consultant, "never")).await;
    assert_eq!(server.db.all_transactions(server.client).unwrap().len(), charged);
    assert_eq!(rooms.room_state(consultation.id).await, Some(RoomState::SingleJoined));
    assert_eq!(server.gateway.heartbeat().tracked(), 1);
}
