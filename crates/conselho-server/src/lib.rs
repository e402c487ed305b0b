pub mod config;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use conselho_api::AppState;
use conselho_gateway::{Gateway, connection};

/// The full application: HTTP routes plus the `/ws` consultation socket.
pub fn build_router(state: AppState) -> Router {
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state.gateway.clone());

    Router::new()
        .merge(conselho_api::routes(state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(gateway): State<Gateway>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway))
}
