pub mod auth;
pub mod consultations;
pub mod credits;
pub mod error;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use conselho_db::Database;
use conselho_gateway::Gateway;
use serde_json::{Value, json};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: Gateway,
}

impl AppStateInner {
    pub fn new(gateway: Gateway) -> AppState {
        Arc::new(Self {
            db: gateway.db(),
            gateway,
        })
    }
}

/// The HTTP surface: public auth and health routes, everything else behind
/// `require_auth`.
pub fn routes(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/credits/balance", get(credits::balance))
        .route("/credits/transactions", get(credits::transactions))
        .route("/credits/add", post(credits::add))
        .route("/credits/debit", post(credits::debit))
        .route("/credits/transfer", post(credits::transfer))
        .route("/consultations/start", post(consultations::start))
        .route("/consultations/active", get(consultations::active))
        .route("/consultations/{consultation_id}", get(consultations::get_consultation))
        .route("/consultations/{consultation_id}/end", post(consultations::end))
        .route(
            "/consultations/{consultation_id}/messages",
            get(consultations::messages),
        )
        .layer(from_fn_with_state(state.clone(), middleware::require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.gateway.rooms().active_rooms().await,
        "connections": state.gateway.registry().len().await,
    }))
}
