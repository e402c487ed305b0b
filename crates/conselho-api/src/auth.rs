use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use uuid::Uuid;

use conselho_db::ledger::validate_amount;
use conselho_db::queries::is_unique_violation;
use conselho_gateway::auth::AuthError;
use conselho_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use conselho_types::models::Role;

use crate::AppState;
use crate::error::{ApiError, join_error};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate input
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::BadRequest(
            "username must be 3 to 32 characters".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "password must be at least 8 characters".into(),
        ));
    }
    let price_per_minute = match (req.role, req.price_per_minute) {
        (Role::Consultant, Some(price)) => Some(validate_amount(price)?),
        (Role::Consultant, None) => {
            return Err(ApiError::BadRequest(
                "consultants must set price_per_minute".into(),
            ));
        }
        (Role::Client, Some(_)) => {
            return Err(ApiError::BadRequest(
                "only consultants have a price_per_minute".into(),
            ));
        }
        (Role::Client, None) => None,
    };

    let db = state.db.clone();
    let username = req.username.clone();
    let taken = tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
        .await
        .map_err(join_error)??
        .is_some();
    if taken {
        return Err(ApiError::Conflict("username already taken".into()));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))?
        .to_string();

    let user_id = Uuid::new_v4();
    let db = state.db.clone();
    let username = req.username.clone();
    let role = req.role;
    tokio::task::spawn_blocking(move || match price_per_minute {
        Some(price) => db.create_consultant(user_id, &username, &password_hash, price),
        None => db.create_user(user_id, &username, &password_hash, role),
    })
    .await
    .map_err(join_error)?
    .map_err(registration_error)?;

    let token = state.gateway.auth().issue(user_id, &req.username, req.role)?;
    info!("Registered {} {} ({})", req.role.as_str(), req.username, user_id);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

/// A concurrent registration can win the race past the lookup above.
fn registration_error(e: anyhow::Error) -> ApiError {
    if is_unique_violation(&e) {
        ApiError::Conflict("username already taken".into())
    } else {
        ApiError::Internal(e)
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
        .await
        .map_err(join_error)??
        .ok_or(AuthError::Invalid)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("stored hash unreadable: {}", e)))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| AuthError::Invalid)?;

    let token = state.gateway.auth().issue(user.id, &user.username, user.role)?;

    Ok(Json(LoginResponse {
        user_id: user.id,
        username: user.username,
        role: user.role,
        token,
    }))
}
