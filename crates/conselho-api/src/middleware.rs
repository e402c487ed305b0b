use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use conselho_gateway::auth::AuthError;

use crate::AppState;
use crate::error::ApiError;

/// Validate the `Authorization: Bearer` token and attach the caller's
/// `Identity` to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MissingToken)?;

    let identity = state.gateway.auth().verify(token)?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
