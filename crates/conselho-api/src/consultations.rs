use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use conselho_gateway::auth::Identity;
use conselho_types::api::StartConsultationRequest;
use conselho_types::events::SessionEndReason;
use conselho_types::models::{ChatMessage, Consultation, Role};

use crate::AppState;
use crate::error::{ApiError, join_error};

/// Cap on transcript lines returned by the messages route, oldest first.
const MESSAGE_LIMIT: u32 = 500;

pub async fn start(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<StartConsultationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if identity.role != Role::Client {
        return Err(ApiError::Forbidden(
            "only clients can start consultations".into(),
        ));
    }
    let db = state.db.clone();
    let consultation = tokio::task::spawn_blocking(move || {
        db.start_consultation(identity.user_id, req.consultant_id)
    })
    .await
    .map_err(join_error)??;

    Ok((StatusCode::CREATED, Json(consultation)))
}

/// End a consultation the caller takes part in, closing its room if open.
pub async fn end(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Consultation>, ApiError> {
    participant_view(&state, consultation_id, identity.user_id).await?;
    let consultation = state
        .gateway
        .end_consultation(consultation_id, SessionEndReason::EndedByParticipant)
        .await?;
    Ok(Json(consultation))
}

pub async fn active(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Option<Consultation>>, ApiError> {
    let db = state.db.clone();
    let consultation =
        tokio::task::spawn_blocking(move || db.active_consultation_for(identity.user_id))
            .await
            .map_err(join_error)??;
    Ok(Json(consultation))
}

pub async fn get_consultation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Consultation>, ApiError> {
    let consultation = participant_view(&state, consultation_id, identity.user_id).await?;
    Ok(Json(consultation))
}

pub async fn messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(consultation_id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    participant_view(&state, consultation_id, identity.user_id).await?;
    let db = state.db.clone();
    let messages =
        tokio::task::spawn_blocking(move || db.get_messages(consultation_id, MESSAGE_LIMIT))
            .await
            .map_err(join_error)??;
    Ok(Json(messages))
}

async fn participant_view(
    state: &AppState,
    consultation_id: Uuid,
    user_id: Uuid,
) -> Result<Consultation, ApiError> {
    let db = state.db.clone();
    let consultation =
        tokio::task::spawn_blocking(move || db.consultation_for_participant(consultation_id, user_id))
            .await
            .map_err(join_error)??;
    Ok(consultation)
}
