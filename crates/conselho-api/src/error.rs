use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conselho_db::consultations::ConsultationError;
use conselho_db::ledger::LedgerError;
use conselho_gateway::auth::AuthError;
use conselho_gateway::rooms::RoomError;
use conselho_types::api::ErrorResponse;
use tracing::error;

/// Every way an HTTP handler can fail, mapped to a status code and an
/// `ErrorResponse` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Consultation(#[from] ConsultationError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        use StatusCode as S;
        match self {
            Self::Auth(AuthError::Issue(_)) => (S::INTERNAL_SERVER_ERROR, "internal_error"),
            Self::Auth(_) => (S::UNAUTHORIZED, "auth_error"),

            Self::Ledger(LedgerError::InvalidAmount) => (S::BAD_REQUEST, "invalid_amount"),
            Self::Ledger(LedgerError::Overflow) => (S::UNPROCESSABLE_ENTITY, "invalid_amount"),
            Self::Ledger(LedgerError::InsufficientFunds { .. }) => {
                (S::PAYMENT_REQUIRED, "insufficient_funds")
            }
            Self::Ledger(LedgerError::SelfTransfer) => (S::BAD_REQUEST, "self_transfer"),
            Self::Ledger(LedgerError::UnknownAccount(_)) => (S::NOT_FOUND, "unknown_account"),
            Self::Ledger(LedgerError::ConsultationNotActive(_)) => (S::CONFLICT, "room_error"),
            Self::Ledger(LedgerError::Transaction(_)) => {
                (S::INTERNAL_SERVER_ERROR, "transaction_error")
            }

            Self::Consultation(ConsultationError::NotFound)
            | Self::Consultation(ConsultationError::ConsultantNotFound) => {
                (S::NOT_FOUND, "room_error")
            }
            Self::Consultation(ConsultationError::NotParticipant) => (S::FORBIDDEN, "room_error"),
            Self::Consultation(ConsultationError::NotActive)
            | Self::Consultation(ConsultationError::ConsultantUnavailable)
            | Self::Consultation(ConsultationError::AlreadyActive(_)) => {
                (S::CONFLICT, "room_error")
            }
            Self::Consultation(ConsultationError::Store(_)) => {
                (S::INTERNAL_SERVER_ERROR, "transaction_error")
            }

            Self::Room(RoomError::NotFound) => (S::NOT_FOUND, "room_error"),
            Self::Room(RoomError::NotParticipant) => (S::FORBIDDEN, "room_error"),
            Self::Room(RoomError::NotActive) | Self::Room(RoomError::NotInRoom) => {
                (S::CONFLICT, "room_error")
            }
            Self::Room(RoomError::EmptyMessage) => (S::BAD_REQUEST, "room_error"),
            Self::Room(RoomError::Store(_)) => (S::INTERNAL_SERVER_ERROR, "transaction_error"),

            Self::BadRequest(_) => (S::BAD_REQUEST, "bad_request"),
            Self::Forbidden(_) => (S::FORBIDDEN, "forbidden"),
            Self::Conflict(_) => (S::CONFLICT, "conflict"),
            Self::Internal(_) => (S::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();

        // Server-side failures are logged in full and reported generically.
        let message = if status.is_server_error() {
            error!("Request failed: {:#}", self);
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let (current_balance, required) = match &self {
            Self::Ledger(LedgerError::InsufficientFunds { balance, required }) => {
                (Some(*balance), Some(*required))
            }
            _ => (None, None),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            current_balance,
            required,
        };
        (status, Json(body)).into_response()
    }
}

/// Flatten a `spawn_blocking` join failure into a 500.
pub(crate) fn join_error(e: tokio::task::JoinError) -> ApiError {
    error!("spawn_blocking join error: {}", e);
    ApiError::Internal(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn statuses_follow_error_taxonomy() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (AuthError::Expired.into(), StatusCode::UNAUTHORIZED),
            (LedgerError::InvalidAmount.into(), StatusCode::BAD_REQUEST),
            (LedgerError::Overflow.into(), StatusCode::UNPROCESSABLE_ENTITY),
            (
                LedgerError::InsufficientFunds {
                    balance: Decimal::ONE,
                    required: Decimal::TWO,
                }
                .into(),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (RoomError::NotFound.into(), StatusCode::NOT_FOUND),
            (RoomError::NotParticipant.into(), StatusCode::FORBIDDEN),
            (
                ConsultationError::ConsultantUnavailable.into(),
                StatusCode::CONFLICT,
            ),
            (
                LedgerError::Transaction(anyhow::anyhow!("disk on fire")).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
