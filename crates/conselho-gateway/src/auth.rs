use conselho_types::api::Claims;
use conselho_types::models::Role;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

/// Session tokens live for 30 days.
const TOKEN_TTL_DAYS: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token not provided")]
    MissingToken,

    #[error("token expired")]
    Expired,

    #[error("invalid token")]
    Invalid,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("could not issue token: {0}")]
    Issue(#[from] jsonwebtoken::errors::Error),
}

/// Who is on the other end of a socket or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
        }
    }
}

/// Issues and verifies HS256 session tokens. Shared by the WebSocket
/// handshake and the HTTP middleware.
#[derive(Clone)]
pub struct AuthGate {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthGate {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;
        Ok(data.claims.into())
    }

    pub fn issue(&self, user_id: Uuid, username: &str, role: Role) -> Result<String, AuthError> {
        let exp = (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp();
        self.issue_with_expiry(user_id, username, role, exp)
    }

    fn issue_with_expiry(
        &self,
        user_id: Uuid,
        username: &str,
        role: Role,
        exp: i64,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            role,
            exp: exp.max(0) as usize,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }
}
