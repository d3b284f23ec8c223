use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Gave up after {0} conflicting writes")]
    ContentionExhausted(u32),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Missing user id")]
    MissingUserId,
}

impl ThrottlerError {
    /// Failures that mean "the shard could not be used for this call".
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ThrottlerError::Redis(_)
                | ThrottlerError::Timeout(_)
                | ThrottlerError::ContentionExhausted(_)
        )
    }
}

impl From<redis::RedisError> for ThrottlerError {
    fn from(err: redis::RedisError) -> Self {
        ThrottlerError::Redis(err.to_string())
    }
}

impl From<prometheus::Error> for ThrottlerError {
    fn from(err: prometheus::Error) -> Self {
        ThrottlerError::InternalError(format!("metrics: {}", err))
    }
}

impl From<serde_json::Error> for ThrottlerError {
    fn from(err: serde_json::Error) -> Self {
        ThrottlerError::Serialization(err.to_string())
    }
}

pub type ThrottlerResult<T> = std::result::Result<T, ThrottlerError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_error(err: &ThrottlerError) -> Self {
        let message = err.to_string();
        match err {
            ThrottlerError::InvalidRequest(_) => Self::new("bad_request", &message, 400),
            ThrottlerError::MissingApiKey | ThrottlerError::MissingUserId => {
                Self::new("unauthorized", &message, 401)
            }
            ThrottlerError::ValidationError(_) => Self::new("validation_error", &message, 422),
            ThrottlerError::Redis(_)
            | ThrottlerError::Timeout(_)
            | ThrottlerError::ContentionExhausted(_) => {
                Self::new("service_unavailable", &message, 503)
            }
            ThrottlerError::ConfigurationError(_) => {
                Self::new("configuration_error", &message, 500)
            }
            ThrottlerError::Serialization(_) | ThrottlerError::InternalError(_) => {
                Self::new("internal_error", &message, 500)
            }
        }
    }
}

impl IntoResponse for ThrottlerError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}
