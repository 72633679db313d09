use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::identity::IdentityError;

/// Message returned to clients whose bucket is empty.
pub const RATE_LIMIT_MESSAGE: &str = "Connection limit exceeded. Please try again later.";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Unable to resolve client identity: {0}")]
    IdentityUnresolvable(#[from] IdentityError),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

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

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Config(msg) => Self::new("configuration_error", msg, 500),
            Error::Validation(errors) => Self::new("validation_error", &errors.to_string(), 422),
            // The resolution failure is logged, not echoed back to the client.
            Error::IdentityUnresolvable(_) => {
                Self::new("internal_error", "Internal Server Error", 500)
            }
            Error::RateLimitExceeded => Self::new("rate_limit_exceeded", RATE_LIMIT_MESSAGE, 429),
            Error::Io(e) => Self::new("internal_error", &e.to_string(), 500),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_error(&self);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_maps_to_429() {
        let body = ErrorResponse::from_error(&Error::RateLimitExceeded);
        assert_eq!(body.code, 429);
        assert_eq!(body.message, RATE_LIMIT_MESSAGE);
    }

    #[test]
    fn test_identity_failure_is_internal_error() {
        let err = Error::from(IdentityError::MissingPort("10.0.0.1".to_string()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::Config("bad bind address".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad bind address");
    }
}
