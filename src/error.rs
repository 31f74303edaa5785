use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackplaneError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found for user {0}")]
    ContainerNotFound(String),

    #[error("Container creation failed: {0}")]
    ContainerCreateFailed(String),

    #[error("Container did not become ready within {0} seconds")]
    ContainerStartupTimeout(u64),

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Invalid path: {0}")]
    PathInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Registry error: {0}")]
    Registry(#[from] crate::database::DatabaseError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for BackplaneError {
    fn into_response(self) -> Response {
        let status = match &self {
            BackplaneError::ContainerNotFound(_) | BackplaneError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            BackplaneError::PathInvalid(_) => StatusCode::BAD_REQUEST,
            BackplaneError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BackplaneError::Timeout(_) | BackplaneError::ContainerStartupTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Client-visible payloads carry a human-readable message, never a stack trace
        let body = Json(json!({
            "error": true,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, BackplaneError>;
