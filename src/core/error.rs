//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps the
//! failure kinds the relay pipeline produces and implements proper HTTP
//! response conversion with the `{"error": {...}}` envelope clients expect.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for
/// consistent handling. Upstream provider errors keep the provider's own
/// message/type/code so clients see the original semantics.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed or invalid client request (bad JSON, invalid params)
    #[error("{0}")]
    InvalidRequest(String),

    /// Authentication/authorization failures
    #[error("{0}")]
    Unauthorized(String),

    /// Requested model has no routing group
    #[error("model not found")]
    ModelNotFound,

    /// Requested model is outside the API key's allow-list
    #[error("model not supported")]
    ModelNotSupported,

    /// No channel could serve the request
    #[error("no available channel")]
    NoAvailableChannel,

    /// Every retry round failed
    #[error("all channels failed")]
    AllChannelsFailed,

    /// Error surfaced by an upstream provider, with its envelope fields
    #[error("upstream error: {message}")]
    Upstream {
        status: u16,
        code: String,
        error_type: String,
        message: String,
    },

    /// HTTP request errors from the reqwest client
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database errors
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Generic internal server errors with custom message
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) | AppError::ModelNotSupported => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ModelNotFound => StatusCode::NOT_FOUND,
            AppError::NoAvailableChannel => StatusCode::SERVICE_UNAVAILABLE,
            AppError::AllChannelsFailed => StatusCode::BAD_GATEWAY,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            AppError::Serialization(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The `error.type` field in the client-facing envelope.
    fn error_type(&self) -> &str {
        match self {
            AppError::InvalidRequest(_) | AppError::ModelNotSupported => "invalid_request",
            AppError::Unauthorized(_) => "authentication_error",
            AppError::ModelNotFound => "not_found",
            AppError::Upstream { error_type, .. } if !error_type.is_empty() => error_type,
            AppError::Upstream { .. }
            | AppError::NoAvailableChannel
            | AppError::AllChannelsFailed
            | AppError::Request(_) => "upstream_error",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type().to_string();
        let code = match &self {
            AppError::Upstream { code, .. } if !code.is_empty() => code.clone(),
            _ => status.as_u16().to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
