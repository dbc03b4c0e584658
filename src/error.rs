use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Stream lifecycle errors
///
/// `Clone` so that every caller joined onto one in-flight start attempt
/// receives the same failure the original starter saw.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid pipeline configuration: {0}")]
    ConfigInvalid(String),

    #[error("No free port found after {attempts} attempts")]
    NoPortFound { attempts: u32 },

    #[error("Failed to spawn pipeline: {0}")]
    SpawnFailed(String),

    /// Pipeline died during its startup settle window (typically a port bind
    /// race); the controller retries with a fresh port.
    #[error("Pipeline exited during startup: {0}")]
    EarlyExit(String),

    #[error("Pipeline process crashed: {0}")]
    ProcessCrashed(String),

    #[error("Camera did not respond to stream activation: {0}")]
    UpstreamUnresponsive(String),

    #[error("No active stream to refresh")]
    RefreshOnNoSession,

    #[error("Stream start aborted by a concurrent stop")]
    StartAborted,
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::Stream(e) => match e {
                StreamError::ConfigInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
                // Caller should issue a fresh start
                StreamError::RefreshOnNoSession => StatusCode::CONFLICT,
                StreamError::StartAborted => StatusCode::CONFLICT,
                StreamError::NoPortFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            AppError::Stream(e) => Some(match e {
                StreamError::ConfigInvalid(_) => "config_invalid",
                StreamError::NoPortFound { .. } => "no_port_found",
                StreamError::SpawnFailed(_) | StreamError::EarlyExit(_) => "spawn_failed",
                StreamError::ProcessCrashed(_) => "process_crashed",
                StreamError::UpstreamUnresponsive(_) => "upstream_unresponsive",
                StreamError::RefreshOnNoSession => "refresh_on_no_session",
                StreamError::StartAborted => "start_aborted",
            }),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
            code: self.code(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_status() {
        let err = AppError::from(StreamError::RefreshOnNoSession);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), Some("refresh_on_no_session"));

        let err = AppError::from(StreamError::NoPortFound { attempts: 10 });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().contains("10 attempts"));
    }

    #[test]
    fn test_not_found_has_no_code() {
        let err = AppError::NotFound("camera abcd".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), None);
    }
}
