use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use voice_core::VoiceError;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Voice(e) => match e {
                VoiceError::InvalidInput(_) | VoiceError::InsufficientAudio { .. } => {
                    StatusCode::BAD_REQUEST
                }
                VoiceError::AlignmentFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                VoiceError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
                VoiceError::Cancelled => StatusCode::CONFLICT,
                VoiceError::Interrupted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body shared by HTTP responses and WebSocket `error` messages.
    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.to_string(),
            code: self.status().as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
