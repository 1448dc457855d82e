// src/error.rs
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;
use uuid::Uuid;

use crate::llm::LlmError;
use crate::models::auth::ErrorResponse;
use crate::provenance::LogDecodeError;
use crate::store::StoreError;

/// Error taxonomy of the conversation engine. Validation and not-found
/// errors fire before any state mutation; generation and async persistence
/// failures are logged and leave readers unblocked.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("a generation is already running for branch {0}")]
    GenerationInProgress(Uuid),
    #[error("generation failed: {0}")]
    Generation(#[from] LlmError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("provenance log corrupted: {0}")]
    Decode(#[from] LogDecodeError),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::GenerationInProgress(_) => StatusCode::CONFLICT,
            ChatError::Generation(_) => StatusCode::BAD_GATEWAY,
            ChatError::Persistence(_) | ChatError::Decode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        } else {
            tracing::warn!("request rejected: {self}");
        }
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ChatError::NotFound("chat").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ChatError::validation("prompt shouldn't be empty").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ChatError::GenerationInProgress(Uuid::new_v4()).status(),
            StatusCode::CONFLICT
        );
    }
}
