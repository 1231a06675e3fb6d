use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facedex_core::{EmbedError, MatchError};
use serde_json::json;
use thiserror::Error;

use crate::engine::EngineError;
use crate::store::StoreError;

/// Every failure a handler can report. Rendered as `{"error": "..."}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No face found")]
    NoFaceDetected,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(format!("malformed multipart body: {}", err.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NoFaceDetected => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Store(StoreError::Validation(msg)) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Store(err) => {
                tracing::error!(error = %err, "store operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "DB error".to_string())
            }
            ApiError::Match(err) => {
                tracing::error!(error = %err, "matching aborted");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Engine(EngineError::Embed(EmbedError::Decode(err))) => {
                (StatusCode::BAD_REQUEST, format!("Invalid image: {err}"))
            }
            ApiError::Engine(EngineError::ChannelClosed) => {
                tracing::error!("engine thread is gone");
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ApiError::Engine(err) => {
                tracing::error!(error = %err, "face embedding failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::NoFaceDetected, StatusCode::BAD_REQUEST),
            (ApiError::BadRequest("missing name".into()), StatusCode::BAD_REQUEST),
            (
                ApiError::Store(StoreError::Validation("empty".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Store(StoreError::WriteFailure("disk full".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::Match(MatchError::DimensionMismatch {
                    probe: 3,
                    stored: 2,
                    owner: "a".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::Engine(EngineError::ChannelClosed),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
