//! Mapping of service failures onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tidepool_core::StorageError;

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Failure reported by the file service
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Request is malformed
    #[error("Bad request: {reason}")]
    BadRequest {
        /// What was wrong with the request
        reason: String,
    },
}

impl ApiError {
    /// Creates a bad request error.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ApiError::BadRequest {
            reason: reason.into(),
        }
    }

    /// HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Storage(e) => match e {
                StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
                StorageError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                StorageError::InsufficientStorage { .. } => StatusCode::INSUFFICIENT_STORAGE,
                StorageError::Conflict { .. } => StatusCode::CONFLICT,
                StorageError::WriteFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                StorageError::ReadFailed { .. } | StorageError::VolumeUnavailable { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Storage(StorageError::NotFound { .. }) => "File not found".to_string(),
            ApiError::Storage(StorageError::PayloadTooLarge { limit }) => {
                format!("File too large. Max size is {limit} bytes")
            }
            ApiError::Storage(StorageError::InsufficientStorage { .. }) => {
                "Insufficient storage".to_string()
            }
            ApiError::Storage(StorageError::Conflict { .. }) => "File already exists".to_string(),
            ApiError::Storage(StorageError::WriteFailed { .. }) => {
                "Storage write failed, retry later".to_string()
            }
            ApiError::Storage(_) => "Storage error".to_string(),
            ApiError::BadRequest { reason } => reason.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tidepool_core::FileId;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(StorageError::NotFound {
                    id: FileId::generate(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(StorageError::PayloadTooLarge { limit: 1 }),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                ApiError::from(StorageError::InsufficientStorage {
                    needed: 2,
                    available: 1,
                }),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                ApiError::from(StorageError::WriteFailed {
                    path: PathBuf::from("/srv/a"),
                    reason: "disk full".to_string(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::from(StorageError::ReadFailed {
                    path: PathBuf::from("/srv/a"),
                    reason: "io".to_string(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::bad_request("nope"), StatusCode::BAD_REQUEST),
        ];

        for (error, status) in cases {
            assert_eq!(error.status(), status, "{error}");
        }
    }
}
