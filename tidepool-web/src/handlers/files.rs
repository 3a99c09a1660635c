//! File upload, download, info and delete handlers

use std::io;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tidepool_core::{FileEntry, FileId, UploadRequest};

use crate::error::ApiError;
use crate::server::AppState;

/// Query parameters accepted by the upload endpoint.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// Retention in seconds, overriding the server default
    pub expires_in: Option<u64>,
    /// Declared upload size in bytes
    pub size: Option<u64>,
}

/// Response body of a successful upload.
#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    /// Identifier of the stored file
    pub id: String,
    /// Resource URL
    pub url: String,
    /// Download URL
    pub download_url: String,
    /// Metadata URL
    pub info_url: String,
    /// When the file stops being served
    pub expires_at: DateTime<Utc>,
    /// Stored size in bytes
    pub size: u64,
    /// Upload size limit in bytes
    pub max_size: u64,
    /// Volume holding the file
    pub volume: String,
}

/// Response body of the info endpoint.
#[derive(Debug, Serialize)]
pub struct FileInfo {
    /// Identifier of the stored file
    pub id: String,
    /// Name the file was uploaded with
    pub original_name: String,
    /// Stored size in bytes
    pub size: u64,
    /// MIME type served on download
    pub content_type: String,
    /// Volume holding the file
    pub volume: String,
    /// Upload time
    pub uploaded_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Whole seconds until expiry
    pub remaining_seconds: u64,
}

impl FileInfo {
    fn new(entry: FileEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: entry.id.to_string(),
            remaining_seconds: entry.remaining(now).as_secs(),
            original_name: entry.original_name,
            size: entry.size_bytes,
            content_type: entry.content_type,
            volume: entry.volume.to_string(),
            uploaded_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }
}

/// Streams the multipart field `file` into the store.
///
/// # Errors
///
/// - `ApiError::BadRequest` - If the body is not multipart, lacks a `file`
///   field, or `expires_in` is zero
/// - `ApiError::Storage` - If the service rejects or fails the upload
pub async fn api_upload_file(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadReceipt>), ApiError> {
    if query.expires_in == Some(0) {
        return Err(ApiError::bad_request("expires_in must be positive"));
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let mut request = UploadRequest::new(
            field
                .file_name()
                .filter(|name| !name.is_empty())
                .unwrap_or("upload"),
        );
        if let Some(content_type) = field.content_type() {
            request = request.with_content_type(content_type);
        }
        if let Some(size) = query.size {
            request = request.with_size_hint(size);
        }
        if let Some(seconds) = query.expires_in {
            request = request.with_retention(Duration::from_secs(seconds));
        }

        let body = field.map_err(io::Error::other);
        let entry = state.service.upload(body, request).await?;

        let id = entry.id.to_string();
        let receipt = UploadReceipt {
            url: format!("/api/files/{id}"),
            download_url: format!("/api/files/{id}/download"),
            info_url: format!("/api/files/{id}/info"),
            id,
            expires_at: entry.expires_at,
            size: entry.size_bytes,
            max_size: state.service.max_upload_bytes(),
            volume: entry.volume.to_string(),
        };
        return Ok((StatusCode::CREATED, Json(receipt)));
    }

    Err(ApiError::bad_request("Missing multipart field 'file'"))
}

/// Streams a live file back with its stored content type and name.
///
/// # Errors
///
/// - `ApiError::BadRequest` - If the id is malformed
/// - `ApiError::Storage` - `NotFound` for unknown or expired ids, `ReadFailed`
///   if the bytes cannot be opened
pub async fn api_download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_file_id(&id)?;
    let (entry, stream) = state.service.download(id).await?.into_parts();

    let headers = [
        (CONTENT_TYPE, entry.content_type.clone()),
        (CONTENT_LENGTH, entry.size_bytes.to_string()),
        (
            CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                sanitize_filename(&entry.original_name)
            ),
        ),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Returns the metadata of a live file.
///
/// # Errors
///
/// - `ApiError::BadRequest` - If the id is malformed
/// - `ApiError::Storage` - `NotFound` for unknown or expired ids
pub async fn api_file_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileInfo>, ApiError> {
    let id = parse_file_id(&id)?;
    let entry = state.service.stat(id).await?;
    Ok(Json(FileInfo::new(entry, state.service.now())))
}

/// Removes a live file before its expiry.
///
/// # Errors
///
/// - `ApiError::BadRequest` - If the id is malformed
/// - `ApiError::Storage` - `NotFound` for unknown or expired ids, `WriteFailed`
///   if removal fails
pub async fn api_delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_file_id(&id)?;
    state.service.delete(id).await?;
    Ok(Json(json!({ "status": "deleted", "id": id.to_string() })))
}

fn parse_file_id(raw: &str) -> Result<FileId, ApiError> {
    raw.parse::<FileId>()
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

// Quotes and control characters would break the header's quoted string.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect()
}
