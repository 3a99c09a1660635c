//! HTTP request handlers organized by functionality

pub mod files;
pub mod stats;

// Re-export handler functions
pub use files::{
    FileInfo, UploadQuery, UploadReceipt, api_delete_file, api_download_file, api_file_info,
    api_upload_file,
};
pub use stats::{StatsResponse, api_stats};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::Response;
    use tidepool_core::{FileService, ManualClock, TidepoolConfig};

    use crate::server::{AppState, build_router};

    pub const BOUNDARY: &str = "tidepool-test-boundary";

    pub async fn create_test_app() -> (tempfile::TempDir, ManualClock, Router) {
        let temp_dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::starting_now();
        let config = TidepoolConfig::for_testing(temp_dir.path());
        let service = FileService::open(&config.storage, Arc::new(clock.clone()))
            .await
            .unwrap();
        let router = build_router(AppState::new(Arc::new(service)));
        (temp_dir, clock, router)
    }

    /// Builds a multipart body with a single part.
    pub fn multipart_body(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    pub async fn read_body(response: Response<Body>) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    pub async fn read_json(response: Response<Body>) -> serde_json::Value {
        serde_json::from_slice(&read_body(response).await).unwrap()
    }
}
