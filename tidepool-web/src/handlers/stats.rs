//! Usage statistics handler

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use tidepool_core::StatsReport;

use crate::server::AppState;

/// Stats report plus the limits uploads are held to.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Per-volume usage and totals
    #[serde(flatten)]
    pub report: StatsReport,
    /// Upload size limit in bytes
    pub max_file_size: u64,
    /// Retention applied when an upload requests none, in seconds
    pub default_expiry: u64,
    /// Seconds since the server started
    pub uptime_seconds: u64,
}

/// Reports usage across all volumes.
pub async fn api_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let report = state.service.stats().await;

    Json(StatsResponse {
        report,
        max_file_size: state.service.max_upload_bytes(),
        default_expiry: state.service.retention().as_secs(),
        uptime_seconds: state.server_started_at.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::http::header::CONTENT_TYPE;
    use tower::ServiceExt;

    use crate::handlers::test_support::{BOUNDARY, create_test_app, multipart_body, read_json};

    #[tokio::test]
    async fn test_stats_reflect_uploads() {
        let (_temp_dir, _clock, app) = create_test_app().await;

        let upload = Request::builder()
            .method("POST")
            .uri("/api/files")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body("file", "a.txt", "text/plain", b"12345")))
            .unwrap();
        let response = app.clone().oneshot(upload).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats = read_json(response).await;
        assert_eq!(stats["total_files"], 1);
        assert_eq!(stats["total_bytes"], 5);
        assert_eq!(stats["volumes"].as_array().unwrap().len(), 2);
        assert_eq!(stats["max_file_size"], 1024 * 1024);
        assert_eq!(stats["default_expiry"], 60);
    }
}
