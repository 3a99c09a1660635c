//! End-to-end flow through the HTTP router

use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use tidepool_web::{AppState, build_router};
use tower::ServiceExt;

use crate::common::{TestStore, random_bytes};

const BOUNDARY: &str = "integration-boundary";

fn upload_request(filename: &str, data: &[u8]) -> Request<Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/files?expires_in=10")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_upload_expire_sweep_over_http() {
    let store = TestStore::open(&[None, None]).await;
    let app = build_router(AppState::new(store.service.clone()));
    let data = random_bytes(30_000);

    let response = app
        .clone()
        .oneshot(upload_request("payload.bin", &data))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let receipt: serde_json::Value = serde_json::from_slice(
        &axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap(),
    )
    .unwrap();
    let id = receipt["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/files/{id}/download"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let downloaded = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(downloaded.as_ref(), data.as_slice());

    let (_, stats) = get_json(&app, "/api/stats").await;
    assert_eq!(stats["total_files"], 1);
    assert_eq!(stats["total_bytes"], 30_000);

    store.clock.advance(Duration::from_secs(10));
    let (status, _) = get_json(&app, &format!("/api/files/{id}/info")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let report = store.service.sweeper(Duration::ZERO).sweep_expired().await;
    assert_eq!(report.removed, 1);

    let (_, stats) = get_json(&app, "/api/stats").await;
    assert_eq!(stats["total_files"], 0);
    let used: u64 = stats["volumes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|volume| volume["used_bytes"].as_u64().unwrap())
        .sum();
    assert_eq!(used, 0);
}

#[tokio::test]
async fn test_full_volumes_report_insufficient_storage() {
    let store = TestStore::open(&[Some(1000)]).await;
    let app = build_router(AppState::new(store.service.clone()));

    let request = Request::builder()
        .method("POST")
        .uri("/api/files?size=5000")
        .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a\"\r\n\r\nx\r\n--{BOUNDARY}--\r\n"
            ),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
}

#[tokio::test]
async fn test_unhinted_upload_over_quota_is_insufficient_storage() {
    let store = TestStore::open(&[Some(1000)]).await;
    let app = build_router(AppState::new(store.service.clone()));

    let response = app
        .oneshot(upload_request("big.bin", &random_bytes(1001)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
}
