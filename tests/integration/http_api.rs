//! HTTP surface tests driven through the axum router

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

use txjournal::backend::{Journal, NfsJournal};
use txjournal::server::http_api::create_router;

use crate::common::{memory_client, zk_journal};

fn router_with_zk_primary() -> Router {
    let journal = Journal::new(Some(Box::new(zk_journal(memory_client()))), None);
    create_router(Arc::new(journal))
}

async fn post_json(app: &Router, uri: &str, body: Value) -> StatusCode {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

async fn get_status(app: &Router, txid: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/status/{txid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_happy_write_and_status() {
    let app = router_with_zk_primary();
    assert_eq!(
        post_json(&app, "/T1/begin", json!({"x": 1})).await,
        StatusCode::CREATED
    );
    assert_eq!(
        post_json(&app, "/T1/commit", json!({"x": 2})).await,
        StatusCode::CREATED
    );
    let (status, body) = get_status(&app, "T1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": {"x": 2}}));
}

#[tokio::test]
async fn test_begin_only_is_processing() {
    let app = router_with_zk_primary();
    assert_eq!(
        post_json(&app, "/T2/begin", json!({})).await,
        StatusCode::CREATED
    );
    let (status, body) = get_status(&app, "T2").await;
    assert_eq!(status, StatusCode::PROCESSING);
    assert_eq!(body, json!({"status": "Task in progress"}));
}

#[tokio::test]
async fn test_unknown_txid_is_not_found() {
    let app = router_with_zk_primary();
    let (status, body) = get_status(&app, "T-missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"status": "Task not found"}));
}

#[tokio::test]
async fn test_write_without_json_content_type_is_rejected() {
    let app = router_with_zk_primary();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/T3/begin")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_json_body_is_rejected() {
    let app = router_with_zk_primary();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/T3/begin")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsaved_entry_returns_500_with_message() {
    // No backends configured: every write fails.
    let app = create_router(Arc::new(Journal::new(None, None)));
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/T4/begin")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        body,
        json!({"message": "Unsaved Journal entry -- T4##begin"})
    );
}

#[tokio::test]
async fn test_status_served_from_nfs_secondary() {
    let dir = tempfile::TempDir::new().unwrap();
    let nfs = NfsJournal::new(dir.path());
    let journal = Journal::new(None, Some(Box::new(nfs)));
    let app = create_router(Arc::new(journal));
    assert_eq!(
        post_json(&app, "/T5/begin", json!({"x": 1})).await,
        StatusCode::CREATED
    );
    let (status, body) = get_status(&app, "T5").await;
    assert_eq!(status, StatusCode::PROCESSING);
    assert_eq!(body, json!({"status": "Task in progress"}));
}
