//! HTTP API for the journal server
//!
//! Two routes, consumed by an external dispatcher:
//!
//! - `POST /<txid>/<step>` with a JSON body writes one journal record.
//!   Returns `201 Created`, or `500` with a JSON `message` when neither
//!   backend saved the entry. Requests without a JSON content type are
//!   rejected with `400` before the body is touched.
//! - `GET /status/<txid>` resolves a transaction's status: `200` with the
//!   terminal record, `102` while only a begin step exists, `404` otherwise.
//!   The response body is always JSON.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use crate::backend::Journal;

// Error body shape shared by the write route's failure responses.
#[derive(Serialize)]
pub struct ApiError {
    pub message: String,
}

/// Create and configure the API router
pub fn create_router(journal: Arc<Journal>) -> Router {
    Router::new()
        .route("/status/{txid}", get(journal_status))
        .route("/{txid}/{step}", post(journal_write))
        .with_state(journal)
}

/// Handler for journal writes
pub async fn journal_write(
    State(journal): State<Arc<Journal>>,
    Path((txid, step)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_json(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    match journal.write(&txid, &step, &payload) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(_) => {
            error!("unsaved journal entry {}:{}", txid, step);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    message: format!("Unsaved Journal entry -- {txid}##{step}"),
                }),
            )
                .into_response()
        }
    }
}

/// Handler for journal status queries
pub async fn journal_status(
    State(journal): State<Arc<Journal>>,
    Path(txid): Path<String>,
) -> Response {
    let (body, code) = journal.status(&txid);
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let mime = value.split(';').next().unwrap_or("").trim();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}
