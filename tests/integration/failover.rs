//! Failover and resync: writes fall through to NFS while the coordination
//! service is down, and resync drains them back once it returns.

use std::fs;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use serde_json::{json, Value};
use tower::ServiceExt;

use txjournal::backend::{Journal, NfsJournal, ZkJournal};
use txjournal::record;
use txjournal::server::http_api::create_router;
use txjournal::workers::resync;
use txjournal::zk::memory::MemoryZk;
use txjournal::zk::ZkClient;

use crate::common::sample_record;

#[tokio::test]
async fn test_write_fails_over_to_nfs_and_resyncs() {
    let zk = Arc::new(MemoryZk::new("/journal"));
    zk.set_available(false);
    let dir = tempfile::TempDir::new().unwrap();

    let primary = ZkJournal::new(zk.clone(), None, 50);
    let secondary = NfsJournal::new(dir.path());
    let journal = Journal::new(Some(Box::new(primary)), Some(Box::new(secondary)));
    let app = create_router(Arc::new(journal));

    // Primary down: the facade falls through to the NFS secondary.
    let msg = sample_record("T5", "begin");
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/T5/begin")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(msg.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let on_disk: Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("T5_begin")).unwrap()).unwrap();
    assert_eq!(on_disk, msg);

    // Service back: resync uploads the record and removes the NFS file.
    zk.set_available(true);
    let resync_journal = ZkJournal::new(zk.clone(), None, 50);
    resync::resync_once(&resync_journal, dir.path()).unwrap();

    assert!(!dir.path().join("T5_begin").exists());
    let (data, _) = zk.get("/T5/begin").unwrap();
    assert_eq!(record::decode(&data).unwrap(), msg);
}

#[test]
fn test_duplicate_records_reconcile_cleanly() {
    // Failover can leave the same record in both backends; a later resync
    // replays it against the coordination journal, where the duplicate create
    // counts as success and the NFS copy is dropped.
    let zk = Arc::new(MemoryZk::new("/journal"));
    zk.start(std::time::Duration::from_secs(1)).unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    let journal = ZkJournal::new(zk.clone(), None, 50);
    let msg = sample_record("T6", "commit");
    use txjournal::backend::JournalBackend;
    journal.write("T6", "commit", &msg).unwrap();
    fs::write(
        dir.path().join("T6_commit"),
        serde_json::to_vec(&msg).unwrap(),
    )
    .unwrap();

    resync::resync_once(&journal, dir.path()).unwrap();
    assert!(!dir.path().join("T6_commit").exists());
    assert_eq!(zk.get_children("/T6").unwrap(), vec!["commit"]);
}
