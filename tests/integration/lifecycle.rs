//! Snapshot lifecycle: fold → query from history → dump to CSV → cleanup

use std::fs::{self, File};
use std::io::Read as _;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use flate2::read::GzDecoder;
use regex::Regex;
use serde_json::{json, Value};
use tower::ServiceExt;

use txjournal::backend::{Journal, JournalBackend};
use txjournal::server::http_api::create_router;
use txjournal::workers::{cleanup, dump, fold};
use txjournal::zk::ZkClient;

use crate::common::{memory_client, sample_record, zk_journal};

fn nfsregex() -> Regex {
    Regex::new(r".*out#(-?\d+)\.csv.*").unwrap()
}

#[tokio::test]
async fn test_fold_cycle_feeds_status_from_snapshot() {
    let zk = memory_client();
    let journal = zk_journal(zk.clone());
    fold::ensure_history(&journal).unwrap();
    journal
        .write("T3", "begin", &sample_record("T3", "begin"))
        .unwrap();
    journal
        .write("T3", "commit", &sample_record("T3", "commit"))
        .unwrap();
    journal
        .write("T4", "begin", &sample_record("T4", "begin"))
        .unwrap();

    fold::fold_once(&journal, 10).unwrap();

    assert_eq!(
        zk.get_children("/history").unwrap(),
        vec!["sqlite-db#0000000000"]
    );
    // The live steps are gone along with their parents.
    assert_eq!(zk.get_children("/").unwrap(), vec!["history"]);

    // Status is now answered from the snapshot, through the full HTTP path.
    let facade = Journal::new(Some(Box::new(zk_journal(zk.clone()))), None);
    let app = create_router(Arc::new(facade));
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/status/T3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"]["step"], json!("commit"));
    assert_eq!(body["status"]["request_id"], json!("T3"));
    assert_eq!(body["status"]["payload"], json!({"x": 1}));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/status/T4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PROCESSING);
}

#[test]
fn test_dump_then_cleanup_drains_history() {
    let zk = memory_client();
    let journal = zk_journal(zk.clone());
    fold::ensure_history(&journal).unwrap();
    // Five folds, one transaction each: snapshots sqlite-db#0 .. #4.
    for i in 0..5 {
        let txid = format!("tx-d{i}");
        journal
            .write(&txid, "commit", &sample_record(&txid, "commit"))
            .unwrap();
        fold::fold_once(&journal, 10).unwrap();
    }
    assert_eq!(zk.get_children("/history").unwrap().len(), 5);

    let dir = tempfile::TempDir::new().unwrap();
    dump::dump_once(&journal, dir.path(), "out", &nfsregex()).unwrap();

    for seq in 0..5 {
        let gz = dir.path().join(format!("out#{seq:010}.csv.gz"));
        assert!(gz.exists(), "missing {}", gz.display());
        // The uncompressed intermediate is removed.
        assert!(!dir.path().join(format!("out#{seq:010}.csv")).exists());
    }

    // Spot-check the exported CSV: renamed columns, no resourcegroup.
    let mut decoder =
        GzDecoder::new(File::open(dir.path().join("out#0000000000.csv.gz")).unwrap());
    let mut contents = String::new();
    decoder.read_to_string(&mut contents).unwrap();
    let mut lines = contents.lines();
    assert_eq!(
        lines.next().unwrap().trim_end(),
        "transaction_id,request_id,step,host,resource,verb,pk,date,user_id,authuser_id,role,cm,payload"
    );
    assert_eq!(
        lines.next().unwrap().trim_end(),
        "tx-d0,tx-d0,commit,host1.example.com,phonebook,update,42,,user1,svc1,operator,CM1234,\"{\"\"x\"\":1}\""
    );

    // Everything is exported, so an age of zero clears the history area.
    cleanup::cleanup_once(&journal, dir.path(), 0, "out", &nfsregex()).unwrap();
    assert_eq!(
        zk.get_children("/history").unwrap(),
        Vec::<String>::new()
    );
}

#[test]
fn test_dump_is_incremental() {
    let zk = memory_client();
    let journal = zk_journal(zk.clone());
    fold::ensure_history(&journal).unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    journal
        .write("tx-i0", "commit", &sample_record("tx-i0", "commit"))
        .unwrap();
    fold::fold_once(&journal, 10).unwrap();
    dump::dump_once(&journal, dir.path(), "out", &nfsregex()).unwrap();
    let first = dir.path().join("out#0000000000.csv.gz");
    let first_mtime = fs::metadata(&first).unwrap().modified().unwrap();

    journal
        .write("tx-i1", "commit", &sample_record("tx-i1", "commit"))
        .unwrap();
    fold::fold_once(&journal, 10).unwrap();
    dump::dump_once(&journal, dir.path(), "out", &nfsregex()).unwrap();

    // The second cycle only exports the new snapshot.
    assert!(dir.path().join("out#0000000001.csv.gz").exists());
    assert_eq!(fs::metadata(&first).unwrap().modified().unwrap(), first_mtime);
}
