//! Shared fixtures for the integration tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use txjournal::backend::ZkJournal;
use txjournal::zk::memory::MemoryZk;
use txjournal::zk::ZkClient;

/// A record carrying every NOT NULL snapshot column, so it can fold.
pub fn sample_record(txid: &str, step: &str) -> Value {
    json!({
        "request_id": txid,
        "transaction_id": txid,
        "step": step,
        "user_id": "user1",
        "authuser_id": "svc1",
        "role": "operator",
        "host": "host1.example.com",
        "resource": "phonebook",
        "resourcegroup": "directory",
        "verb": "update",
        "resourcepk": "42",
        "payload": {"x": 1},
        "cm": "CM1234",
    })
}

pub fn memory_client() -> Arc<MemoryZk> {
    let zk = Arc::new(MemoryZk::new("/journal"));
    zk.start(Duration::from_secs(1)).unwrap();
    zk
}

pub fn zk_journal(zk: Arc<MemoryZk>) -> ZkJournal {
    ZkJournal::new(zk, None, 50)
}
