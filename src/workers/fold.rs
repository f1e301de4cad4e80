//! Fold worker
//!
//! Periodically migrates live journal nodes into immutable snapshot entries.
//! Each cycle lists the live transactions, takes the per-transaction lock so
//! concurrent writers on the same transaction are serialized, batches up to
//! `batchsize` step nodes, folds them into a compressed SQL script, and
//! commits the snapshot upload together with the deletion of every folded
//! node in one atomic multi-op transaction. A writer racing in between lock
//! release and parent deletion just leaves the parent `NotEmpty`; the new
//! step waits for the next cycle.

use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::backend::ZkJournal;
use crate::record;
use crate::snapshot::{self, JournalRow};
use crate::zk::{ZkClient, ZkError, ZkOp, ZkOpResult};

/// Run the fold loop forever, sleeping `interval` between cycles.
pub fn run(journal: &ZkJournal, batchsize: usize, interval: u64) {
    if let Err(e) = ensure_history(journal) {
        error!("error creating history node: {}", e);
    }
    loop {
        if let Err(e) = fold_once(journal, batchsize) {
            error!("error in uploading - {}", e);
        }
        thread::sleep(Duration::from_secs(interval));
    }
}

pub fn ensure_history(journal: &ZkJournal) -> Result<(), ZkError> {
    let zk = journal.client();
    if !zk.exists("/history")? {
        zk.create("/history", Vec::new(), journal.acl(), true, false)?;
    }
    Ok(())
}

/// One fold cycle: lock, batch, snapshot, unlock.
pub fn fold_once(journal: &ZkJournal, batchsize: usize) -> Result<(), ZkError> {
    let zk = journal.client();
    let children = zk.get_children("/")?;
    let journals: Vec<String> = children
        .into_iter()
        .filter(|name| name != "history" && !name.contains("_lock"))
        .collect();

    let mut to_write: Vec<String> = Vec::new();
    let mut acquired: Vec<String> = Vec::new();
    let mut locked_nodes: Vec<String> = Vec::new();

    let result = (|| -> Result<(), ZkError> {
        for txid in &journals {
            let steps = step_children(journal, txid);
            let lock_path = format!("/{txid}_lock");
            let locked = zk.try_lock(&lock_path)?;
            if locked {
                acquired.push(lock_path);
            }
            if locked && !steps.is_empty() {
                to_write.extend(steps.iter().map(|step| format!("/{txid}/{step}")));
                locked_nodes.push(txid.clone());
            }
            if to_write.len() >= batchsize {
                break;
            }
        }
        if !to_write.is_empty() {
            create_snapshot(journal, &to_write, &locked_nodes)?;
        }
        Ok(())
    })();

    for lock_path in &acquired {
        zk.unlock(lock_path);
    }
    delete_lock_nodes(journal, &locked_nodes);
    result
}

fn step_children(journal: &ZkJournal, txid: &str) -> Vec<String> {
    match journal.client().get_children(&format!("/{txid}")) {
        Ok(steps) => steps,
        Err(ZkError::NoAuth(e)) => {
            error!("auth error for zk node {}", e);
            Vec::new()
        }
        Err(_) => Vec::new(),
    }
}

fn delete_lock_nodes(journal: &ZkJournal, locked_nodes: &[String]) {
    for txid in locked_nodes {
        if let Err(e) = journal.client().delete(&format!("/{txid}_lock")) {
            error!("{}", e);
        }
    }
}

/// Read every batched node, fold the decoded records into a snapshot script,
/// and commit upload + deletes atomically.
fn create_snapshot(
    journal: &ZkJournal,
    to_write: &[String],
    locked_nodes: &[String],
) -> Result<(), ZkError> {
    let zk = journal.client();
    let mut rows: Vec<JournalRow> = Vec::new();
    let mut written: Vec<String> = Vec::new();
    for path in to_write {
        let (data, _) = match zk.get(path) {
            Ok(found) => found,
            Err(ZkError::NoAuth(e)) => {
                error!("auth error for zk node {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let msg = match record::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                error!("undecodable record at {}: {}", path, e);
                continue;
            }
        };
        match JournalRow::from_record(&msg) {
            Ok(row) => {
                rows.push(row);
                written.push(path.clone());
            }
            Err(e) => {
                error!("unfoldable record at {}: {}", path, e);
                continue;
            }
        }
    }
    if written.is_empty() {
        return Ok(());
    }

    // An insert failure (duplicate key, NOT NULL violation) abandons the
    // snapshot; the live nodes stay put and are retried next cycle.
    let script = match snapshot::build_script(&rows) {
        Ok(script) => script,
        Err(e) => {
            error!("error in inserting data to sqlite: {}", e);
            return Ok(());
        }
    };
    let blob = snapshot::compress_script(&script).map_err(|e| ZkError::Other(e.to_string()))?;

    let mut ops = vec![ZkOp::Create {
        path: "/history/sqlite-db#".to_string(),
        value: blob,
        acl: journal.acl().to_vec(),
        sequence: true,
    }];
    ops.extend(written.iter().map(|path| ZkOp::Delete { path: path.clone() }));
    let results = zk.multi(ops)?;
    if results.iter().any(Result::is_err) {
        error!("transaction commit error - {:?}", results);
    } else if let Some(Ok(ZkOpResult::Created(db_node))) = results.first() {
        info!("uploaded compressed snapshot DB to {}", db_node);
    }

    delete_empty_nodes(journal, locked_nodes);
    Ok(())
}

/// Remove the now-childless transaction parents. A writer may have raced a
/// new step in; `NotEmpty` just leaves the parent for the next cycle.
fn delete_empty_nodes(journal: &ZkJournal, locked_nodes: &[String]) {
    for txid in locked_nodes {
        match journal.client().delete(&format!("/{txid}")) {
            Ok(()) | Err(ZkError::NotEmpty(_)) => {}
            Err(e) => error!("error in zk delete {}", e),
        }
    }
}
