//! Cleanup worker
//!
//! Ages snapshot nodes out of `/history`. A snapshot is deleted only when it
//! is older than `age` seconds *and* its sequence is at or below the NFS
//! high-water mark, so nothing disappears before the dump worker has exported
//! it. Node-gone races with a concurrent cleanup are ignored.

use std::cmp::Ordering;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tracing::{error, info};

use crate::backend::ZkJournal;
use crate::sequence::{sequence_cmp, snapshot_seq};
use crate::zk::{ZkClient, ZkError};

use super::dump::last_dumped_id;
use super::WorkerError;

/// Run the cleanup loop forever, sleeping `interval` between cycles.
pub fn run(
    journal: &ZkJournal,
    nfspath: &Path,
    interval: u64,
    age: u64,
    outfile: &str,
    nfsregex: &Regex,
) {
    loop {
        if let Err(e) = cleanup_once(journal, nfspath, age, outfile, nfsregex) {
            error!("error in zk delete {}", e);
        }
        thread::sleep(Duration::from_secs(interval));
    }
}

/// One cleanup pass over `/history`.
pub fn cleanup_once(
    journal: &ZkJournal,
    nfspath: &Path,
    age: u64,
    outfile: &str,
    nfsregex: &Regex,
) -> Result<(), WorkerError> {
    let zk = journal.client();
    if !zk.exists("/history")? {
        return Ok(());
    }
    let lastid = last_dumped_id(nfspath, outfile, nfsregex)?;
    for entry in zk.get_children("/history")? {
        let path = format!("/history/{entry}");
        let (_, stat) = match zk.get(&path) {
            Ok(found) => found,
            Err(ZkError::NoNode(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        if now_secs() - stat.ctime_ms as f64 / 1000.0 <= age as f64 {
            continue;
        }
        let jseqid = snapshot_seq(&entry);
        if sequence_cmp(jseqid, lastid.as_deref()) != Ordering::Greater {
            match zk.delete(&path) {
                Ok(()) | Err(ZkError::NoNode(_)) => {}
                Err(e) => error!("error in zk delete {}", e),
            }
        } else {
            info!("node {} not dumped", entry);
        }
    }
    Ok(())
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
