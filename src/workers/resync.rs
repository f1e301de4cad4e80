//! Resync worker
//!
//! Drains records that failover wrote to the NFS directory back into the
//! coordination journal. Runs under an exclusive advisory lock on the
//! directory's `.lock` sentinel so only one resync touches it at a time; a
//! source file is removed only after the coordination write succeeded (a
//! duplicate-create counts as success, so replays are harmless). Unparseable
//! files are left in place for inspection.

use std::fs::{self, File};
use std::path::Path;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::backend::{JournalBackend, ZkJournal};
use crate::zk::ZkClient;

use super::dump::lock_contended;
use super::WorkerError;

const RESYNC_INTERVAL_SECS: u64 = 60;

/// Run the resync loop forever, reconnecting when the session drops.
pub fn run(journal: &ZkJournal, nfspath: &Path) {
    info!("resync worker running against {}", nfspath.display());
    loop {
        if journal.client().connected() {
            if let Err(e) = resync_once(journal, nfspath) {
                error!("error - {}", e);
            }
        } else {
            journal.ensure_started();
        }
        thread::sleep(Duration::from_secs(RESYNC_INTERVAL_SECS));
    }
}

/// One resync pass under the directory lock.
pub fn resync_once(journal: &ZkJournal, nfspath: &Path) -> Result<(), WorkerError> {
    let lockfile = File::create(nfspath.join(".lock"))?;
    match lockfile.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if lock_contended(&e) => return Ok(()),
        Err(e) => {
            error!(
                "exception while trying to lockfile {}: {}",
                nfspath.join(".lock").display(),
                e
            );
            return Ok(());
        }
    }
    let result = drain_directory(journal, nfspath);
    let _ = FileExt::unlock(&lockfile);
    result
}

fn drain_directory(journal: &ZkJournal, nfspath: &Path) -> Result<(), WorkerError> {
    for entry in fs::read_dir(nfspath)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some((txid, step)) = name.split_once('_') else {
            warn!("unrecognized journal entry file {}", path.display());
            continue;
        };
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                error!("error with data in journal entry file {}: {}", path.display(), e);
                continue;
            }
        };
        let msg: Value = match serde_json::from_str(&contents) {
            Ok(msg) => msg,
            Err(e) => {
                error!("error with data in journal entry file {}: {}", path.display(), e);
                continue;
            }
        };
        if journal.write(txid, step, &msg).is_ok() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
