//! NFS journal backend
//!
//! Records land as one JSON file per `(txid, step)` named `<txid>_<step>` in
//! a shared directory. Writes go through a uniquely-named temp file in the
//! same directory followed by a rename, which is atomic on a single
//! filesystem, so readers never observe a partial record. Status is answered
//! by probing the terminal-step files directly.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, error};

use super::{BackendError, JournalBackend, TxStatus};

pub struct NfsJournal {
    nfspath: PathBuf,
}

impl NfsJournal {
    pub fn new(nfspath: impl Into<PathBuf>) -> Self {
        NfsJournal {
            nfspath: nfspath.into(),
        }
    }

    fn step_file(&self, txid: &str, step: &str) -> PathBuf {
        self.nfspath.join(format!("{txid}_{step}"))
    }

    fn try_write(&self, txid: &str, step: &str, msg: &Value) -> Result<(), BackendError> {
        let mut tmp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(&self.nfspath)?;
        tmp.write_all(&serde_json::to_vec(msg)?)?;
        tmp.persist(self.step_file(txid, step))
            .map_err(|e| BackendError::Io(e.error))?;
        Ok(())
    }

    fn probe_terminal(&self, txid: &str, step: &str) -> Option<Value> {
        let path = self.step_file(txid, step);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no {} status for task {}", step, txid);
                return None;
            }
            Err(e) => {
                error!("error reading nfs journal {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("invalid record in nfs journal {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl JournalBackend for NfsJournal {
    fn write(&self, txid: &str, step: &str, msg: &Value) -> Result<(), BackendError> {
        self.try_write(txid, step, msg).map_err(|e| {
            error!("error writing to nfs journal: {}", e);
            e
        })
    }

    fn status(&self, txid: &str) -> TxStatus {
        if let Some(record) = self.probe_terminal(txid, "commit") {
            return TxStatus::Complete(record);
        }
        if let Some(record) = self.probe_terminal(txid, "abort") {
            return TxStatus::Complete(record);
        }
        if self.step_file(txid, "begin").exists() {
            return TxStatus::InProgress;
        }
        TxStatus::Unknown
    }
}
