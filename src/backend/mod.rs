//! Journal backends and the failover facade
//!
//! Two backends implement one contract: the coordination-service journal
//! (primary in every documented deployment) and the NFS journal. The
//! [`Journal`] facade owns both and applies the failover policy — writes fall
//! through to the secondary when the primary fails, status reads consult the
//! secondary when the primary has no answer. Failover can duplicate records
//! across backends; the resync worker reconciles them later.

pub mod history;
pub mod nfs;
pub mod zookeeper;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::config::{ConfigError, ConnArgs, JournalConfig};
use crate::record::CodecError;
use crate::zk::ZkError;

pub use nfs::NfsJournal;
pub use zookeeper::ZkJournal;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("journal backend unavailable")]
    Unavailable,

    #[error("journal backend not configured")]
    NotConfigured,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("coordination error: {0}")]
    Zk(#[from] ZkError),
}

/// Outcome of a status query against a single backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// A terminal step (commit or abort) exists; carries the full record.
    Complete(Value),
    /// A begin step exists but no terminal step yet.
    InProgress,
    /// The backend has no answer for this transaction.
    Unknown,
}

/// The contract every journal backend implements.
///
/// A write error is failover-eligible; a duplicate write for the same
/// `(txid, step)` is success.
pub trait JournalBackend: Send + Sync {
    fn write(&self, txid: &str, step: &str, msg: &Value) -> Result<(), BackendError>;

    fn status(&self, txid: &str) -> TxStatus;
}

/// Primary/secondary pair with failover.
pub struct Journal {
    primary: Option<Box<dyn JournalBackend>>,
    secondary: Option<Box<dyn JournalBackend>>,
}

impl Journal {
    pub fn new(
        primary: Option<Box<dyn JournalBackend>>,
        secondary: Option<Box<dyn JournalBackend>>,
    ) -> Self {
        Journal { primary, secondary }
    }

    /// Build both backends from resolved configuration. Connection arguments,
    /// cache size and admin user apply to the primary only; the secondary is
    /// constructed bare (it is plain NFS in every documented configuration).
    pub fn initialize(config: &JournalConfig) -> Result<Self, ConfigError> {
        let primary = config
            .primary
            .as_deref()
            .map(|url| {
                create_backend(
                    url,
                    &config.conn_args,
                    config.cachesize,
                    config.adminuser.as_deref(),
                )
            })
            .transpose()?;
        let secondary = config
            .secondary
            .as_deref()
            .map(|url| create_backend(url, &ConnArgs::new(), config.cachesize, None))
            .transpose()?;
        Ok(Journal { primary, secondary })
    }

    /// Write to the primary, falling through to the secondary on failure.
    /// The returned result reflects the last backend attempted.
    pub fn write(&self, txid: &str, step: &str, msg: &Value) -> Result<(), BackendError> {
        let rc = match &self.primary {
            Some(primary) => primary.write(txid, step, msg),
            None => Err(BackendError::NotConfigured),
        };
        match (rc, &self.secondary) {
            (Err(_), Some(secondary)) => secondary.write(txid, step, msg),
            (rc, _) => rc,
        }
    }

    /// Resolve a transaction's status to an HTTP-shaped `(body, code)` pair.
    pub fn status(&self, txid: &str) -> (Value, u16) {
        let mut status = match &self.primary {
            Some(primary) => primary.status(txid),
            None => TxStatus::Unknown,
        };
        if status == TxStatus::Unknown {
            if let Some(secondary) = &self.secondary {
                status = secondary.status(txid);
            }
        }
        match status {
            TxStatus::Complete(record) => (json!({ "status": record }), 200),
            TxStatus::InProgress => (json!({ "status": "Task in progress" }), 102),
            TxStatus::Unknown => {
                error!("task {} not found", txid);
                (json!({ "status": "Task not found" }), 404)
            }
        }
    }
}

fn create_backend(
    url: &str,
    conn_args: &ConnArgs,
    cachesize: usize,
    adminuser: Option<&str>,
) -> Result<Box<dyn JournalBackend>, ConfigError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| ConfigError::UnsupportedJournal(url.to_string()))?;
    if scheme == "nfs" {
        return Ok(Box::new(NfsJournal::new(rest)));
    }
    if scheme.contains("zookeeper") {
        let journal = ZkJournal::connect(url, conn_args, adminuser, cachesize)?;
        return Ok(Box::new(journal));
    }
    Err(ConfigError::UnsupportedJournal(url.to_string()))
}
