//! Long-running maintenance workers
//!
//! Each worker is a synchronous loop deployed as its own process: fold
//! migrates live nodes into snapshots, dump exports snapshots to NFS as
//! compressed CSV, cleanup ages out exported snapshots, and resync drains NFS
//! fallback records back into the coordination journal. Workers never let an
//! error escape a single iteration; they log, sleep, and try again.

pub mod cleanup;
pub mod dump;
pub mod fold;
pub mod resync;

use thiserror::Error;

use crate::snapshot::SnapshotError;
use crate::zk::ZkError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("coordination error: {0}")]
    Zk(#[from] ZkError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
