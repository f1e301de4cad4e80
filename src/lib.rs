//! # txjournal - Transactional Audit Journal
//!
//! Records the lifecycle of multi-step business transactions
//! (`begin` → `commit`/`abort`) across two pluggable backends: a
//! coordination service holding live, ACL-protected nodes, and a shared
//! NFS directory used for failover and export. Long-running workers fold
//! live nodes into compressed SQLite snapshot entries, export them to NFS
//! as gzip CSV, age them out once exported, and resync NFS fallback
//! records back into the coordination journal.

pub mod backend;
pub mod config;
pub mod logging;
pub mod record;
pub mod sequence;
pub mod server;
pub mod snapshot;
pub mod workers;
pub mod zk;
