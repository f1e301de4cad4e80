//! Coordination-service journal backend
//!
//! Live records are nodes at `/<txid>/<step>` holding zlib-compressed JSON,
//! created with the standard ACL triple (self, anonymous read, optional admin
//! user). Status walks the live tree first and falls back to the `/history`
//! snapshot area, served through a bounded per-process cache of snapshot
//! blobs. The backend reconnects lazily: a lost session is restarted with a
//! short timeout on the next call, a suspended one is dropped, and either way
//! the caller retries on its next cycle.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::config::ConnArgs;
use crate::record;
use crate::sequence::entry_cmp;
use crate::snapshot::{self, SnapshotError};
use crate::zk::{self, Acl, Perms, ZkClient, ZkError, ZkState, ZkUrl};

use super::history::HistoryCache;
use super::{BackendError, JournalBackend, TxStatus};

pub struct ZkJournal {
    zk: Arc<dyn ZkClient>,
    acl: Vec<Acl>,
    cachesize: usize,
    cache: Mutex<HistoryCache>,
}

impl ZkJournal {
    /// Parse a `zookeeper*://` URL, connect its scheme, and wrap the client.
    pub fn connect(
        url: &str,
        conn_args: &ConnArgs,
        adminuser: Option<&str>,
        cachesize: usize,
    ) -> Result<Self, ZkError> {
        let parsed = ZkUrl::parse(url)?;
        let zk = zk::connect(&parsed, conn_args)?;
        Ok(Self::new(zk, adminuser, cachesize))
    }

    pub fn new(zk: Arc<dyn ZkClient>, adminuser: Option<&str>, cachesize: usize) -> Self {
        // The self identity keeps delete/admin only when no admin user is
        // configured; otherwise the admin user is the caretaker.
        let selfperm = if adminuser.is_some() {
            Perms::from_spec("rwc")
        } else {
            Perms::from_spec("rwcda")
        };
        let mut acl = vec![zk.self_acl(selfperm), Acl::anonymous(Perms::from_spec("r"))];
        if let Some(user) = adminuser {
            acl.push(zk.user_acl(user, Perms::from_spec("rwcda")));
        }
        zk.add_state_listener(Box::new(|state| {
            info!("zookeeper session {}", state);
        }));
        ZkJournal {
            zk,
            acl,
            cachesize,
            cache: Mutex::new(HistoryCache::new()),
        }
    }

    pub fn client(&self) -> &Arc<dyn ZkClient> {
        &self.zk
    }

    pub fn acl(&self) -> &[Acl] {
        &self.acl
    }

    /// Bring the session up if it is down. Start failures are logged and
    /// swallowed; the caller simply retries on its next iteration. A missing
    /// chroot after a successful start is unrecoverable and terminates the
    /// process.
    pub fn ensure_started(&self) {
        let result = (|| -> Result<(), ZkError> {
            if self.zk.state() == ZkState::Lost {
                self.zk.start(Duration::from_secs(1))?;
            }
            if self.zk.state() == ZkState::Suspended {
                self.zk.stop();
            }
            Ok(())
        })();
        if let Err(e) = result {
            error!("error starting zookeeper journal: {}", e);
            return;
        }
        info!("zookeeper started");
        if !self.zk.connected() {
            return;
        }
        match self.zk.exists("/") {
            Ok(true) => {}
            Ok(false) => {
                error!("chroot {} does not exist", self.zk.chroot());
                std::process::exit(1);
            }
            Err(e) => error!("error checking chroot: {}", e),
        }
    }

    fn cache_guard(&self) -> MutexGuard<'_, HistoryCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status_inner(&self, txid: &str) -> Result<TxStatus, ZkError> {
        for step in ["commit", "abort"] {
            let path = format!("/{txid}/{step}");
            if self.zk.exists(&path)? {
                let (data, _) = self.zk.get(&path)?;
                let record = record::decode(&data)
                    .map_err(|e| ZkError::Other(format!("undecodable record at {path}: {e}")))?;
                return Ok(TxStatus::Complete(record));
            }
        }
        if self.zk.exists(&format!("/{txid}/begin"))? {
            return Ok(TxStatus::InProgress);
        }
        Ok(self.check_history(txid)?.unwrap_or(TxStatus::Unknown))
    }

    /// Look for a folded transaction: cached snapshot blobs first, then the
    /// `/history` listing, refreshing the cache as we go.
    fn check_history(&self, txid: &str) -> Result<Option<TxStatus>, ZkError> {
        let mut cache = self.cache_guard();
        for blob in cache.blobs() {
            if let Some(hit) = probe_blob(blob, txid) {
                return Ok(Some(hit));
            }
        }
        if !self.zk.exists("/history")? {
            return Ok(None);
        }
        let mut entries = self.zk.get_children("/history")?;
        entries.sort_by(|a, b| entry_cmp(a, b).reverse());
        self.refresh_cache(&mut cache, &entries, txid)
    }

    /// Walk `/history` newest→oldest, keeping the cache pinned to the newest
    /// `cachesize` snapshots. The first hit is remembered but the walk keeps
    /// filling the cache until it is full or the entries run out.
    fn refresh_cache(
        &self,
        cache: &mut HistoryCache,
        entries: &[String],
        txid: &str,
    ) -> Result<Option<TxStatus>, ZkError> {
        debug!("number of history entries {}", entries.len());
        if entries.is_empty() {
            cache.clear();
            return Ok(None);
        }
        let cache_oldest = if entries.len() > self.cachesize {
            &entries[self.cachesize.saturating_sub(1)]
        } else {
            // entries is non-empty here
            &entries[entries.len() - 1]
        };
        cache.evict_older_than(cache_oldest);
        let mut hit = None;
        let mut size = cache.len();
        for entry in entries {
            if cache.contains(entry) {
                continue;
            }
            let (data, _) = self.zk.get(&format!("/history/{entry}"))?;
            if size < self.cachesize {
                cache.insert(entry, data.clone());
                size += 1;
            }
            if hit.is_none() {
                hit = probe_blob(&data, txid);
            }
            if hit.is_some() && size >= self.cachesize {
                break;
            }
        }
        Ok(hit)
    }
}

impl JournalBackend for ZkJournal {
    fn write(&self, txid: &str, step: &str, msg: &Value) -> Result<(), BackendError> {
        if !self.zk.connected() {
            self.ensure_started();
        }
        if !self.zk.connected() {
            return Err(BackendError::Unavailable);
        }
        let value = record::encode(msg)?;
        match self
            .zk
            .create(&format!("/{txid}/{step}"), value, &self.acl, true, false)
        {
            Ok(_) | Err(ZkError::NodeExists(_)) => Ok(()),
            Err(e) => {
                error!("error writing to zookeeper journal: {}", e);
                Err(e.into())
            }
        }
    }

    fn status(&self, txid: &str) -> TxStatus {
        if !self.zk.connected() {
            self.ensure_started();
        }
        if !self.zk.connected() {
            return TxStatus::Unknown;
        }
        match self.status_inner(txid) {
            Ok(status) => status,
            Err(e) => {
                error!("zookeeper error {}", e);
                TxStatus::Unknown
            }
        }
    }
}

/// Replay one snapshot blob and probe it for the transaction's terminal
/// steps. Undecodable snapshots are logged and skipped.
fn probe_blob(blob: &[u8], txid: &str) -> Option<TxStatus> {
    let result = (|| -> Result<Option<TxStatus>, SnapshotError> {
        let script = snapshot::decompress_script(blob)?;
        let conn = snapshot::load_script(&script)?;
        for step in ["commit", "abort"] {
            if let Some(mut row) = snapshot::query_step(&conn, txid, step)? {
                parse_payload(&mut row)?;
                return Ok(Some(TxStatus::Complete(Value::Object(row))));
            }
        }
        if snapshot::query_step(&conn, txid, "begin")?.is_some() {
            return Ok(Some(TxStatus::InProgress));
        }
        Ok(None)
    })();
    match result {
        Ok(hit) => hit,
        Err(e) => {
            error!("error reading history snapshot: {}", e);
            None
        }
    }
}

/// The snapshot stores `payload` as JSON text; give it back as structure.
fn parse_payload(row: &mut Map<String, Value>) -> Result<(), SnapshotError> {
    if let Some(Value::String(text)) = row.get("payload") {
        let parsed: Value = serde_json::from_str(text)?;
        row.insert("payload".to_string(), parsed);
    }
    Ok(())
}
