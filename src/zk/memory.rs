//! In-process coordination client
//!
//! `MemoryZk` implements the [`ZkClient`] seam against a process-local node
//! tree with the service's data-model semantics: persistent nodes, per-parent
//! 10-digit signed sequence counters that wrap across the 32-bit range, atomic
//! multi-op transactions, and creation-time stats in milliseconds. It backs
//! the `zookeeper+mem://` scheme (instances are shared per URL within the
//! process) and every test in the crate. The session state is togglable so
//! failover paths can be exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use super::{
    Acl, NodeStat, Perms, StateListener, ZkClient, ZkError, ZkOp, ZkOpResult, ZkResult, ZkState,
    ZkUrl,
};

static SHARED: Lazy<Mutex<HashMap<String, Arc<MemoryZk>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone)]
struct Node {
    value: Vec<u8>,
    ctime_ms: i64,
    next_seq: i32,
    #[allow(dead_code)]
    acl: Vec<Acl>,
}

impl Node {
    fn new(value: Vec<u8>, acl: Vec<Acl>) -> Self {
        Node {
            value,
            ctime_ms: now_ms(),
            next_seq: 0,
            acl,
        }
    }
}

struct Inner {
    nodes: BTreeMap<String, Node>,
    locks: HashSet<String>,
    state: ZkState,
    available: bool,
    listeners: Vec<StateListener>,
}

pub struct MemoryZk {
    inner: Mutex<Inner>,
    chroot: String,
}

impl MemoryZk {
    pub fn new(chroot: &str) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), Vec::new()));
        MemoryZk {
            inner: Mutex::new(Inner {
                nodes,
                locks: HashSet::new(),
                state: ZkState::Lost,
                available: true,
                listeners: Vec::new(),
            }),
            chroot: chroot.to_string(),
        }
    }

    /// Return the process-wide instance for a URL, creating it on first use.
    /// Connections to the same hosts+chroot share one node tree, so separate
    /// components in one process observe each other's writes.
    pub fn shared(url: &ZkUrl) -> Arc<MemoryZk> {
        let key = format!("{}|{}", url.hosts.join(","), url.chroot);
        let mut shared = lock_poisoned(&SHARED);
        shared
            .entry(key)
            .or_insert_with(|| Arc::new(MemoryZk::new(&url.chroot)))
            .clone()
    }

    /// Toggle reachability: while unavailable, `start` times out and every
    /// operation fails with connection loss. Used to drive failover tests.
    pub fn set_available(&self, available: bool) {
        let listeners_state = {
            let mut inner = lock_poisoned(&self.inner);
            inner.available = available;
            if !available {
                inner.state = ZkState::Lost;
            }
            inner.state
        };
        if !available {
            self.notify(listeners_state);
        }
    }

    fn notify(&self, state: ZkState) {
        let inner = lock_poisoned(&self.inner);
        for listener in &inner.listeners {
            listener(state);
        }
    }

    fn with_connected<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> ZkResult<T>,
    ) -> ZkResult<T> {
        let mut inner = lock_poisoned(&self.inner);
        if inner.state != ZkState::Connected {
            return Err(ZkError::ConnectionLoss);
        }
        f(&mut inner)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_child_of(path: &str, parent: &str) -> Option<String> {
    let prefix = if parent == "/" {
        "/".to_string()
    } else {
        format!("{parent}/")
    };
    let rest = path.strip_prefix(&prefix)?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest.to_string())
    }
}

fn create_in(
    inner: &mut Inner,
    path: &str,
    value: Vec<u8>,
    acl: &[Acl],
    makepath: bool,
    sequence: bool,
) -> ZkResult<String> {
    let parent = parent_of(path)
        .ok_or_else(|| ZkError::Other(format!("cannot create root: {path}")))?
        .to_string();
    if !inner.nodes.contains_key(&parent) {
        if !makepath {
            return Err(ZkError::NoNode(parent));
        }
        create_in(inner, &parent, Vec::new(), acl, true, false)?;
    }
    let final_path = if sequence {
        let parent_node = inner
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| ZkError::NoNode(parent.clone()))?;
        let seq = parent_node.next_seq;
        parent_node.next_seq = parent_node.next_seq.wrapping_add(1);
        format!("{path}{seq:010}")
    } else {
        if inner.nodes.contains_key(path) {
            return Err(ZkError::NodeExists(path.to_string()));
        }
        path.to_string()
    };
    inner
        .nodes
        .insert(final_path.clone(), Node::new(value, acl.to_vec()));
    Ok(final_path)
}

fn delete_in(inner: &mut Inner, path: &str) -> ZkResult<()> {
    if !inner.nodes.contains_key(path) {
        return Err(ZkError::NoNode(path.to_string()));
    }
    let has_children = inner
        .nodes
        .keys()
        .any(|p| is_child_of(p, path).is_some());
    if has_children {
        return Err(ZkError::NotEmpty(path.to_string()));
    }
    inner.nodes.remove(path);
    Ok(())
}

impl ZkClient for MemoryZk {
    fn state(&self) -> ZkState {
        lock_poisoned(&self.inner).state
    }

    fn start(&self, _timeout: Duration) -> ZkResult<()> {
        let state = {
            let mut inner = lock_poisoned(&self.inner);
            if !inner.available {
                return Err(ZkError::Timeout);
            }
            inner.state = ZkState::Connected;
            inner.state
        };
        self.notify(state);
        Ok(())
    }

    fn stop(&self) {
        let state = {
            let mut inner = lock_poisoned(&self.inner);
            inner.state = ZkState::Lost;
            inner.state
        };
        self.notify(state);
    }

    fn add_state_listener(&self, listener: StateListener) {
        lock_poisoned(&self.inner).listeners.push(listener);
    }

    fn exists(&self, path: &str) -> ZkResult<bool> {
        self.with_connected(|inner| Ok(inner.nodes.contains_key(path)))
    }

    fn get(&self, path: &str) -> ZkResult<(Vec<u8>, NodeStat)> {
        self.with_connected(|inner| {
            let node = inner
                .nodes
                .get(path)
                .ok_or_else(|| ZkError::NoNode(path.to_string()))?;
            Ok((
                node.value.clone(),
                NodeStat {
                    ctime_ms: node.ctime_ms,
                },
            ))
        })
    }

    fn get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        self.with_connected(|inner| {
            if !inner.nodes.contains_key(path) {
                return Err(ZkError::NoNode(path.to_string()));
            }
            Ok(inner
                .nodes
                .keys()
                .filter_map(|p| is_child_of(p, path))
                .collect())
        })
    }

    fn create(
        &self,
        path: &str,
        value: Vec<u8>,
        acl: &[Acl],
        makepath: bool,
        sequence: bool,
    ) -> ZkResult<String> {
        self.with_connected(|inner| create_in(inner, path, value, acl, makepath, sequence))
    }

    fn delete(&self, path: &str) -> ZkResult<()> {
        self.with_connected(|inner| delete_in(inner, path))
    }

    fn multi(&self, ops: Vec<ZkOp>) -> ZkResult<Vec<ZkResult<ZkOpResult>>> {
        self.with_connected(|inner| {
            // Validate the whole transaction first: all-or-nothing.
            let mut failed = false;
            let mut results: Vec<ZkResult<ZkOpResult>> = Vec::with_capacity(ops.len());
            let mut pending_deletes: HashSet<String> = HashSet::new();
            for op in &ops {
                match op {
                    ZkOp::Create { path, sequence, .. } => {
                        if !sequence && inner.nodes.contains_key(path.as_str()) {
                            results.push(Err(ZkError::NodeExists(path.clone())));
                            failed = true;
                        } else if parent_of(path)
                            .map(|p| !inner.nodes.contains_key(p))
                            .unwrap_or(true)
                        {
                            results.push(Err(ZkError::NoNode(path.clone())));
                            failed = true;
                        } else {
                            results.push(Ok(ZkOpResult::Created(path.clone())));
                        }
                    }
                    ZkOp::Delete { path } => {
                        let children_left = inner.nodes.keys().any(|p| {
                            is_child_of(p, path).is_some() && !pending_deletes.contains(p.as_str())
                        });
                        if !inner.nodes.contains_key(path.as_str()) {
                            results.push(Err(ZkError::NoNode(path.clone())));
                            failed = true;
                        } else if children_left {
                            results.push(Err(ZkError::NotEmpty(path.clone())));
                            failed = true;
                        } else {
                            pending_deletes.insert(path.clone());
                            results.push(Ok(ZkOpResult::Deleted));
                        }
                    }
                }
            }
            if failed {
                return Ok(results);
            }
            // Apply. Sequence numbers are assigned here so a rolled-back
            // transaction never consumes one.
            let mut applied = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    ZkOp::Create {
                        path,
                        value,
                        acl,
                        sequence,
                    } => {
                        let created = create_in(inner, &path, value, &acl, false, sequence)?;
                        applied.push(Ok(ZkOpResult::Created(created)));
                    }
                    ZkOp::Delete { path } => {
                        delete_in(inner, &path)?;
                        applied.push(Ok(ZkOpResult::Deleted));
                    }
                }
            }
            Ok(applied)
        })
    }

    fn try_lock(&self, path: &str) -> ZkResult<bool> {
        self.with_connected(|inner| {
            if inner.locks.contains(path) {
                return Ok(false);
            }
            if !inner.nodes.contains_key(path) {
                create_in(inner, path, Vec::new(), &[], true, false)?;
            }
            inner.locks.insert(path.to_string());
            Ok(true)
        })
    }

    fn unlock(&self, path: &str) {
        lock_poisoned(&self.inner).locks.remove(path);
    }

    fn chroot(&self) -> String {
        self.chroot.clone()
    }

    fn self_acl(&self, perms: Perms) -> Acl {
        // The in-process client carries no authenticated identity.
        Acl::anonymous(perms)
    }

    fn user_acl(&self, _user: &str, perms: Perms) -> Acl {
        Acl::anonymous(perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> MemoryZk {
        let zk = MemoryZk::new("/test");
        zk.start(Duration::from_secs(1)).unwrap();
        zk
    }

    #[test]
    fn test_create_get_round_trip() {
        let zk = connected();
        zk.create("/tx1/begin", b"data".to_vec(), &[], true, false)
            .unwrap();
        let (value, stat) = zk.get("/tx1/begin").unwrap();
        assert_eq!(value, b"data");
        assert!(stat.ctime_ms > 0);
        assert!(zk.exists("/tx1").unwrap());
    }

    #[test]
    fn test_duplicate_create_fails() {
        let zk = connected();
        zk.create("/tx1/begin", b"a".to_vec(), &[], true, false)
            .unwrap();
        assert!(matches!(
            zk.create("/tx1/begin", b"b".to_vec(), &[], true, false),
            Err(ZkError::NodeExists(_))
        ));
    }

    #[test]
    fn test_get_children() {
        let zk = connected();
        zk.create("/tx1/begin", Vec::new(), &[], true, false).unwrap();
        zk.create("/tx1/commit", Vec::new(), &[], true, false).unwrap();
        zk.create("/tx2/begin", Vec::new(), &[], true, false).unwrap();
        let mut roots = zk.get_children("/").unwrap();
        roots.sort();
        assert_eq!(roots, vec!["tx1", "tx2"]);
        let mut steps = zk.get_children("/tx1").unwrap();
        steps.sort();
        assert_eq!(steps, vec!["begin", "commit"]);
    }

    #[test]
    fn test_sequence_naming() {
        let zk = connected();
        zk.create("/history", Vec::new(), &[], true, false).unwrap();
        let first = zk
            .create("/history/sqlite-db#", Vec::new(), &[], false, true)
            .unwrap();
        let second = zk
            .create("/history/sqlite-db#", Vec::new(), &[], false, true)
            .unwrap();
        assert_eq!(first, "/history/sqlite-db#0000000000");
        assert_eq!(second, "/history/sqlite-db#0000000001");
    }

    #[test]
    fn test_delete_non_empty() {
        let zk = connected();
        zk.create("/tx1/begin", Vec::new(), &[], true, false).unwrap();
        assert!(matches!(zk.delete("/tx1"), Err(ZkError::NotEmpty(_))));
        zk.delete("/tx1/begin").unwrap();
        zk.delete("/tx1").unwrap();
        assert!(!zk.exists("/tx1").unwrap());
    }

    #[test]
    fn test_multi_commits_atomically() {
        let zk = connected();
        zk.create("/history", Vec::new(), &[], true, false).unwrap();
        zk.create("/tx1/commit", Vec::new(), &[], true, false).unwrap();
        let results = zk
            .multi(vec![
                ZkOp::Create {
                    path: "/history/sqlite-db#".to_string(),
                    value: b"blob".to_vec(),
                    acl: Vec::new(),
                    sequence: true,
                },
                ZkOp::Delete {
                    path: "/tx1/commit".to_string(),
                },
            ])
            .unwrap();
        assert!(results.iter().all(Result::is_ok));
        assert!(!zk.exists("/tx1/commit").unwrap());
        assert!(zk.exists("/history/sqlite-db#0000000000").unwrap());
    }

    #[test]
    fn test_multi_rolls_back_on_failure() {
        let zk = connected();
        zk.create("/history", Vec::new(), &[], true, false).unwrap();
        let results = zk
            .multi(vec![
                ZkOp::Create {
                    path: "/history/sqlite-db#".to_string(),
                    value: b"blob".to_vec(),
                    acl: Vec::new(),
                    sequence: true,
                },
                ZkOp::Delete {
                    path: "/missing".to_string(),
                },
            ])
            .unwrap();
        assert!(results.iter().any(Result::is_err));
        // Nothing applied, and no sequence number was consumed.
        assert_eq!(zk.get_children("/history").unwrap(), Vec::<String>::new());
        let created = zk
            .create("/history/sqlite-db#", Vec::new(), &[], false, true)
            .unwrap();
        assert_eq!(created, "/history/sqlite-db#0000000000");
    }

    #[test]
    fn test_lock_is_exclusive() {
        let zk = connected();
        assert!(zk.try_lock("/tx1_lock").unwrap());
        assert!(!zk.try_lock("/tx1_lock").unwrap());
        zk.unlock("/tx1_lock");
        assert!(zk.try_lock("/tx1_lock").unwrap());
        // The lock node persists until deleted explicitly.
        zk.unlock("/tx1_lock");
        assert!(zk.exists("/tx1_lock").unwrap());
    }

    #[test]
    fn test_unavailable_client_refuses_operations() {
        let zk = connected();
        zk.set_available(false);
        assert!(matches!(
            zk.start(Duration::from_secs(1)),
            Err(ZkError::Timeout)
        ));
        assert!(matches!(zk.exists("/"), Err(ZkError::ConnectionLoss)));
        zk.set_available(true);
        zk.start(Duration::from_secs(1)).unwrap();
        assert!(zk.exists("/").unwrap());
    }

    #[test]
    fn test_state_listener_fires() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let zk = MemoryZk::new("/test");
        let transitions = Arc::new(AtomicUsize::new(0));
        let seen = transitions.clone();
        zk.add_state_listener(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        zk.start(Duration::from_secs(1)).unwrap();
        zk.stop();
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }
}
