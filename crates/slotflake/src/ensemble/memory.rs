use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock},
    time::Instant,
};
use tokio::sync::mpsc;

use crate::ensemble::{ConnectivityReceiver, ConnectivityState, Ensemble, EnsembleError};

/// Upper bound on a single condvar wait, so waiters notice link changes of
/// their own session even without a wakeup.
const WAIT_SLICE: Duration = Duration::from_millis(20);

static NAMED: OnceLock<Mutex<HashMap<String, MemoryEnsemble>>> = OnceLock::new();

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    locks: HashMap<String, u64>,
    next_session: u64,
}

impl Tree {
    fn new_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut end = 0;
        while let Some(pos) = path[end + 1..].find('/') {
            end += pos + 1;
            self.nodes
                .entry(path[..end].to_string())
                .or_insert_with(|| Node {
                    data: Vec::new(),
                    ephemeral_owner: None,
                });
        }
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        owner: Option<u64>,
    ) -> Result<(), EnsembleError> {
        if self.nodes.contains_key(path) {
            return Err(EnsembleError::NodeExists { path: path.into() });
        }
        self.ensure_parents(path);
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                ephemeral_owner: owner,
            },
        );
        Ok(())
    }

    fn delete_recursive(&mut self, path: &str) -> Result<(), EnsembleError> {
        if self.nodes.remove(path).is_none() {
            return Err(EnsembleError::NoNode { path: path.into() });
        }
        let prefix = format!("{path}/");
        self.nodes.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, EnsembleError> {
        if !self.nodes.contains_key(path) {
            return Err(EnsembleError::NoNode { path: path.into() });
        }
        let prefix = format!("{path}/");
        Ok(self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let name = &key[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    /// Drops every ephemeral node and lock owned by `session`.
    fn expire(&mut self, session: u64) {
        self.nodes
            .retain(|_, node| node.ephemeral_owner != Some(session));
        self.locks.retain(|_, owner| *owner != session);
    }
}

#[derive(Debug, Default)]
struct Shared {
    tree: Mutex<Tree>,
    changed: Condvar,
}

/// An in-process coordination ensemble.
///
/// All sessions created from one `MemoryEnsemble` (or its clones) observe a
/// single linearizable tree guarded by one mutex. Each [`MemorySession`]
/// behaves like an independent client connection: its ephemeral nodes and
/// locks vanish when it expires or is dropped, and it can be suspended,
/// resumed, expired and reconnected to drive connectivity transitions.
///
/// # Example
///
/// ```
/// use slotflake::{Ensemble, MemoryEnsemble};
///
/// let ensemble = MemoryEnsemble::new();
/// let a = ensemble.connect();
/// let b = ensemble.connect();
///
/// a.create_ephemeral("/ids/instances/instance_0", b"a").unwrap();
/// assert_eq!(b.children("/ids/instances").unwrap(), vec!["instance_0"]);
///
/// a.expire();
/// assert!(b.children("/ids/instances").unwrap().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct MemoryEnsemble {
    shared: Arc<Shared>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide ensemble registered under `name`, creating
    /// it on first use. Every lookup of the same name shares one tree, so
    /// leases are coordinated between all users of that name in this
    /// process and nowhere else.
    pub fn named(name: &str) -> Self {
        NAMED
            .get_or_init(Mutex::default)
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Opens a new connected session.
    pub fn connect(&self) -> MemorySession {
        let id = self.shared.tree.lock().new_session();
        MemorySession {
            shared: Arc::clone(&self.shared),
            link: Mutex::new(SessionLink {
                id,
                status: LinkStatus::Connected,
                subscribers: Vec::new(),
            }),
            link_changed: Condvar::new(),
        }
    }

    /// Returns the data stored at `path`, if the node exists.
    pub fn node_data(&self, path: &str) -> Option<Vec<u8>> {
        self.shared
            .tree
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkStatus {
    Connected,
    Suspended,
    Expired,
}

#[derive(Debug)]
struct SessionLink {
    id: u64,
    status: LinkStatus,
    subscribers: Vec<mpsc::UnboundedSender<ConnectivityState>>,
}

impl SessionLink {
    fn check(&self) -> Result<u64, EnsembleError> {
        match self.status {
            LinkStatus::Connected => Ok(self.id),
            LinkStatus::Suspended => Err(EnsembleError::ConnectionLoss),
            LinkStatus::Expired => Err(EnsembleError::SessionExpired),
        }
    }

    fn emit(&mut self, state: ConnectivityState) {
        self.subscribers.retain(|tx| tx.send(state).is_ok());
    }
}

/// One client connection to a [`MemoryEnsemble`].
///
/// Every operation first checks the session's link: a suspended session
/// fails with [`EnsembleError::ConnectionLoss`], an expired one with
/// [`EnsembleError::SessionExpired`].
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    link: Mutex<SessionLink>,
    link_changed: Condvar,
}

impl MemorySession {
    /// Identifier of the current ensemble-side session. Changes on
    /// [`MemorySession::reconnect`].
    pub fn session_id(&self) -> u64 {
        self.link.lock().id
    }

    /// Simulates a dropped connection. The session, its ephemeral nodes and
    /// its locks stay alive. Emits [`ConnectivityState::Suspended`].
    pub fn suspend(&self) {
        let mut link = self.link.lock();
        if link.status == LinkStatus::Connected {
            link.status = LinkStatus::Suspended;
            link.emit(ConnectivityState::Suspended);
        }
        self.shared.changed.notify_all();
    }

    /// Re-establishes a suspended connection with the same session. Emits
    /// [`ConnectivityState::Reconnected`].
    pub fn resume(&self) {
        let mut link = self.link.lock();
        if link.status == LinkStatus::Suspended {
            link.status = LinkStatus::Connected;
            link.emit(ConnectivityState::Reconnected);
            self.link_changed.notify_all();
        }
    }

    /// Expires the session: its ephemeral nodes and locks are removed.
    /// Emits [`ConnectivityState::Lost`].
    pub fn expire(&self) {
        let mut link = self.link.lock();
        if link.status == LinkStatus::Expired {
            return;
        }
        link.status = LinkStatus::Expired;
        let id = link.id;
        self.shared.tree.lock().expire(id);
        link.emit(ConnectivityState::Lost);
        self.shared.changed.notify_all();
    }

    /// Opens a fresh session after expiry (or drops a suspended one and
    /// starts over). Emits [`ConnectivityState::Reconnected`].
    pub fn reconnect(&self) {
        let mut link = self.link.lock();
        let mut tree = self.shared.tree.lock();
        if link.status != LinkStatus::Expired {
            tree.expire(link.id);
        }
        link.id = tree.new_session();
        drop(tree);
        link.status = LinkStatus::Connected;
        link.emit(ConnectivityState::Reconnected);
        self.link_changed.notify_all();
        self.shared.changed.notify_all();
    }

    /// Runs `op` against the tree on behalf of the current session.
    ///
    /// The link is checked while holding its mutex and released only after
    /// the tree mutex is taken, so an operation either completes before a
    /// concurrent [`MemorySession::expire`] cleans up or observes the expiry.
    fn with_tree<T>(
        &self,
        op: impl FnOnce(&mut Tree, u64) -> Result<T, EnsembleError>,
    ) -> Result<T, EnsembleError> {
        let link = self.link.lock();
        let session = link.check()?;
        let mut tree = self.shared.tree.lock();
        drop(link);
        op(&mut tree, session)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let link = self.link.get_mut();
        if link.status != LinkStatus::Expired {
            self.shared.tree.lock().expire(link.id);
            self.shared.changed.notify_all();
        }
    }
}

impl Ensemble for MemorySession {
    fn create_persistent(&self, path: &str) -> Result<(), EnsembleError> {
        self.with_tree(|tree, _| tree.create(path, &[], None))
    }

    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<String, EnsembleError> {
        self.with_tree(|tree, session| {
            tree.create(path, data, Some(session))
                .map(|()| path.to_string())
        })
    }

    fn delete(&self, path: &str) -> Result<(), EnsembleError> {
        let result = self.with_tree(|tree, _| tree.delete_recursive(path));
        self.shared.changed.notify_all();
        result
    }

    fn children(&self, path: &str) -> Result<Vec<String>, EnsembleError> {
        self.with_tree(|tree, _| tree.children(path))
    }

    fn lock(&self, path: &str, timeout: Duration) -> Result<(), EnsembleError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let link = self.link.lock();
            let session = link.check()?;
            let mut tree = self.shared.tree.lock();
            drop(link);

            match tree.locks.get(path) {
                None => {
                    tree.locks.insert(path.to_string(), session);
                    return Ok(());
                }
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EnsembleError::LockTimeout {
                            path: path.into(),
                            waited: started.elapsed(),
                        });
                    }
                    let wake = deadline.min(now + WAIT_SLICE);
                    let _ = self.shared.changed.wait_until(&mut tree, wake);
                }
            }
        }
    }

    fn unlock(&self, path: &str) -> Result<(), EnsembleError> {
        let result = self.with_tree(|tree, session| match tree.locks.get(path) {
            Some(owner) if *owner == session => {
                tree.locks.remove(path);
                Ok(())
            }
            _ => Err(EnsembleError::NotLocked { path: path.into() }),
        });
        self.shared.changed.notify_all();
        result
    }

    fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut link = self.link.lock();
        while link.status != LinkStatus::Connected {
            if self
                .link_changed
                .wait_until(&mut link, deadline)
                .timed_out()
            {
                return link.status == LinkStatus::Connected;
            }
        }
        true
    }

    fn subscribe(&self) -> ConnectivityReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn named_ensembles_share_a_tree_per_name() {
        let a = MemoryEnsemble::named("memory-tests-shared");
        let b = MemoryEnsemble::named("memory-tests-shared");
        let other = MemoryEnsemble::named("memory-tests-other");

        let session = a.connect();
        session.create_persistent("/named").unwrap();
        assert!(b.exists("/named"));
        assert!(!other.exists("/named"));
    }

    #[test]
    fn creates_parents_and_lists_direct_children_only() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.create_persistent("/a/b/instances").unwrap();
        session
            .create_ephemeral("/a/b/instances/instance_1", b"x")
            .unwrap();
        session
            .create_ephemeral("/a/b/instances/instance_0", b"y")
            .unwrap();
        session.create_persistent("/a/b/instancesX").unwrap();

        assert!(ensemble.exists("/a"));
        assert!(ensemble.exists("/a/b"));
        let mut children = session.children("/a/b/instances").unwrap();
        children.sort();
        assert_eq!(children, vec!["instance_0", "instance_1"]);
        assert_eq!(
            session.children("/a/b").unwrap().len(),
            2,
            "instances and instancesX"
        );
        assert_eq!(
            ensemble.node_data("/a/b/instances/instance_1"),
            Some(b"x".to_vec())
        );
    }

    #[test]
    fn create_twice_reports_node_exists() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.create_persistent("/p").unwrap();
        assert_eq!(
            session.create_persistent("/p"),
            Err(EnsembleError::NodeExists { path: "/p".into() })
        );
    }

    #[test]
    fn delete_is_recursive_and_reports_missing() {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        session.create_persistent("/p/q/r").unwrap();
        session.delete("/p/q").unwrap();
        assert!(!ensemble.exists("/p/q/r"));
        assert!(ensemble.exists("/p"));
        assert_eq!(
            session.delete("/p/q"),
            Err(EnsembleError::NoNode { path: "/p/q".into() })
        );
    }

    #[test]
    fn expire_removes_only_own_ephemeral_nodes() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();
        a.create_ephemeral("/m/a", b"").unwrap();
        b.create_ephemeral("/m/b", b"").unwrap();

        a.expire();
        assert!(!ensemble.exists("/m/a"));
        assert!(ensemble.exists("/m/b"));
        assert!(ensemble.exists("/m"), "persistent parent survives");
        assert_eq!(a.children("/m"), Err(EnsembleError::SessionExpired));
    }

    #[test]
    fn dropping_a_session_cleans_up_like_expiry() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        a.create_ephemeral("/m/a", b"").unwrap();
        a.lock("/lock", Duration::from_millis(10)).unwrap();
        drop(a);

        let b = ensemble.connect();
        assert!(!ensemble.exists("/m/a"));
        b.lock("/lock", Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn suspended_session_keeps_nodes_but_rejects_calls() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let mut events = a.subscribe();
        a.create_ephemeral("/m/a", b"").unwrap();

        a.suspend();
        assert_eq!(a.children("/m"), Err(EnsembleError::ConnectionLoss));
        assert!(ensemble.exists("/m/a"));

        a.resume();
        assert_eq!(a.children("/m").unwrap(), vec!["a"]);
        assert_eq!(events.try_recv(), Ok(ConnectivityState::Suspended));
        assert_eq!(events.try_recv(), Ok(ConnectivityState::Reconnected));
    }

    #[test]
    fn reconnect_assigns_a_new_session() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let mut events = a.subscribe();
        let first = a.session_id();

        a.expire();
        a.reconnect();
        assert_ne!(a.session_id(), first);
        assert!(a.children("/").is_err(), "root is not a node");
        a.create_ephemeral("/m/a", b"").unwrap();
        assert_eq!(events.try_recv(), Ok(ConnectivityState::Lost));
        assert_eq!(events.try_recv(), Ok(ConnectivityState::Reconnected));
    }

    #[test]
    fn lock_is_mutually_exclusive_across_sessions() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();

        a.lock("/lock", Duration::from_millis(10)).unwrap();
        assert!(matches!(
            b.lock("/lock", Duration::from_millis(30)),
            Err(EnsembleError::LockTimeout { .. })
        ));
        assert_eq!(
            b.unlock("/lock"),
            Err(EnsembleError::NotLocked {
                path: "/lock".into()
            })
        );

        thread::scope(|s| {
            let waiter = s.spawn(|| b.lock("/lock", Duration::from_secs(5)));
            thread::sleep(Duration::from_millis(20));
            a.unlock("/lock").unwrap();
            waiter.join().unwrap().unwrap();
        });
        b.unlock("/lock").unwrap();
    }

    #[test]
    fn expiry_releases_held_locks() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        let b = ensemble.connect();
        a.lock("/lock", Duration::from_millis(10)).unwrap();
        a.expire();
        b.lock("/lock", Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn wait_connected_times_out_while_suspended() {
        let ensemble = MemoryEnsemble::new();
        let a = ensemble.connect();
        assert!(a.wait_connected(Duration::from_millis(1)));
        a.suspend();
        assert!(!a.wait_connected(Duration::from_millis(10)));
        thread::scope(|s| {
            let waiter = s.spawn(|| a.wait_connected(Duration::from_secs(5)));
            thread::sleep(Duration::from_millis(10));
            a.resume();
            assert!(waiter.join().unwrap());
        });
    }
}
