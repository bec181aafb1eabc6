//! In-memory coordination service for testing.
//!
//! Models the parts of a ZooKeeper ensemble the lock recipe relies on:
//!
//! - sessions that own ephemeral nodes and delete them when closed
//! - a service-wide creation id counter (the fence token source)
//! - per-parent signed 32-bit sequence counters that roll over to negative
//!   values like the real thing
//! - one-shot child watches
//!
//! Faults can be injected to exercise the retry and cleanup paths.
//!
//! # Example
//!
//! ```ignore
//! let ensemble = InMemoryCoordinationService::new();
//! let session = ensemble.connect();
//! let locker = SequentialNodeLocker::new(session, "/locks");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use super::coordination::{
    ChangeSignal, Children, CoordinationService, CreatedNode, NodeStat, format_sequence,
    node_name,
};
use super::error::{ClusterError, ClusterResult};

#[derive(Debug)]
struct NodeEntry {
    stat: NodeStat,
    ephemeral_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct Ensemble {
    /// Full path to node, including container parents.
    nodes: BTreeMap<String, NodeEntry>,
    /// Next sequence number per parent path.
    sequences: HashMap<String, i32>,
    /// Where new parents start counting.
    initial_sequence: i32,
    next_creation_id: u64,
    next_session: u64,
    closed_sessions: Vec<u64>,
    watches: HashMap<String, Vec<oneshot::Sender<()>>>,
    /// Creates that fail before touching the tree.
    failing_creates: u32,
    /// Creates that succeed but report a connection loss to the caller.
    lost_create_replies: u32,
    /// Listings that fail with a transient error.
    failing_listings: u32,
}

impl Ensemble {
    fn fire_watches(&mut self, parent: &str) {
        if let Some(watchers) = self.watches.remove(parent) {
            for watcher in watchers {
                let _ = watcher.send(());
            }
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !self.nodes.contains_key(&current) {
                self.next_creation_id += 1;
                self.nodes.insert(
                    current.clone(),
                    NodeEntry {
                        stat: NodeStat {
                            creation_id: self.next_creation_id,
                        },
                        ephemeral_owner: None,
                    },
                );
            }
        }
    }

    fn children_of(&self, parent: &str) -> Vec<String> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(path, _)| path[prefix.len()..].to_string())
            .collect()
    }
}

/// Shared in-memory ensemble. Cheap to clone; clones see the same tree.
#[derive(Clone, Default)]
pub struct InMemoryCoordinationService {
    ensemble: Arc<Mutex<Ensemble>>,
}

impl InMemoryCoordinationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every new parent's sequence counter at `sequence`.
    ///
    /// Used to exercise counter rollover without creating two billion nodes.
    pub fn with_initial_sequence(self, sequence: i32) -> Self {
        self.lock().initial_sequence = sequence;
        self
    }

    /// Open a new session against the ensemble.
    pub fn connect(&self) -> Arc<InMemorySession> {
        let id = {
            let mut ensemble = self.lock();
            ensemble.next_session += 1;
            ensemble.next_session
        };
        debug!(session = id, "Opened coordination session");
        Arc::new(InMemorySession {
            id,
            ensemble: self.ensemble.clone(),
        })
    }

    /// Names of the children under `parent`, sorted.
    pub fn children_of(&self, parent: &str) -> Vec<String> {
        self.lock().children_of(parent)
    }

    /// Total number of ephemeral nodes in the tree.
    pub fn ephemeral_count(&self) -> usize {
        self.lock()
            .nodes
            .values()
            .filter(|n| n.ephemeral_owner.is_some())
            .count()
    }

    /// Delete a node from outside any session, as an operator or a session
    /// expiry on another client would.
    pub fn force_delete(&self, path: &str) {
        let mut ensemble = self.lock();
        if ensemble.nodes.remove(path).is_some()
            && let Some((parent, _)) = path.rsplit_once('/')
        {
            ensemble.fire_watches(parent);
        }
    }

    /// Fail the next `count` creates with a transient error.
    pub fn fail_next_creates(&self, count: u32) {
        self.lock().failing_creates = count;
    }

    /// Let the next `count` creates succeed but report a connection loss.
    pub fn lose_next_create_replies(&self, count: u32) {
        self.lock().lost_create_replies = count;
    }

    /// Fail the next `count` child listings with a transient error.
    pub fn fail_next_listings(&self, count: u32) {
        self.lock().failing_listings = count;
    }

    fn lock(&self) -> MutexGuard<'_, Ensemble> {
        self.ensemble.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One client session. Closing it deletes the session's ephemeral nodes.
pub struct InMemorySession {
    id: u64,
    ensemble: Arc<Mutex<Ensemble>>,
}

impl InMemorySession {
    /// Expire the session, deleting its ephemeral nodes and firing watches.
    pub fn close(&self) {
        let mut ensemble = self.lock();
        if ensemble.closed_sessions.contains(&self.id) {
            return;
        }
        ensemble.closed_sessions.push(self.id);

        let owned: Vec<String> = ensemble
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            ensemble.nodes.remove(&path);
            if let Some((parent, _)) = path.rsplit_once('/') {
                ensemble.fire_watches(parent);
            }
        }
        debug!(session = self.id, "Closed coordination session");
    }

    fn lock(&self) -> MutexGuard<'_, Ensemble> {
        self.ensemble.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self) -> ClusterResult<MutexGuard<'_, Ensemble>> {
        let ensemble = self.lock();
        if ensemble.closed_sessions.contains(&self.id) {
            return Err(ClusterError::Coordination(format!(
                "session {} has expired",
                self.id
            )));
        }
        Ok(ensemble)
    }
}

#[async_trait]
impl CoordinationService for InMemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create_ephemeral_sequential(
        &self,
        path_prefix: &str,
        _data: &[u8],
    ) -> ClusterResult<CreatedNode> {
        let mut ensemble = self.live()?;
        if ensemble.failing_creates > 0 {
            ensemble.failing_creates -= 1;
            return Err(ClusterError::CoordinationTransient(
                "connection loss before create".into(),
            ));
        }

        let (parent, _) = path_prefix
            .rsplit_once('/')
            .ok_or_else(|| ClusterError::Coordination(format!("invalid path {}", path_prefix)))?;
        let parent = parent.to_string();
        ensemble.ensure_parents(&parent);

        let initial = ensemble.initial_sequence;
        let counter = ensemble.sequences.entry(parent.clone()).or_insert(initial);
        let sequence = *counter;
        *counter = counter.wrapping_add(1);

        ensemble.next_creation_id += 1;
        let stat = NodeStat {
            creation_id: ensemble.next_creation_id,
        };
        let path = format!("{}{}", path_prefix, format_sequence(sequence));
        ensemble.nodes.insert(
            path.clone(),
            NodeEntry {
                stat,
                ephemeral_owner: Some(self.id),
            },
        );
        ensemble.fire_watches(&parent);

        if ensemble.lost_create_replies > 0 {
            ensemble.lost_create_replies -= 1;
            return Err(ClusterError::CoordinationTransient(format!(
                "connection loss after creating {}",
                node_name(&path)
            )));
        }
        Ok(CreatedNode { path, stat })
    }

    async fn get_children(&self, path: &str, watch: bool) -> ClusterResult<Children> {
        let mut ensemble = self.live()?;
        if ensemble.failing_listings > 0 {
            ensemble.failing_listings -= 1;
            return Err(ClusterError::CoordinationTransient(
                "connection loss while listing".into(),
            ));
        }
        if !ensemble.nodes.contains_key(path) {
            return Err(ClusterError::NoNode(path.to_string()));
        }

        let names = ensemble.children_of(path);
        let change = watch.then(|| {
            let (tx, rx) = oneshot::channel();
            ensemble.watches.entry(path.to_string()).or_default().push(tx);
            ChangeSignal::new(rx)
        });
        Ok(Children { names, change })
    }

    async fn stat(&self, path: &str) -> ClusterResult<Option<NodeStat>> {
        let ensemble = self.live()?;
        Ok(ensemble.nodes.get(path).map(|node| node.stat))
    }

    async fn delete(&self, path: &str) -> ClusterResult<()> {
        let mut ensemble = self.live()?;
        if ensemble.nodes.remove(path).is_some()
            && let Some((parent, _)) = path.rsplit_once('/')
        {
            ensemble.fire_watches(parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequential_create() {
        let ensemble = InMemoryCoordinationService::new();
        let session = ensemble.connect();

        let first = session
            .create_ephemeral_sequential("/locks/p/a-lock-", b"a")
            .await
            .unwrap();
        let second = session
            .create_ephemeral_sequential("/locks/p/b-lock-", b"b")
            .await
            .unwrap();

        assert_eq!(first.path, "/locks/p/a-lock-0000000000");
        assert_eq!(second.path, "/locks/p/b-lock-0000000001");
        assert!(second.stat.creation_id > first.stat.creation_id);
        assert_eq!(
            ensemble.children_of("/locks/p"),
            vec!["a-lock-0000000000", "b-lock-0000000001"]
        );
    }

    #[tokio::test]
    async fn test_sequence_wraps() {
        let ensemble = InMemoryCoordinationService::new().with_initial_sequence(i32::MAX);
        let session = ensemble.connect();

        let last = session.create_ephemeral_sequential("/l/n-", b"").await.unwrap();
        let wrapped = session.create_ephemeral_sequential("/l/n-", b"").await.unwrap();
        let next = session.create_ephemeral_sequential("/l/n-", b"").await.unwrap();
        assert_eq!(last.name(), "n-2147483647");
        // The counter is signed and keeps counting up from its minimum.
        assert_eq!(wrapped.name(), "n--2147483648");
        assert_eq!(next.name(), "n--2147483647");
    }

    #[tokio::test]
    async fn test_watch_fires_on_delete() {
        let ensemble = InMemoryCoordinationService::new();
        let session = ensemble.connect();
        let node = session.create_ephemeral_sequential("/l/n-", b"").await.unwrap();

        let children = session.get_children("/l", true).await.unwrap();
        session.delete(&node.path).await.unwrap();
        children.change.unwrap().changed().await;

        assert!(session.get_children("/l", false).await.unwrap().names.is_empty());
        // Deleting again is fine.
        session.delete(&node.path).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals() {
        let ensemble = InMemoryCoordinationService::new();
        let session = ensemble.connect();
        session.create_ephemeral_sequential("/l/n-", b"").await.unwrap();
        assert_eq!(ensemble.ephemeral_count(), 1);

        session.close();
        assert_eq!(ensemble.ephemeral_count(), 0);
        assert!(session.get_children("/l", false).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let ensemble = InMemoryCoordinationService::new();
        let session = ensemble.connect();
        let err = session.get_children("/nothing", false).await.unwrap_err();
        assert!(matches!(err, ClusterError::NoNode(_)));
    }
}
