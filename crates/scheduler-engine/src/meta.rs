//! Metadata-store seam: the replicated task table and object-location table.
//!
//! The engine talks to the store through [`MetadataStore`] so that the same
//! scheduling code runs against the Redis-backed cluster store
//! ([`crate::RedisMetaStore`]) and the in-process [`MemoryMetaStore`] used in
//! standalone mode and in tests. Every call is awaited on the engine task,
//! which preserves per-key ordering between a write and the next read.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use taskforge_core::{NodeId, ObjectId, TaskId, TaskSpec};

/// Lifecycle state of a task-table entry.
///
/// Precedence is monotone `Waiting < Scheduled < Running < Done`, with
/// `Lost` able to supersede any non-terminal state. Concurrent blind writes
/// resolve by precedence; racy transitions (reconstruction) use
/// [`MetadataStore::task_update`], a compare-and-set on the prior status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Submitted; waiting for inputs or a worker.
    Waiting,
    /// Assigned to a worker on some node.
    Scheduled,
    /// Executing.
    Running,
    /// Finished; return objects were produced.
    Done,
    /// The executing worker died before finishing.
    Lost,
}

impl TaskStatus {
    fn precedence(self) -> u8 {
        match self {
            TaskStatus::Waiting => 1,
            TaskStatus::Scheduled => 2,
            TaskStatus::Running => 3,
            TaskStatus::Done => 4,
            // Lost competes through `may_replace`, not precedence.
            TaskStatus::Lost => 0,
        }
    }

    /// Whether a blind write of `self` may replace `current`.
    pub fn may_replace(self, current: TaskStatus) -> bool {
        match self {
            TaskStatus::Lost => current != TaskStatus::Done,
            _ => self.precedence() > current.precedence(),
        }
    }

    /// Stable string form used in store encodings.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Lost => "lost",
        }
    }

    /// Parse the form produced by [`TaskStatus::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(TaskStatus::Waiting),
            "scheduled" => Some(TaskStatus::Scheduled),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "lost" => Some(TaskStatus::Lost),
            _ => None,
        }
    }
}

/// One task-table record: the immutable spec plus mutable status and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTableEntry {
    /// Content-derived task id (key of the record).
    pub task_id: TaskId,
    /// The immutable spec.
    pub spec: TaskSpec,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Node responsible for (re)queueing the task locally.
    pub owner: NodeId,
    /// Unix timestamp of the last write.
    pub updated_at: i64,
}

impl TaskTableEntry {
    /// Build an entry for `spec`, stamped with the current time.
    pub fn new(spec: TaskSpec, status: TaskStatus, owner: NodeId) -> Self {
        Self {
            task_id: spec.id(),
            spec,
            status,
            owner,
            updated_at: Utc::now().timestamp(),
        }
    }
}

/// Failure talking to the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store is unreachable (connection refused, dropped, timed out).
    #[error("metadata store unreachable: {0}")]
    Unavailable(String),
    /// The store answered with something unusable.
    #[error("metadata store backend error: {0}")]
    Backend(String),
}

/// Asynchronous client for the replicated metadata store.
///
/// All operations are delivered back on the calling task; per-key ordering is
/// the caller's to preserve (the engine awaits each call inline).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Write a task-table entry. Concurrent writers resolve by status
    /// precedence: a write that does not supersede the stored status is a
    /// silent no-op.
    async fn task_add(&self, entry: TaskTableEntry) -> Result<(), StoreError>;

    /// Compare-and-set the status of `task_id`: applied only if the stored
    /// status is one of `expected`. Returns whether the write was applied.
    async fn task_update(
        &self,
        task_id: TaskId,
        expected: &[TaskStatus],
        new: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Read a task-table entry.
    async fn task_get(&self, task_id: TaskId) -> Result<Option<TaskTableEntry>, StoreError>;

    /// Record that `node` holds a copy of `oid`.
    async fn object_add(
        &self,
        oid: ObjectId,
        node: NodeId,
        size: u64,
        hash: u64,
    ) -> Result<(), StoreError>;

    /// Remove `node` from the location set of `oid`.
    async fn object_remove(&self, oid: ObjectId, node: NodeId) -> Result<(), StoreError>;

    /// All nodes currently holding a copy of `oid`.
    async fn object_lookup(&self, oid: ObjectId) -> Result<Vec<NodeId>, StoreError>;

    /// Stream of task-table writes whose entry is owned by `node`, in commit
    /// order.
    async fn subscribe(
        &self,
        node: NodeId,
    ) -> Result<mpsc::UnboundedReceiver<TaskTableEntry>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<TaskId, TaskTableEntry>,
    locations: HashMap<ObjectId, Vec<NodeId>>,
    subscribers: HashMap<NodeId, Vec<mpsc::UnboundedSender<TaskTableEntry>>>,
}

impl MemoryInner {
    fn notify(&mut self, entry: &TaskTableEntry) {
        if let Some(subs) = self.subscribers.get_mut(&entry.owner) {
            subs.retain(|tx| tx.send(entry.clone()).is_ok());
        }
    }
}

/// In-process metadata store with strict single-winner CAS semantics.
///
/// Backs standalone (single-node) operation and the engine test suites.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryMetaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetaStore {
    async fn task_add(&self, entry: TaskTableEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("meta store lock");
        match inner.tasks.get(&entry.task_id) {
            Some(current) if !entry.status.may_replace(current.status) => Ok(()),
            _ => {
                inner.tasks.insert(entry.task_id, entry.clone());
                inner.notify(&entry);
                Ok(())
            }
        }
    }

    async fn task_update(
        &self,
        task_id: TaskId,
        expected: &[TaskStatus],
        new: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("meta store lock");
        let Some(entry) = inner.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if !expected.contains(&entry.status) {
            return Ok(false);
        }
        entry.status = new;
        entry.updated_at = Utc::now().timestamp();
        let entry = entry.clone();
        inner.notify(&entry);
        Ok(true)
    }

    async fn task_get(&self, task_id: TaskId) -> Result<Option<TaskTableEntry>, StoreError> {
        let inner = self.inner.lock().expect("meta store lock");
        Ok(inner.tasks.get(&task_id).cloned())
    }

    async fn object_add(
        &self,
        oid: ObjectId,
        node: NodeId,
        _size: u64,
        _hash: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("meta store lock");
        let locations = inner.locations.entry(oid).or_default();
        if !locations.contains(&node) {
            locations.push(node);
        }
        Ok(())
    }

    async fn object_remove(&self, oid: ObjectId, node: NodeId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("meta store lock");
        if let Some(locations) = inner.locations.get_mut(&oid) {
            locations.retain(|n| *n != node);
        }
        Ok(())
    }

    async fn object_lookup(&self, oid: ObjectId) -> Result<Vec<NodeId>, StoreError> {
        let inner = self.inner.lock().expect("meta store lock");
        Ok(inner.locations.get(&oid).cloned().unwrap_or_default())
    }

    async fn subscribe(
        &self,
        node: NodeId,
    ) -> Result<mpsc::UnboundedReceiver<TaskTableEntry>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("meta store lock");
        inner.subscribers.entry(node).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::ResourceVector;

    fn spec(payload: &[u8]) -> TaskSpec {
        TaskSpec::new(payload.to_vec(), vec![], 1, ResourceVector::new(1, 0), None)
    }

    fn node(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; taskforge_core::ID_LEN])
    }

    #[tokio::test]
    async fn cas_has_a_single_winner() {
        let store = MemoryMetaStore::new();
        let entry = TaskTableEntry::new(spec(b"t"), TaskStatus::Done, node(1));
        let task_id = entry.task_id;
        store.task_add(entry).await.expect("add");

        let first = store
            .task_update(task_id, &[TaskStatus::Done], TaskStatus::Waiting)
            .await
            .expect("update");
        let second = store
            .task_update(task_id, &[TaskStatus::Done], TaskStatus::Waiting)
            .await
            .expect("update");

        assert!(first);
        assert!(!second);
        let status = store.task_get(task_id).await.expect("get").expect("entry").status;
        assert_eq!(status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn blind_writes_resolve_by_precedence() {
        let store = MemoryMetaStore::new();
        let running = TaskTableEntry::new(spec(b"t"), TaskStatus::Running, node(1));
        let task_id = running.task_id;
        store.task_add(running.clone()).await.expect("add");

        // A stale WAITING write must not regress the record.
        let stale = TaskTableEntry::new(spec(b"t"), TaskStatus::Waiting, node(2));
        store.task_add(stale).await.expect("add");
        let entry = store.task_get(task_id).await.expect("get").expect("entry");
        assert_eq!(entry.status, TaskStatus::Running);
        assert_eq!(entry.owner, node(1));

        // LOST supersedes any non-terminal state but never DONE.
        let lost = TaskTableEntry::new(spec(b"t"), TaskStatus::Lost, node(2));
        store.task_add(lost.clone()).await.expect("add");
        let status = store.task_get(task_id).await.expect("get").expect("entry").status;
        assert_eq!(status, TaskStatus::Lost);

        store
            .task_update(task_id, &[TaskStatus::Lost], TaskStatus::Done)
            .await
            .expect("update");
        store.task_add(lost).await.expect("add");
        let status = store.task_get(task_id).await.expect("get").expect("entry").status;
        assert_eq!(status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn subscriptions_are_scoped_to_the_owner_node() {
        let store = MemoryMetaStore::new();
        let mut mine = store.subscribe(node(1)).await.expect("subscribe");
        let mut theirs = store.subscribe(node(2)).await.expect("subscribe");

        let entry = TaskTableEntry::new(spec(b"t"), TaskStatus::Waiting, node(1));
        store.task_add(entry.clone()).await.expect("add");

        let seen = mine.recv().await.expect("notification");
        assert_eq!(seen.task_id, entry.task_id);
        assert_eq!(seen.status, TaskStatus::Waiting);
        assert!(theirs.try_recv().is_err());
    }

    #[tokio::test]
    async fn object_locations_add_remove_lookup() {
        let store = MemoryMetaStore::new();
        let oid = ObjectId::from_bytes([3; taskforge_core::ID_LEN]);

        store.object_add(oid, node(1), 64, 0).await.expect("add");
        store.object_add(oid, node(1), 64, 0).await.expect("idempotent add");
        store.object_add(oid, node(2), 64, 0).await.expect("add");
        assert_eq!(
            store.object_lookup(oid).await.expect("lookup"),
            vec![node(1), node(2)]
        );

        store.object_remove(oid, node(1)).await.expect("remove");
        assert_eq!(store.object_lookup(oid).await.expect("lookup"), vec![node(2)]);

        store.object_remove(oid, node(2)).await.expect("remove");
        assert!(store.object_lookup(oid).await.expect("lookup").is_empty());
    }
}
