//! Durable write-ahead queue of task mutations the server has not
//! acknowledged yet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, TypedKvStore};
use crate::model::{ClientId, PendingOp, PendingOperation, TaskId};

pub const DEFAULT_MAX_PENDING_OPERATIONS: usize = 10_000;
const QUEUE_KEY: &str = "queue";

#[derive(Debug, Error)]
pub enum PendingStoreError {
    #[error("pending queue is full ({0} operations)")]
    Full(usize),

    #[error("client id already queued: {0}")]
    DuplicateClientId(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Default)]
pub struct PendingMetrics {
    pub appended: AtomicU64,
    pub removed: AtomicU64,
    pub retargeted: AtomicU64,
    pub duplicate_rejections: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl PendingMetrics {
    pub fn snapshot(&self) -> PendingMetricsSnapshot {
        PendingMetricsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            retargeted: self.retargeted.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingMetricsSnapshot {
    pub appended: u64,
    pub removed: u64,
    pub retargeted: u64,
    pub duplicate_rejections: u64,
    pub storage_errors: u64,
}

/// Ordered queue of [`PendingOperation`]s persisted as a single value.
///
/// Every read-modify-write runs under one async mutex, so concurrent
/// appends and removals never lose each other's writes. Nothing is cached in
/// memory: the backing store is the only copy.
pub struct PendingStore<S: KeyValueStore> {
    storage: Arc<S>,
    queue: TypedKvStore<Vec<PendingOperation>>,
    max_operations: usize,
    write_lock: Mutex<()>,
    metrics: PendingMetrics,
}

impl<S: KeyValueStore> PendingStore<S> {
    pub fn new(storage: Arc<S>, max_operations: usize) -> Result<Self, PendingStoreError> {
        if max_operations == 0 {
            return Err(PendingStoreError::Validation(
                "max_operations must be > 0".into(),
            ));
        }
        let key = KvKey::new(KeyNamespace::Pending, QUEUE_KEY)?;
        Ok(Self {
            storage,
            queue: TypedKvStore::new(key),
            max_operations,
            write_lock: Mutex::new(()),
            metrics: PendingMetrics::default(),
        })
    }

    pub fn with_default_capacity(storage: Arc<S>) -> Result<Self, PendingStoreError> {
        Self::new(storage, DEFAULT_MAX_PENDING_OPERATIONS)
    }

    /// Queues `op` under a freshly generated client id.
    #[instrument(skip(self, op), fields(op = op.kind().as_str()))]
    pub async fn append(&self, op: PendingOp) -> Result<ClientId, PendingStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut queue = self.load().await?;

        let mut client_id = ClientId::generate();
        while queue.iter().any(|queued| queued.client_id == client_id) {
            client_id = ClientId::generate();
        }

        self.push_locked(&mut queue, PendingOperation::new(client_id.clone(), op))
            .await?;
        Ok(client_id)
    }

    /// Queues `op` under a client id the caller already handed out, such as
    /// the id of an optimistic item.
    ///
    /// A create lands ahead of any operation already aimed at its local id:
    /// an edit made while the create was in flight still follows it.
    #[instrument(skip(self, op), fields(client_id = %client_id, op = op.kind().as_str()))]
    pub async fn append_with_id(
        &self,
        client_id: ClientId,
        op: PendingOp,
    ) -> Result<(), PendingStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut queue = self.load().await?;

        if queue.iter().any(|queued| queued.client_id == client_id) {
            self.metrics
                .duplicate_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(PendingStoreError::DuplicateClientId(client_id.to_string()));
        }

        let position = match &op {
            PendingOp::Create(_) => {
                let local_id = TaskId::local(&client_id);
                queue
                    .iter()
                    .position(|queued| queued.op.target() == Some(&local_id))
            }
            _ => None,
        };
        self.insert_locked(&mut queue, position, PendingOperation::new(client_id, op))
            .await
    }

    async fn push_locked(
        &self,
        queue: &mut Vec<PendingOperation>,
        operation: PendingOperation,
    ) -> Result<(), PendingStoreError> {
        self.insert_locked(queue, None, operation).await
    }

    async fn insert_locked(
        &self,
        queue: &mut Vec<PendingOperation>,
        position: Option<usize>,
        operation: PendingOperation,
    ) -> Result<(), PendingStoreError> {
        if queue.len() >= self.max_operations {
            return Err(PendingStoreError::Full(self.max_operations));
        }
        match position {
            Some(index) => queue.insert(index, operation),
            None => queue.push(operation),
        }
        self.save(queue).await?;

        self.metrics.appended.fetch_add(1, Ordering::Relaxed);
        info!(depth = queue.len(), "pending operation queued");
        Ok(())
    }

    /// Drops the operation with `client_id`. Removing an id that is not
    /// queued succeeds and reports `false`.
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn remove(&self, client_id: &ClientId) -> Result<bool, PendingStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut queue = self.load().await?;

        let before = queue.len();
        queue.retain(|queued| &queued.client_id != client_id);
        if queue.len() == before {
            debug!("operation already gone");
            return Ok(false);
        }

        self.save(&queue).await?;
        self.metrics.removed.fetch_add(1, Ordering::Relaxed);
        info!(depth = queue.len(), "pending operation removed");
        Ok(true)
    }

    /// Settles an acknowledged create in one write: the create is dropped and
    /// every queued update or delete aimed at its local id is pointed at
    /// `server_id` instead. Returns how many operations were retargeted.
    #[instrument(skip(self), fields(client_id = %client_id, server_id = %server_id))]
    pub async fn resolve_create(
        &self,
        client_id: &ClientId,
        server_id: &TaskId,
    ) -> Result<usize, PendingStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut queue = self.load().await?;

        let local_id = TaskId::local(client_id);
        let before = queue.len();
        queue.retain(|queued| &queued.client_id != client_id);
        let removed = before - queue.len();

        let mut retargeted = 0;
        for queued in queue.iter_mut() {
            let target = match &mut queued.op {
                PendingOp::Create(_) => None,
                PendingOp::Update(task) => task.id.as_mut(),
                PendingOp::Delete(target) => Some(&mut target.id),
            };
            if let Some(id) = target {
                if *id == local_id {
                    *id = server_id.clone();
                    retargeted += 1;
                }
            }
        }

        if removed == 0 && retargeted == 0 {
            return Ok(0);
        }

        self.save(&queue).await?;
        self.metrics
            .removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        self.metrics
            .retargeted
            .fetch_add(retargeted as u64, Ordering::Relaxed);
        info!(retargeted, depth = queue.len(), "create settled");
        Ok(retargeted)
    }

    /// Snapshot of the queue, oldest first.
    pub async fn list_all(&self) -> Result<Vec<PendingOperation>, PendingStoreError> {
        let _guard = self.write_lock.lock().await;
        self.load().await
    }

    pub async fn len(&self) -> Result<usize, PendingStoreError> {
        Ok(self.list_all().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, PendingStoreError> {
        Ok(self.len().await? == 0)
    }

    pub fn capacity(&self) -> usize {
        self.max_operations
    }

    pub fn metrics(&self) -> PendingMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn load(&self) -> Result<Vec<PendingOperation>, PendingStoreError> {
        match self.queue.load(self.storage.as_ref()).await {
            Ok(queue) => Ok(queue.unwrap_or_default()),
            Err(e) => {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "failed to read pending queue");
                Err(e.into())
            }
        }
    }

    #[allow(clippy::ptr_arg)]
    async fn save(&self, queue: &Vec<PendingOperation>) -> Result<(), PendingStoreError> {
        if let Err(e) = self.queue.save(self.storage.as_ref(), queue).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to persist pending queue");
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKvStore;
    use crate::model::{DeleteTarget, NewTask, Task};
    use crate::testing::FailingKvStore;

    fn new_task(title: &str) -> PendingOp {
        PendingOp::Create(NewTask {
            title: title.into(),
            completed: false,
            updated_at: "2024-05-01T10:00:00.000Z".into(),
        })
    }

    fn update(id: TaskId) -> PendingOp {
        PendingOp::Update(Task {
            id: Some(id),
            title: "t".into(),
            completed: true,
            updated_at: "2024-05-01T10:00:00.000Z".into(),
            local_only: false,
        })
    }

    fn store() -> PendingStore<MemoryKvStore> {
        PendingStore::with_default_capacity(Arc::new(MemoryKvStore::new())).unwrap()
    }

    #[tokio::test]
    async fn append_preserves_insertion_order() {
        let store = store();
        let a = store.append(new_task("a")).await.unwrap();
        let b = store.append(update(TaskId::Number(5))).await.unwrap();
        let c = store
            .append(PendingOp::Delete(DeleteTarget { id: TaskId::Number(6) }))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.client_id)
            .collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = store();
        let id = store.append(new_task("a")).await.unwrap();

        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(store.is_empty().await.unwrap());

        let metrics = store.metrics();
        assert_eq!(metrics.appended, 1);
        assert_eq!(metrics.removed, 1);
    }

    #[tokio::test]
    async fn duplicate_client_id_rejected() {
        let store = store();
        let id = ClientId::new("p_fixed").unwrap();
        store.append_with_id(id.clone(), new_task("a")).await.unwrap();

        let result = store.append_with_id(id, new_task("b")).await;
        assert!(matches!(result, Err(PendingStoreError::DuplicateClientId(_))));
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.metrics().duplicate_rejections, 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let store = PendingStore::new(Arc::new(MemoryKvStore::new()), 2).unwrap();
        store.append(new_task("a")).await.unwrap();
        store.append(new_task("b")).await.unwrap();

        let result = store.append(new_task("c")).await;
        assert!(matches!(result, Err(PendingStoreError::Full(2))));
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let result = PendingStore::new(Arc::new(MemoryKvStore::new()), 0);
        assert!(matches!(result, Err(PendingStoreError::Validation(_))));
    }

    #[tokio::test]
    async fn resolve_create_retargets_followups() {
        let store = store();
        let create_id = ClientId::new("p_local1").unwrap();
        store
            .append_with_id(create_id.clone(), new_task("a"))
            .await
            .unwrap();
        store
            .append(update(TaskId::local(&create_id)))
            .await
            .unwrap();
        store
            .append(PendingOp::Delete(DeleteTarget {
                id: TaskId::local(&create_id),
            }))
            .await
            .unwrap();
        store.append(update(TaskId::Number(99))).await.unwrap();

        let retargeted = store
            .resolve_create(&create_id, &TaskId::Number(7))
            .await
            .unwrap();
        assert_eq!(retargeted, 2);

        let queue = store.list_all().await.unwrap();
        assert_eq!(queue.len(), 3);
        let targets: Vec<_> = queue.iter().filter_map(|op| op.op.target()).collect();
        assert_eq!(
            targets,
            vec![&TaskId::Number(7), &TaskId::Number(7), &TaskId::Number(99)]
        );
    }

    #[tokio::test]
    async fn late_create_goes_ahead_of_its_edits() {
        let store = store();
        let create_id = ClientId::new("p_late1").unwrap();
        let other = store.append(update(TaskId::Number(3))).await.unwrap();
        let edit = store
            .append(update(TaskId::local(&create_id)))
            .await
            .unwrap();

        store
            .append_with_id(create_id.clone(), new_task("late"))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.client_id)
            .collect();
        assert_eq!(ids, vec![other, create_id, edit]);
    }

    #[tokio::test]
    async fn queue_survives_new_store_instance() {
        let backing = Arc::new(MemoryKvStore::new());
        let id = {
            let store = PendingStore::with_default_capacity(backing.clone()).unwrap();
            store.append(new_task("durable")).await.unwrap()
        };

        let reopened = PendingStore::with_default_capacity(backing).unwrap();
        let queue = reopened.list_all().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].client_id, id);
    }

    #[tokio::test]
    async fn corrupted_queue_is_an_error_not_empty() {
        let backing = Arc::new(MemoryKvStore::new());
        let key = KvKey::new(KeyNamespace::Pending, QUEUE_KEY).unwrap();
        backing.set(&key, b"{broken".to_vec()).await.unwrap();

        let store = PendingStore::with_default_capacity(backing).unwrap();
        let result = store.list_all().await;
        assert!(matches!(
            result,
            Err(PendingStoreError::Storage(KvError::Serialization { .. }))
        ));
        assert_eq!(store.metrics().storage_errors, 1);
    }

    #[tokio::test]
    async fn storage_failure_propagates_and_leaves_queue_intact() {
        let backing = Arc::new(FailingKvStore::new(MemoryKvStore::new()));
        let store = PendingStore::with_default_capacity(backing.clone()).unwrap();
        store.append(new_task("kept")).await.unwrap();

        backing.set_fail_writes(true);
        let result = store.append(new_task("lost")).await;
        assert!(matches!(result, Err(PendingStoreError::Storage(_))));

        backing.set_fail_writes(false);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_serialized() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.append(new_task(&format!("task {i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.len().await.unwrap(), 20);
    }
}
