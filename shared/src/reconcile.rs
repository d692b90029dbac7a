use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::HttpTransport;
use crate::capabilities::kv::KeyValueStore;
use crate::connectivity::ConnectivityMonitor;
use crate::model::{PendingOp, PendingOperation, Task, TaskId};
use crate::outbox::{PendingStore, PendingStoreError};
use crate::remote::{parse_tasks, DeleteOutcome, RemoteError, TaskApi};
use crate::request_cache::RequestCache;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Remote calls attempted.
    pub submitted: usize,
    /// Operations acknowledged and removed from the queue.
    pub drained: usize,
    /// Operations still queued afterwards.
    pub remaining: usize,
    /// Fresh server list; `None` when the refresh failed.
    pub tasks: Option<Vec<Task>>,
    /// Nothing was attempted because the client was offline.
    pub skipped: bool,
}

impl ReconcileReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    #[error("pending store failure: {0}")]
    PendingStore(Arc<PendingStoreError>),

    #[error("reconciliation was abandoned before it finished")]
    Abandoned,
}

impl From<PendingStoreError> for ReconcileError {
    fn from(e: PendingStoreError) -> Self {
        ReconcileError::PendingStore(Arc::new(e))
    }
}

type Outcome = Option<Result<ReconcileReport, ReconcileError>>;

enum Submission {
    Acknowledged,
    Created(Option<TaskId>),
    Kept,
}

/// Drains the pending queue against the server and refreshes the cached
/// task list.
///
/// At most one attempt runs at a time; callers arriving while one is in
/// flight wait for it and share its result.
pub struct Reconciler<T: HttpTransport + ?Sized, S: KeyValueStore> {
    pending: Arc<PendingStore<S>>,
    api: TaskApi<T>,
    cache: Arc<RequestCache<T, S>>,
    connectivity: Arc<ConnectivityMonitor>,
    in_flight: Mutex<Option<watch::Receiver<Outcome>>>,
}

enum Role {
    Leader(watch::Sender<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

struct InFlightSlot<'a> {
    slot: &'a Mutex<Option<watch::Receiver<Outcome>>>,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<T: HttpTransport + ?Sized, S: KeyValueStore> Reconciler<T, S> {
    pub fn new(
        pending: Arc<PendingStore<S>>,
        api: TaskApi<T>,
        cache: Arc<RequestCache<T, S>>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            pending,
            api,
            cache,
            connectivity,
            in_flight: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let role = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                debug!("joining reconciliation in flight");
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone(),
                    Err(_) => None,
                };
                outcome.unwrap_or(Err(ReconcileError::Abandoned))
            }
            Role::Leader(tx) => {
                let _slot = InFlightSlot {
                    slot: &self.in_flight,
                };
                let outcome = self.run().await;
                tx.send_replace(Some(outcome.clone()));
                outcome
            }
        }
    }

    #[instrument(skip(self))]
    async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        if !self.connectivity.is_online() {
            debug!("offline, nothing to do");
            return Ok(ReconcileReport::skipped());
        }
        let _syncing = self.connectivity.begin_sync();

        let queue = self.pending.list_all().await?;
        let mut report = ReconcileReport::default();
        let mut resolved: HashMap<TaskId, TaskId> = HashMap::new();
        // Targets with an earlier op still queued; later ops on them wait.
        let mut blocked: HashSet<TaskId> = HashSet::new();

        for operation in &queue {
            match self
                .submit(operation, &resolved, &blocked, &mut report)
                .await
            {
                Submission::Acknowledged => {
                    self.pending.remove(&operation.client_id).await?;
                    report.drained += 1;
                }
                Submission::Created(Some(server_id)) => {
                    self.pending
                        .resolve_create(&operation.client_id, &server_id)
                        .await?;
                    resolved.insert(TaskId::local(&operation.client_id), server_id);
                    report.drained += 1;
                }
                Submission::Created(None) => {
                    warn!(client_id = %operation.client_id, "create accepted without an id");
                    self.pending.remove(&operation.client_id).await?;
                    report.drained += 1;
                }
                Submission::Kept => {
                    let target = match &operation.op {
                        PendingOp::Create(_) => Some(TaskId::local(&operation.client_id)),
                        other => other.target().cloned(),
                    };
                    if let Some(target) = target {
                        blocked.insert(target);
                    }
                }
            }
        }

        report.tasks = self.refresh().await;
        report.remaining = self.pending.len().await?;
        info!(
            submitted = report.submitted,
            drained = report.drained,
            remaining = report.remaining,
            refreshed = report.tasks.is_some(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn submit(
        &self,
        operation: &PendingOperation,
        resolved: &HashMap<TaskId, TaskId>,
        blocked: &HashSet<TaskId>,
        report: &mut ReconcileReport,
    ) -> Submission {
        let client_id = &operation.client_id;

        let target = match operation.op.target() {
            Some(id) if id.is_local() => match resolved.get(id) {
                Some(server_id) => Some(server_id.clone()),
                None => {
                    debug!(%client_id, target = %id, "target not created on the server yet");
                    return Submission::Kept;
                }
            },
            other => other.cloned(),
        };
        if let Some(id) = &target {
            if blocked.contains(id) {
                debug!(%client_id, target = %id, "earlier operation on target still queued");
                return Submission::Kept;
            }
        }

        report.submitted += 1;
        let result = match &operation.op {
            PendingOp::Create(new_task) => self
                .api
                .create(new_task)
                .await
                .map(|task| Submission::Created(task.and_then(|t| t.id))),
            PendingOp::Update(task) => {
                let mut task = task.clone();
                task.id = target;
                self.api
                    .replace(&task)
                    .await
                    .map(|_| Submission::Acknowledged)
            }
            PendingOp::Delete(_) => match &target {
                Some(id) => self.api.delete(id).await.map(|outcome| {
                    if outcome == DeleteOutcome::AlreadyGone {
                        debug!(%client_id, "delete target already gone");
                    }
                    Submission::Acknowledged
                }),
                None => Err(RemoteError::MissingId),
            },
        };

        result.unwrap_or_else(|e| {
            warn!(
                %client_id,
                op = operation.kind().as_str(),
                error = %e,
                retryable = e.is_retryable(),
                "operation stays queued"
            );
            Submission::Kept
        })
    }

    async fn refresh(&self) -> Option<Vec<Task>> {
        let response = match self.api.list().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "refresh failed, view left as is");
                return None;
            }
        };
        let tasks = match parse_tasks(&response) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "refresh returned an unreadable list");
                return None;
            }
        };
        if let Err(e) = self.cache.put_tasks(&response).await {
            warn!(error = %e, "failed to update cached task list");
        }
        Some(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::http::HttpMethod;
    use crate::capabilities::kv::MemoryKvStore;
    use crate::connectivity::SyncStatus;
    use crate::model::{ClientId, DeleteTarget, NewTask};
    use crate::testing::{Failure, FakeRemote};
    use std::time::Duration;

    struct Harness {
        remote: Arc<FakeRemote>,
        pending: Arc<PendingStore<MemoryKvStore>>,
        cache: Arc<RequestCache<FakeRemote, MemoryKvStore>>,
        connectivity: Arc<ConnectivityMonitor>,
        reconciler: Arc<Reconciler<FakeRemote, MemoryKvStore>>,
    }

    fn harness_with(request_timeout_ms: u64) -> Harness {
        let remote = Arc::new(FakeRemote::new());
        let config = crate::config::SyncConfig {
            request_timeout_ms,
            ..remote.config()
        };
        let storage = Arc::new(MemoryKvStore::new());
        let pending = Arc::new(PendingStore::with_default_capacity(storage.clone()).unwrap());
        let cache = Arc::new(RequestCache::new(remote.clone(), storage, &config).unwrap());
        let connectivity = Arc::new(ConnectivityMonitor::new(true));
        let reconciler = Arc::new(Reconciler::new(
            pending.clone(),
            TaskApi::new(remote.clone(), &config),
            cache.clone(),
            connectivity.clone(),
        ));
        Harness {
            remote,
            pending,
            cache,
            connectivity,
            reconciler,
        }
    }

    fn harness() -> Harness {
        harness_with(30_000)
    }

    fn create(title: &str) -> PendingOp {
        PendingOp::Create(NewTask {
            title: title.into(),
            completed: false,
            updated_at: "2024-05-01T10:00:00.000Z".into(),
        })
    }

    fn update(id: TaskId, completed: bool) -> PendingOp {
        PendingOp::Update(Task {
            id: Some(id),
            title: "t".into(),
            completed,
            updated_at: "2024-05-01T10:00:00.000Z".into(),
            local_only: false,
        })
    }

    fn delete(id: TaskId) -> PendingOp {
        PendingOp::Delete(DeleteTarget { id })
    }

    #[tokio::test]
    async fn offline_returns_immediately() {
        let h = harness();
        h.connectivity.set_online(false);
        h.pending.append(create("a")).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert!(report.skipped);
        assert!(h.remote.requests().is_empty());
        assert_eq!(h.pending.len().await.unwrap(), 1);
        assert_eq!(h.connectivity.status(), SyncStatus::IdleOffline);
    }

    #[tokio::test]
    async fn failed_update_stays_queued_after_successful_create() {
        let h = harness();
        h.remote.set_next_id(7);
        h.remote.fail_method(HttpMethod::Put, Failure::Network);
        h.pending.append(create("buy milk")).await.unwrap();
        let update_id = h.pending.append(update(TaskId::Number(5), true)).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();

        let queue = h.pending.list_all().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].client_id, update_id);
        assert_eq!(queue[0].op.target(), Some(&TaskId::Number(5)));

        assert_eq!(report.submitted, 2);
        assert_eq!(report.drained, 1);
        assert_eq!(report.remaining, 1);
        let tasks = report.tasks.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, Some(TaskId::Number(7)));
        assert_eq!(tasks[0].title, "buy milk");
    }

    #[tokio::test]
    async fn double_delete_drains_cleanly() {
        let h = harness();
        let task = h.remote.insert_task("gone soon", false);
        let id = task.id.unwrap();
        h.pending.append(delete(id.clone())).await.unwrap();
        h.pending.append(delete(id)).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.drained, 2);
        assert!(h.pending.is_empty().await.unwrap());
        assert!(h.remote.tasks().is_empty());
        assert_eq!(report.tasks, Some(Vec::new()));
    }

    #[tokio::test]
    async fn followups_on_local_id_use_the_created_server_id() {
        let h = harness();
        let client_id = ClientId::new("p_local1").unwrap();
        h.pending
            .append_with_id(client_id.clone(), create("draft"))
            .await
            .unwrap();
        h.pending
            .append(update(TaskId::local(&client_id), true))
            .await
            .unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.drained, 2);
        assert!(h.pending.is_empty().await.unwrap());
        assert!(h
            .remote
            .requests()
            .iter()
            .all(|r| !r.url.contains("p_local1")));
        assert!(h.remote.tasks()[0].completed);
    }

    #[tokio::test]
    async fn orphaned_local_update_is_never_sent() {
        let h = harness();
        h.pending
            .append(update(TaskId::from("p_unknown"), true))
            .await
            .unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.remaining, 1);
        assert_eq!(h.remote.count(HttpMethod::Put), 0);
    }

    #[tokio::test]
    async fn later_ops_wait_behind_a_failed_op_on_the_same_task() {
        let h = harness();
        let task = h.remote.insert_task("x", false);
        let id = task.id.unwrap();
        h.remote.fail_next(HttpMethod::Put, Failure::Status(503));
        h.pending.append(update(id.clone(), true)).await.unwrap();
        h.pending.append(update(id.clone(), false)).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.remaining, 2);
        assert_eq!(h.remote.count(HttpMethod::Put), 1);

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.remaining, 0);
        assert!(!h.remote.tasks()[0].completed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_attempt() {
        let h = harness();
        h.remote.set_latency(Duration::from_millis(50));
        h.pending.append(create("once")).await.unwrap();

        let (a, b) = tokio::join!(h.reconciler.reconcile(), h.reconciler.reconcile());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(h.remote.count(HttpMethod::Post), 1);
        assert_eq!(h.remote.tasks().len(), 1);
        assert!(!h.reconciler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_leave_ops_queued() {
        let h = harness_with(1_000);
        h.remote.set_latency(Duration::from_secs(5));
        h.pending.append(create("slow")).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.drained, 0);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.tasks, None);
    }

    #[tokio::test]
    async fn refresh_replaces_cached_list() {
        let h = harness();
        h.remote.insert_task("from server", false);

        h.reconciler.reconcile().await.unwrap();

        let cached = h.cache.cached_tasks().await.unwrap().unwrap();
        assert_eq!(cached[0].title, "from server");
    }

    #[tokio::test]
    async fn failed_refresh_keeps_drained_ops_removed() {
        let h = harness();
        h.remote.fail_method(HttpMethod::Get, Failure::Status(500));
        h.pending.append(create("a")).await.unwrap();

        let report = h.reconciler.reconcile().await.unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.tasks, None);
        assert!(h.pending.is_empty().await.unwrap());
        assert_eq!(h.cache.cached_tasks().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_syncing_while_in_flight() {
        let h = harness();
        h.remote.set_latency(Duration::from_millis(100));

        let reconciler = h.reconciler.clone();
        let handle = tokio::spawn(async move { reconciler.reconcile().await });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.connectivity.status(), SyncStatus::Syncing);

        handle.await.unwrap().unwrap();
        assert_eq!(h.connectivity.status(), SyncStatus::IdleOnline);
    }
}
