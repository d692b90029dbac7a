//! The in-memory task list the UI renders, with optimistic mutations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::HttpTransport;
use crate::capabilities::kv::KeyValueStore;
use crate::connectivity::ConnectivityMonitor;
use crate::model::{
    timestamp_now, ClientId, DeleteTarget, NewTask, PendingOp, PendingOperation, Task, TaskId,
    ViewItem,
};
use crate::outbox::{PendingStore, PendingStoreError};
use crate::remote::TaskApi;
use crate::request_cache::{CacheError, RequestCache};

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("pending store: {0}")]
    Pending(#[from] PendingStoreError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// Server tasks with the queued operations laid over them, in queue order.
///
/// Creates become pending items ahead of the server tasks, updates replace
/// the matching item's fields and deletes hide it. Items are matched by id,
/// so an item is never shown twice however the sources overlap.
pub fn merge_view(server: &[Task], pending: &[PendingOperation]) -> Vec<ViewItem> {
    let mut created: Vec<ViewItem> = Vec::new();
    let mut confirmed: Vec<ViewItem> = server.iter().cloned().map(ViewItem::Confirmed).collect();

    for operation in pending {
        match &operation.op {
            PendingOp::Create(new_task) => {
                let local_id = TaskId::local(&operation.client_id);
                if created
                    .iter()
                    .chain(&confirmed)
                    .all(|item| item.id() != Some(&local_id))
                {
                    created.push(ViewItem::Pending {
                        client_id: operation.client_id.clone(),
                        task: new_task.clone().into_local_task(&operation.client_id),
                    });
                }
            }
            PendingOp::Update(update) => {
                let Some(id) = update.id.as_ref() else {
                    continue;
                };
                if let Some(item) = created
                    .iter_mut()
                    .chain(confirmed.iter_mut())
                    .find(|item| item.id() == Some(id))
                {
                    let task = item.task_mut();
                    task.title.clone_from(&update.title);
                    task.completed = update.completed;
                    task.updated_at.clone_from(&update.updated_at);
                }
            }
            PendingOp::Delete(target) => {
                created.retain(|item| item.id() != Some(&target.id));
                confirmed.retain(|item| item.id() != Some(&target.id));
            }
        }
    }
    created.extend(confirmed);
    created
}

/// Holds the rendered list and applies user mutations to it.
///
/// Every mutation shows up immediately. When online the matching remote
/// call is tried directly; if it fails, or the client is offline, the
/// equivalent operation is queued for the next reconciliation.
pub struct TaskListController<T: HttpTransport + ?Sized, S: KeyValueStore> {
    items: Mutex<Vec<ViewItem>>,
    pending: Arc<PendingStore<S>>,
    api: TaskApi<T>,
    cache: Arc<RequestCache<T, S>>,
    connectivity: Arc<ConnectivityMonitor>,
}

impl<T: HttpTransport + ?Sized, S: KeyValueStore> TaskListController<T, S> {
    pub fn new(
        pending: Arc<PendingStore<S>>,
        api: TaskApi<T>,
        cache: Arc<RequestCache<T, S>>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            pending,
            api,
            cache,
            connectivity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ViewItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn items(&self) -> Vec<ViewItem> {
        self.lock().clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().iter().map(|item| item.task().clone()).collect()
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.lock()
            .iter()
            .find(|item| item.id() == Some(id))
            .map(|item| item.task().clone())
    }

    /// First paint: the cached server list plus everything still queued.
    /// Touches no network.
    #[instrument(skip(self))]
    pub async fn load_initial(&self) -> Result<Vec<ViewItem>, ViewError> {
        let queue = self.pending.list_all().await?;
        let cached = self.cache.cached_tasks().await?.unwrap_or_default();
        debug!(cached = cached.len(), pending = queue.len(), "initial view");
        Ok(self.replace(merge_view(&cached, &queue)))
    }

    /// Rebuilds the view from a fresh server list and the current queue.
    pub async fn apply_server_list(&self, tasks: &[Task]) -> Result<Vec<ViewItem>, ViewError> {
        let queue = self.pending.list_all().await?;
        Ok(self.replace(merge_view(tasks, &queue)))
    }

    fn replace(&self, items: Vec<ViewItem>) -> Vec<ViewItem> {
        let mut current = self.lock();
        *current = items;
        current.clone()
    }

    /// Adds a task titled `title` (trimmed). A blank title does nothing and
    /// returns `None`; otherwise the returned id is the server's when the
    /// direct create went through, else the local one.
    #[instrument(skip(self, title))]
    pub async fn add_task(&self, title: &str) -> Result<Option<TaskId>, ViewError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }

        let client_id = ClientId::generate();
        let new_task = NewTask {
            title: title.to_string(),
            completed: false,
            updated_at: timestamp_now(),
        };
        let local_id = TaskId::local(&client_id);
        self.lock().insert(
            0,
            ViewItem::Pending {
            client_id: client_id.clone(),
                task: new_task.clone().into_local_task(&client_id),
            },
        );

        if self.connectivity.is_online() {
            match self.api.create(&new_task).await {
                Ok(Some(created)) if created.id.is_some() => {
                    return self.confirm_created(&client_id, created).await.map(Some);
                }
                Ok(_) => {
                    warn!(%client_id, "create accepted without an id, next refresh settles it");
                    return Ok(Some(local_id));
                }
                Err(e) => warn!(%client_id, error = %e, "direct create failed, queueing"),
            }
        }

        self.pending
            .append_with_id(client_id, PendingOp::Create(new_task))
            .await?;
        Ok(Some(local_id))
    }

    /// Swaps the optimistic item for the server's task and points anything
    /// queued against the local id at the server id.
    async fn confirm_created(
        &self,
        client_id: &ClientId,
        created: Task,
    ) -> Result<TaskId, ViewError> {
        let local_id = TaskId::local(client_id);
        let server_id = created.id.clone().ok_or(ViewError::UnknownTask(local_id.clone()))?;

        let retargeted = self.pending.resolve_create(client_id, &server_id).await?;
        {
            let mut items = self.lock();
            if let Some(item) = items.iter_mut().find(|item| item.id() == Some(&local_id)) {
                let mut confirmed = created;
                if retargeted > 0 {
                    // Edits made while the create was in flight are queued;
                    // keep showing them.
                    let current = item.task();
                    confirmed.title.clone_from(&current.title);
                    confirmed.completed = current.completed;
                    confirmed.updated_at.clone_from(&current.updated_at);
                }
                *item = ViewItem::Confirmed(confirmed);
            }
        }
        info!(%client_id, %server_id, "task created");
        Ok(server_id)
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn toggle_task(&self, id: &TaskId) -> Result<Task, ViewError> {
        let updated = self.modify(id, |task| task.completed = !task.completed)?;
        self.push_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Renames to `title` (trimmed). A blank title changes nothing.
    #[instrument(skip(self, title), fields(id = %id))]
    pub async fn rename_task(&self, id: &TaskId, title: &str) -> Result<Option<Task>, ViewError> {
        let title = title.trim();
        if title.is_empty() {
            return Ok(None);
        }
        let updated = self.modify(id, |task| task.title = title.to_string())?;
        self.push_update(updated.clone()).await?;
        Ok(Some(updated))
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), ViewError> {
        {
            let mut items = self.lock();
            let before = items.len();
            items.retain(|item| item.id() != Some(id));
            if items.len() == before {
                return Err(ViewError::UnknownTask(id.clone()));
            }
        }

        if !id.is_local() && self.connectivity.is_online() {
            match self.api.delete(id).await {
                Ok(outcome) => {
                    debug!(?outcome, "deleted on server");
                    return Ok(());
                }
                Err(e) => warn!(error = %e, "direct delete failed, queueing"),
            }
        }

        self.pending
            .append(PendingOp::Delete(DeleteTarget { id: id.clone() }))
            .await?;
        Ok(())
    }

    fn modify(&self, id: &TaskId, change: impl FnOnce(&mut Task)) -> Result<Task, ViewError> {
        let mut items = self.lock();
        let item = items
            .iter_mut()
            .find(|item| item.id() == Some(id))
            .ok_or_else(|| ViewError::UnknownTask(id.clone()))?;
        let task = item.task_mut();
        change(task);
        task.updated_at = timestamp_now();
        Ok(task.clone())
    }

    async fn push_update(&self, task: Task) -> Result<(), ViewError> {
        let local = task.id.as_ref().map_or(true, TaskId::is_local);
        if !local && self.connectivity.is_online() {
            match self.api.replace(&task).await {
                Ok(_) => return Ok(()),
                Err(e) => warn!(error = %e, "direct update failed, queueing"),
            }
        }

        let mut queued = task;
        queued.local_only = false;
        self.pending.append(PendingOp::Update(queued)).await?;
        Ok(())
    }
}
