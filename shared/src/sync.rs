//! Wires the components into one handle the shell drives.

use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::HttpTransport;
use crate::capabilities::kv::KeyValueStore;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityEdge, ConnectivityMonitor, SyncStatus};
use crate::event::Event;
use crate::model::{Task, ViewItem};
use crate::outbox::PendingStore;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::remote::TaskApi;
use crate::request_cache::RequestCache;
use crate::view::TaskListController;
use crate::SyncError;

/// The offline-capable task list.
///
/// `transport` is the raw network; reads that should go through the cache
/// use [`TaskSync::cache`], which is itself an [`HttpTransport`].
pub struct TaskSync<T: HttpTransport + ?Sized, S: KeyValueStore> {
    config: SyncConfig,
    connectivity: Arc<ConnectivityMonitor>,
    pending: Arc<PendingStore<S>>,
    cache: Arc<RequestCache<T, S>>,
    reconciler: Reconciler<T, S>,
    view: TaskListController<T, S>,
}

impl<T: HttpTransport + ?Sized, S: KeyValueStore> TaskSync<T, S> {
    pub fn new(
        transport: Arc<T>,
        storage: Arc<S>,
        config: SyncConfig,
        initially_online: bool,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let connectivity = Arc::new(ConnectivityMonitor::new(initially_online));
        let pending = Arc::new(PendingStore::new(
            storage.clone(),
            config.max_pending_operations,
        )?);
        let cache = Arc::new(RequestCache::new(transport.clone(), storage, &config)?);
        let reconciler = Reconciler::new(
            pending.clone(),
            TaskApi::new(transport.clone(), &config),
            cache.clone(),
            connectivity.clone(),
        );
        let view = TaskListController::new(
            pending.clone(),
            TaskApi::new(transport, &config),
            cache.clone(),
            connectivity.clone(),
        );

        Ok(Self {
            config,
            connectivity,
            pending,
            cache,
            reconciler,
            view,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn pending(&self) -> &Arc<PendingStore<S>> {
        &self.pending
    }

    pub fn cache(&self) -> &Arc<RequestCache<T, S>> {
        &self.cache
    }

    pub fn view(&self) -> &TaskListController<T, S> {
        &self.view
    }

    pub fn status(&self) -> SyncStatus {
        self.connectivity.status()
    }

    pub fn items(&self) -> Vec<ViewItem> {
        self.view.items()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.view.tasks()
    }

    /// Precaches the app shell into the current generation and drops the
    /// older ones.
    pub async fn install_cache(&self) -> Result<Vec<String>, SyncError> {
        self.cache.install().await?;
        Ok(self.cache.activate().await?)
    }

    /// Paints from the cache and the queue, then reconciles.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<Vec<ViewItem>, SyncError> {
        let initial = self.view.load_initial().await?;
        debug!(items = initial.len(), "initial view ready");
        self.sync_now().await?;
        Ok(self.view.items())
    }

    /// Reconciles and, if a fresh list came back, rebuilds the view from it.
    pub async fn sync_now(&self) -> Result<ReconcileReport, SyncError> {
        let report = self.reconciler.reconcile().await?;
        if let Some(tasks) = &report.tasks {
            self.view.apply_server_list(tasks).await?;
        }
        Ok(report)
    }

    /// Records a connectivity report. Coming back online triggers one
    /// reconciliation, whose report is returned.
    pub async fn set_online(&self, online: bool) -> Result<Option<ReconcileReport>, SyncError> {
        match self.connectivity.set_online(online) {
            Some(ConnectivityEdge::ToOnline) => Ok(Some(self.sync_now().await?)),
            _ => Ok(None),
        }
    }

    pub async fn update(&self, event: Event) -> Result<(), SyncError> {
        if event.is_user_initiated() {
            info!(event = event.name(), "user action");
        } else {
            debug!(event = event.name(), "event");
        }

        match event {
            Event::Started => {
                self.start().await?;
            }
            Event::NetworkStatusChanged { online } => {
                self.set_online(online).await?;
            }
            Event::AddTask { title } => {
                self.view.add_task(&title).await?;
            }
            Event::ToggleTask { id } => {
                self.view.toggle_task(&id).await?;
            }
            Event::RenameTask { id, title } => {
                self.view.rename_task(&id, &title).await?;
            }
            Event::DeleteTask { id } => {
                self.view.delete_task(&id).await?;
            }
            Event::SyncRequested => {
                self.sync_now().await?;
            }
        }
        Ok(())
    }
}

impl<T, S> TaskSync<T, S>
where
    T: HttpTransport + ?Sized + 'static,
    S: KeyValueStore + 'static,
{
    /// Reconciles after connectivity edges, for shells that report
    /// connectivity straight to [`TaskSync::connectivity`].
    ///
    /// Edges that pile up while a reconciliation runs are collapsed: the
    /// listener looks at the state once the backlog is drained and syncs at
    /// most once for it.
    pub fn spawn_connectivity_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let mut edges = self.connectivity.subscribe();
        tokio::spawn(async move {
            loop {
                match edges.recv().await {
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "connectivity edges skipped");
                    }
                    Err(RecvError::Closed) => break,
                }

                let mut closed = false;
                loop {
                    match edges.try_recv() {
                        Ok(_) => {}
                        Err(TryRecvError::Lagged(skipped)) => {
                            debug!(skipped, "connectivity edges skipped");
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => {
                            closed = true;
                            break;
                        }
                    }
                }

                if sync.connectivity.is_online() {
                    if let Err(e) = sync.sync_now().await {
                        warn!(error = %e, "reconciliation after reconnect failed");
                    }
                }
                if closed {
                    break;
                }
            }
        })
    }
}
