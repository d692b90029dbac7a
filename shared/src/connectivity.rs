use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const EDGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityEdge {
    ToOnline,
    ToOffline,
}

/// What the sync indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    IdleOnline,
    IdleOffline,
    Syncing,
}

impl SyncStatus {
    fn idle(online: bool) -> Self {
        if online {
            SyncStatus::IdleOnline
        } else {
            SyncStatus::IdleOffline
        }
    }
}

/// Latest known connectivity plus edge notifications.
///
/// Repeated reports of the same state are swallowed, so subscribers see
/// exactly one edge per real transition.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    online: watch::Sender<bool>,
    status: watch::Sender<SyncStatus>,
    edges: broadcast::Sender<ConnectivityEdge>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        let (status, _) = watch::channel(SyncStatus::idle(initially_online));
        let (edges, _) = broadcast::channel(EDGE_CHANNEL_CAPACITY);
        Self {
            online,
            status,
            edges,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Records a connectivity report and returns the edge it caused, if any.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEdge> {
        let previous = self.online.send_replace(online);
        if previous == online {
            debug!(online, "connectivity unchanged");
            return None;
        }

        let edge = if online {
            ConnectivityEdge::ToOnline
        } else {
            ConnectivityEdge::ToOffline
        };

        self.status.send_modify(|status| {
            if *status != SyncStatus::Syncing {
                *status = SyncStatus::idle(online);
            }
        });

        // No subscribers is fine.
        let _ = self.edges.send(edge);
        info!(?edge, "connectivity changed");
        Some(edge)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEdge> {
        self.edges.subscribe()
    }

    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Enters `Syncing` until the returned guard drops.
    pub(crate) fn begin_sync(&self) -> SyncingGuard<'_> {
        self.status.send_replace(SyncStatus::Syncing);
        SyncingGuard { monitor: self }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

pub(crate) struct SyncingGuard<'a> {
    monitor: &'a ConnectivityMonitor,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        let online = self.monitor.is_online();
        self.monitor.status.send_replace(SyncStatus::idle(online));
    }
}
