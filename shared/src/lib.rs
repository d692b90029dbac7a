#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod connectivity;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod reconcile;
pub mod remote;
pub mod request_cache;
pub mod sync;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod view;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capabilities::{HttpTransport, KeyValueStore, MemoryKvStore};
pub use config::{ConfigError, SyncConfig};
pub use connectivity::{ConnectivityEdge, ConnectivityMonitor, SyncStatus};
pub use event::Event;
pub use model::{ClientId, NewTask, PendingOp, PendingOperation, Task, TaskId, ViewItem};
pub use offline_store::{FileKvStore, StoreError};
pub use outbox::{PendingStore, PendingStoreError};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use remote::{DeleteOutcome, RemoteError, TaskApi};
pub use request_cache::{CacheError, CacheStrategy, RequestCache, ResourceClass, RouteTable};
pub use sync::TaskSync;
pub use view::{merge_view, TaskListController, ViewError};

use capabilities::{HttpError, KvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    ServerError,
    RateLimited,
    Unavailable,
    Validation,
    NotFound,
    Conflict,
    QueueFull,
    Storage,
    Corrupted,
    Serialization,
    Deserialization,
    InvalidState,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ServerError => "SERVER_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::QueueFull => "QUEUE_FULL",
            Self::Storage => "STORAGE_ERROR",
            Self::Corrupted => "STORE_CORRUPTED",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::ServerError
            | Self::RateLimited
            | Self::Unavailable
            | Self::QueueFull
            | Self::Cancelled => ErrorSeverity::Transient,

            Self::Storage | Self::Corrupted | Self::Serialization | Self::InvalidState => {
                ErrorSeverity::Fatal
            }

            Self::Validation | Self::NotFound | Self::Conflict | Self::Deserialization => {
                ErrorSeverity::Permanent
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::ServerError
                | Self::RateLimited
                | Self::Unavailable
                | Self::Cancelled
        )
    }

    #[must_use]
    pub const fn from_http_status(status: u16) -> Self {
        match status {
            404 | 410 => Self::NotFound,
            408 => Self::Timeout,
            409 | 412 => Self::Conflict,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::Validation,
        }
    }
}

/// Any failure surfaced by [`TaskSync`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pending(#[from] PendingStoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    View(#[from] ViewError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Http(#[from] HttpError),
}

impl SyncError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Validation,
            Self::Pending(e) => pending_kind(e),
            Self::Reconcile(ReconcileError::PendingStore(e)) => pending_kind(e),
            Self::Reconcile(ReconcileError::Abandoned) => ErrorKind::Cancelled,
            Self::Cache(e) => cache_kind(e),
            Self::Remote(e) => remote_kind(e),
            Self::View(ViewError::UnknownTask(_)) => ErrorKind::NotFound,
            Self::View(ViewError::Pending(e)) => pending_kind(e),
            Self::View(ViewError::Cache(e)) => cache_kind(e),
            Self::Kv(e) => kv_kind(e),
            Self::Store(e) => store_kind(e),
            Self::Http(e) => http_kind(e),
        }
    }

    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        self.kind().default_severity()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn http_kind(e: &HttpError) -> ErrorKind {
    match e {
        HttpError::Timeout { .. } => ErrorKind::Timeout,
        HttpError::ConnectionError { .. } | HttpError::TooManyRedirects => ErrorKind::Network,
        HttpError::InvalidResponse { .. } => ErrorKind::Deserialization,
        HttpError::SerializationError { .. } => ErrorKind::Serialization,
        HttpError::InvalidUrl { .. }
        | HttpError::InvalidHeader { .. }
        | HttpError::TooManyHeaders { .. }
        | HttpError::BodyTooLarge { .. }
        | HttpError::ResponseTooLarge { .. }
        | HttpError::InvalidRequest { .. } => ErrorKind::Validation,
    }
}

fn kv_kind(e: &KvError) -> ErrorKind {
    match e {
        KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => ErrorKind::Validation,
        KvError::Storage { .. } => ErrorKind::Storage,
        KvError::Serialization { .. } => ErrorKind::Corrupted,
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::Io(_) | StoreError::StoreTooLarge { .. } => ErrorKind::Storage,
        StoreError::Serialization(_)
        | StoreError::Corrupted { .. }
        | StoreError::IntegrityCheckFailed { .. }
        | StoreError::FutureSchema { .. } => ErrorKind::Corrupted,
    }
}

fn pending_kind(e: &PendingStoreError) -> ErrorKind {
    match e {
        PendingStoreError::Full(_) => ErrorKind::QueueFull,
        PendingStoreError::DuplicateClientId(_) => ErrorKind::Conflict,
        PendingStoreError::Validation(_) => ErrorKind::Validation,
        PendingStoreError::Storage(kv) => kv_kind(kv),
    }
}

fn cache_kind(e: &CacheError) -> ErrorKind {
    match e {
        CacheError::Storage(kv) => kv_kind(kv),
        CacheError::Http(http) => http_kind(http),
        CacheError::InvalidName(_) => ErrorKind::Validation,
        CacheError::Install { .. } => ErrorKind::Network,
        CacheError::Unavailable(_) => ErrorKind::Unavailable,
        CacheError::InvalidEntry { .. } => ErrorKind::Deserialization,
    }
}

fn remote_kind(e: &RemoteError) -> ErrorKind {
    match e {
        RemoteError::Transport(http) => http_kind(http),
        RemoteError::Status { status } => ErrorKind::from_http_status(*status),
        RemoteError::InvalidBody(_) => ErrorKind::Deserialization,
        RemoteError::LocalId(_) | RemoteError::MissingId => ErrorKind::InvalidState,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StorageErrorCode;

    #[test]
    fn transient_remote_failures_are_retryable() {
        let timeout = SyncError::from(RemoteError::Transport(HttpError::Timeout {
            timeout_ms: 1000,
            request_id: "r".into(),
        }));
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(timeout.severity(), ErrorSeverity::Transient);
        assert!(timeout.is_retryable());

        let server = SyncError::from(RemoteError::Status { status: 503 });
        assert_eq!(server.kind(), ErrorKind::ServerError);
        assert!(server.is_retryable());

        let missing = SyncError::from(RemoteError::Status { status: 404 });
        assert_eq!(missing.severity(), ErrorSeverity::Permanent);
    }

    #[test]
    fn store_failures_propagate_with_their_kind() {
        let io = SyncError::from(PendingStoreError::Storage(KvError::storage(
            StorageErrorCode::IoError,
            "disk full",
        )));
        assert_eq!(io.kind(), ErrorKind::Storage);
        assert_eq!(io.severity(), ErrorSeverity::Fatal);
        assert!(!io.is_retryable());

        let corrupted = SyncError::from(StoreError::Corrupted {
            reason: "bad magic",
        });
        assert_eq!(corrupted.severity(), ErrorSeverity::Fatal);
        assert_eq!(corrupted.kind().code(), "STORE_CORRUPTED");
    }

    #[test]
    fn read_with_nothing_cached_is_unavailable() {
        let err = SyncError::from(CacheError::Unavailable("https://a.test/".into()));
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_task_is_not_found() {
        let err = SyncError::from(ViewError::UnknownTask(TaskId::Number(3)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
    }
}
