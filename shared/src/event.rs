use serde::{Deserialize, Serialize};

use crate::model::TaskId;

/// Everything the shell can tell the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// App launched: paint from local state, then reconcile.
    Started,

    NetworkStatusChanged {
        online: bool,
    },

    AddTask {
        title: String,
    },
    ToggleTask {
        id: TaskId,
    },
    RenameTask {
        id: TaskId,
        title: String,
    },
    DeleteTask {
        id: TaskId,
    },

    SyncRequested,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::NetworkStatusChanged { .. } => "network_status_changed",
            Self::AddTask { .. } => "add_task",
            Self::ToggleTask { .. } => "toggle_task",
            Self::RenameTask { .. } => "rename_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::SyncRequested => "sync_requested",
        }
    }

    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Self::AddTask { .. }
                | Self::ToggleTask { .. }
                | Self::RenameTask { .. }
                | Self::DeleteTask { .. }
                | Self::SyncRequested
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_decode_from_shell_json() {
        let event: Event =
            serde_json::from_str(r#"{"type":"rename_task","id":7,"title":"new"}"#).unwrap();
        assert_eq!(
            event,
            Event::RenameTask {
                id: TaskId::Number(7),
                title: "new".into()
            }
        );
        assert_eq!(event.name(), "rename_task");

        let event: Event =
            serde_json::from_str(r#"{"type":"network_status_changed","online":false}"#).unwrap();
        assert!(!event.is_user_initiated());
    }
}
