use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// ISO-8601 UTC timestamp with millisecond precision, the format the task
/// server stores in `updatedAt`.
#[must_use]
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// --- Identifiers ---

/// Locally generated token for a queued operation. Never sent to the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub const PREFIX: &'static str = "p_";
    const MAX_LENGTH: usize = 128;
    const RANDOM_CHARS: usize = 10;

    pub fn new(id: impl Into<String>) -> Result<Self, ModelError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ModelError::InvalidId("ClientId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ModelError::InvalidId(format!(
                "ClientId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ModelError::InvalidId(
                "ClientId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Timestamp in base36 followed by random base36 digits. Unique enough
    /// without any coordination between writers.
    pub fn generate() -> Self {
        Self::generate_at(UnixTimeMs::now())
    }

    pub fn generate_at(now: UnixTimeMs) -> Self {
        let mut rng = rand::thread_rng();
        let mut id = String::with_capacity(Self::PREFIX.len() + 9 + Self::RANDOM_CHARS);
        id.push_str(Self::PREFIX);
        id.push_str(&to_base36(now.0));
        for _ in 0..Self::RANDOM_CHARS {
            let digit = rng.gen_range(0..36u32);
            id.push(char::from_digit(digit, 36).unwrap_or('0'));
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        let digit = (value % 36) as u32;
        digits.push(char::from_digit(digit, 36).unwrap_or('0'));
        value /= 36;
    }
    digits.iter().rev().collect()
}

/// Task identifier as the server hands it out. The backend may use numeric
/// or string ids; both round-trip in their original JSON shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(i64),
    Text(String),
}

impl TaskId {
    /// Id for an optimistic item the server has not seen yet.
    pub fn local(client_id: &ClientId) -> Self {
        TaskId::Text(client_id.as_str().to_string())
    }

    /// Client-generated ids are never sent to the server.
    pub fn is_local(&self) -> bool {
        matches!(self, TaskId::Text(s) if s.starts_with(ClientId::PREFIX))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Number(n) => write!(f, "{n}"),
            TaskId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        TaskId::Number(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId::Text(value.to_string())
    }
}

// --- Tasks ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub updated_at: String,
    /// Optimistic and not yet confirmed by the server.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_only: bool,
}

impl Task {
    pub fn has_id(&self, id: &TaskId) -> bool {
        self.id.as_ref() == Some(id)
    }

    /// The create body for this task: every field but the id.
    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            title: self.title.clone(),
            completed: self.completed,
            updated_at: self.updated_at.clone(),
        }
    }
}

/// Body of a create request. Carries no id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    pub completed: bool,
    pub updated_at: String,
}

impl NewTask {
    pub fn into_local_task(self, client_id: &ClientId) -> Task {
        Task {
            id: Some(TaskId::local(client_id)),
            title: self.title,
            completed: self.completed,
            updated_at: self.updated_at,
            local_only: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTarget {
    pub id: TaskId,
}

// --- Pending operations ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingOp {
    Create(NewTask),
    Update(Task),
    Delete(DeleteTarget),
}

impl PendingOp {
    pub fn kind(&self) -> OpKind {
        match self {
            PendingOp::Create(_) => OpKind::Create,
            PendingOp::Update(_) => OpKind::Update,
            PendingOp::Delete(_) => OpKind::Delete,
        }
    }

    /// Task the operation targets; `None` for creates.
    pub fn target(&self) -> Option<&TaskId> {
        match self {
            PendingOp::Create(_) => None,
            PendingOp::Update(task) => task.id.as_ref(),
            PendingOp::Delete(target) => Some(&target.id),
        }
    }
}

/// One queued, not yet acknowledged mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPendingOperation", into = "RawPendingOperation")]
pub struct PendingOperation {
    pub client_id: ClientId,
    pub op: PendingOp,
}

impl PendingOperation {
    pub fn new(client_id: ClientId, op: PendingOp) -> Self {
        Self { client_id, op }
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }
}

/// Persisted shape: `{"clientId": .., "op": "create", "payload": {..}}`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPendingOperation {
    client_id: ClientId,
    op: OpKind,
    payload: serde_json::Value,
}

impl TryFrom<RawPendingOperation> for PendingOperation {
    type Error = String;

    fn try_from(raw: RawPendingOperation) -> Result<Self, Self::Error> {
        let op = match raw.op {
            OpKind::Create => serde_json::from_value(raw.payload).map(PendingOp::Create),
            OpKind::Update => serde_json::from_value(raw.payload).map(PendingOp::Update),
            OpKind::Delete => serde_json::from_value(raw.payload).map(PendingOp::Delete),
        }
        .map_err(|e| format!("invalid {} payload for {}: {e}", raw.op.as_str(), raw.client_id))?;

        if let PendingOp::Update(task) = &op {
            if task.id.is_none() {
                return Err(format!("update payload for {} has no id", raw.client_id));
            }
        }

        Ok(Self {
            client_id: raw.client_id,
            op,
        })
    }
}

impl From<PendingOperation> for RawPendingOperation {
    fn from(operation: PendingOperation) -> Self {
        let kind = operation.kind();
        let payload = match operation.op {
            PendingOp::Create(new_task) => serde_json::to_value(new_task),
            PendingOp::Update(task) => serde_json::to_value(task),
            PendingOp::Delete(target) => serde_json::to_value(target),
        }
        .unwrap_or(serde_json::Value::Null);
        Self {
            client_id: operation.client_id,
            op: kind,
            payload,
        }
    }
}

// --- View items ---

/// An entry of the rendered list: either server-confirmed, or still backed
/// by a queued operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewItem {
    Confirmed(Task),
    Pending { client_id: ClientId, task: Task },
}

impl ViewItem {
    pub fn task(&self) -> &Task {
        match self {
            ViewItem::Confirmed(task) | ViewItem::Pending { task, .. } => task,
        }
    }

    pub fn task_mut(&mut self) -> &mut Task {
        match self {
            ViewItem::Confirmed(task) | ViewItem::Pending { task, .. } => task,
        }
    }

    pub fn id(&self) -> Option<&TaskId> {
        self.task().id.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ViewItem::Pending { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
