//! REST client for the task collection.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::capabilities::http::{
    execute_with_timeout, HttpError, HttpRequest, HttpResponse, HttpTransport,
};
use crate::config::SyncConfig;
use crate::model::{NewTask, Task, TaskId};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("server responded with status {status}")]
    Status { status: u16 },

    #[error("invalid response body: {0}")]
    InvalidBody(String),

    #[error("client-generated id {0} cannot be sent to the server")]
    LocalId(TaskId),

    #[error("task has no id")]
    MissingId,
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport(e) => e.is_retryable(),
            RemoteError::Status { status } => *status >= 500 || *status == 408 || *status == 429,
            RemoteError::InvalidBody(_) | RemoteError::LocalId(_) | RemoteError::MissingId => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// 404: someone else removed it first.
    AlreadyGone,
}

pub struct TaskApi<T: HttpTransport + ?Sized> {
    transport: Arc<T>,
    tasks_url: String,
    timeout_ms: u64,
}

impl<T: HttpTransport + ?Sized> TaskApi<T> {
    pub fn new(transport: Arc<T>, config: &SyncConfig) -> Self {
        Self {
            transport,
            tasks_url: config.tasks_url(),
            timeout_ms: config.request_timeout_ms,
        }
    }

    pub fn tasks_url(&self) -> &str {
        &self.tasks_url
    }

    fn item_url(&self, id: &TaskId) -> Result<String, RemoteError> {
        if id.is_local() {
            return Err(RemoteError::LocalId(id.clone()));
        }
        Ok(format!("{}/{}", self.tasks_url, id))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, RemoteError> {
        let request = request.with_timeout_ms(self.timeout_ms)?;
        let method = request.method();
        let response = execute_with_timeout(self.transport.as_ref(), request).await?;
        debug!(%method, status = response.status(), "remote call finished");
        Ok(response)
    }

    /// GET of the whole collection. The raw response is returned so callers
    /// can store it in the request cache as-is.
    pub async fn list(&self) -> Result<HttpResponse, RemoteError> {
        let response = self.send(HttpRequest::get(self.tasks_url.as_str())?).await?;
        if !response.is_success() {
            return Err(RemoteError::Status {
                status: response.status(),
            });
        }
        Ok(response)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, RemoteError> {
        let response = self.list().await?;
        parse_tasks(&response)
    }

    /// POSTs a new task. `Ok(None)` means the server accepted it but sent
    /// back no readable task.
    pub async fn create(&self, new_task: &NewTask) -> Result<Option<Task>, RemoteError> {
        let request = HttpRequest::post(self.tasks_url.as_str())?.with_json(new_task)?;
        let response = self.send(request).await?;
        accepted_task(&response)
    }

    /// PUTs the full task to its id.
    pub async fn replace(&self, task: &Task) -> Result<Option<Task>, RemoteError> {
        let id = task.id.as_ref().ok_or(RemoteError::MissingId)?;
        let url = self.item_url(id)?;

        let mut body = task.clone();
        body.local_only = false;
        let request = HttpRequest::put(url)?.with_json(&body)?;
        let response = self.send(request).await?;
        accepted_task(&response)
    }

    pub async fn delete(&self, id: &TaskId) -> Result<DeleteOutcome, RemoteError> {
        let url = self.item_url(id)?;
        let response = self.send(HttpRequest::delete(url)?).await?;
        match response.status() {
            404 => Ok(DeleteOutcome::AlreadyGone),
            _ if response.is_success() => Ok(DeleteOutcome::Deleted),
            status => Err(RemoteError::Status { status }),
        }
    }
}

/// Decodes a task-collection body.
pub fn parse_tasks(response: &HttpResponse) -> Result<Vec<Task>, RemoteError> {
    response
        .json::<Vec<Task>>()
        .map_err(|e| RemoteError::InvalidBody(e.to_string()))
}

fn accepted_task(response: &HttpResponse) -> Result<Option<Task>, RemoteError> {
    if !response.is_success() {
        return Err(RemoteError::Status {
            status: response.status(),
        });
    }
    match response.json::<Task>() {
        Ok(task) => Ok(Some(task)),
        Err(e) => {
            warn!(error = %e, "accepted without a readable task body");
            Ok(None)
        }
    }
}
