//! In-memory stand-ins for the shell's capabilities, for tests and demos.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::capabilities::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ValidatedUrl,
};
use crate::capabilities::kv::{KeyValueStore, KvError, KvKey, StorageErrorCode};
use crate::config::SyncConfig;
use crate::model::{NewTask, Task, TaskId};

pub const FAKE_API_BASE: &str = "https://api.tasks.test/api";
pub const FAKE_APP_ORIGIN: &str = "https://app.tasks.test";

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The request never reaches the server.
    Network,
    Status(u16),
}

#[derive(Debug, Clone)]
struct FailRule {
    method: Option<HttpMethod>,
    failure: Failure,
    remaining: Option<usize>,
}

#[derive(Debug)]
struct FakeState {
    tasks: Vec<Task>,
    next_id: i64,
    assets: HashMap<String, Vec<u8>>,
    reachable: bool,
    rules: Vec<FailRule>,
    requests: Vec<RecordedRequest>,
    latency: Duration,
}

/// A REST task server plus static asset host living in memory.
///
/// Serves `GET/POST {api}/todos`, `PUT/DELETE {api}/todos/{id}` and GETs of
/// registered assets on the app origin. Ids are sequential integers.
pub struct FakeRemote {
    state: Mutex<FakeState>,
    config: SyncConfig,
    api_origin: String,
    collection_path: String,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        let config = SyncConfig {
            api_base: FAKE_API_BASE.to_string(),
            app_origin: FAKE_APP_ORIGIN.to_string(),
            ..SyncConfig::default()
        };
        let (api_origin, collection_path) = match ValidatedUrl::new(config.tasks_url()) {
            Ok(url) => (url.origin().to_string(), url.path().to_string()),
            Err(_) => (String::new(), String::new()),
        };
        Self {
            state: Mutex::new(FakeState {
                tasks: Vec::new(),
                next_id: 1,
                assets: HashMap::new(),
                reachable: true,
                rules: Vec::new(),
                requests: Vec::new(),
                latency: Duration::ZERO,
            }),
            config,
            api_origin,
            collection_path,
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Config pointing at this server.
    pub fn config(&self) -> SyncConfig {
        self.config.clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Every request answers with `status` until cleared.
    pub fn fail_status(&self, status: u16) {
        self.state().rules.push(FailRule {
            method: None,
            failure: Failure::Status(status),
            remaining: None,
        });
    }

    pub fn fail_method(&self, method: HttpMethod, failure: Failure) {
        self.state().rules.push(FailRule {
            method: Some(method),
            failure,
            remaining: None,
        });
    }

    /// Fails only the next request with `method`.
    pub fn fail_next(&self, method: HttpMethod, failure: Failure) {
        self.state().rules.push(FailRule {
            method: Some(method),
            failure,
            remaining: Some(1),
        });
    }

    pub fn clear_failures(&self) {
        self.state().rules.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn set_next_id(&self, next_id: i64) {
        self.state().next_id = next_id;
    }

    pub fn insert_task(&self, title: &str, completed: bool) -> Task {
        let mut state = self.state();
        let task = Task {
            id: Some(TaskId::Number(state.next_id)),
            title: title.to_string(),
            completed,
            updated_at: crate::model::timestamp_now(),
            local_only: false,
        };
        state.next_id += 1;
        state.tasks.push(task.clone());
        task
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state().tasks.clone()
    }

    pub fn set_asset(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.state().assets.insert(path.to_string(), body.into());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn count(&self, method: HttpMethod) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    fn record(&self, request: &HttpRequest) -> Duration {
        let mut state = self.state();
        state.requests.push(RecordedRequest {
            method: request.method(),
            url: request.url().as_str().to_string(),
            path: request.url().path().to_string(),
            content_type: request.headers().get("content-type").map(str::to_string),
            body: request
                .body()
                .and_then(|body| serde_json::from_slice(body).ok()),
        });
        state.latency
    }

    fn injected_failure(&self, method: HttpMethod) -> Option<Failure> {
        let mut state = self.state();
        let index = state
            .rules
            .iter()
            .position(|rule| rule.method.map_or(true, |m| m == method))?;
        let rule = &mut state.rules[index];
        let failure = rule.failure;
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            state.rules.remove(index);
        }
        Some(failure)
    }

    fn respond(&self, request: &HttpRequest) -> HttpResult {
        let url = request.url();
        let id = request.request_id().to_string();

        if url.origin() == self.api_origin {
            if url.path() == self.collection_path {
                return match request.method() {
                    HttpMethod::Get => self.list(&id),
                    HttpMethod::Post => self.create(request, &id),
                    _ => Ok(empty(405, &id)),
                };
            }
            let item_prefix = format!("{}/", self.collection_path);
            if let Some(raw_id) = url.path().strip_prefix(&item_prefix) {
                let task_id = raw_id
                    .parse::<i64>()
                    .map_or_else(|_| TaskId::from(raw_id), TaskId::Number);
                return match request.method() {
                    HttpMethod::Put => self.replace(&task_id, request, &id),
                    HttpMethod::Delete => Ok(self.delete(&task_id, &id)),
                    _ => Ok(empty(405, &id)),
                };
            }
        }

        if request.method() == HttpMethod::Get && url.origin() == FAKE_APP_ORIGIN {
            if let Some(body) = self.state().assets.get(url.path()) {
                return Ok(HttpResponse::new(
                    200,
                    HttpHeaders::new(),
                    body.clone(),
                    id,
                    0,
                ));
            }
        }

        Ok(empty(404, &id))
    }

    fn list(&self, request_id: &str) -> HttpResult {
        HttpResponse::json_body(200, &self.tasks(), request_id)
    }

    fn create(&self, request: &HttpRequest, request_id: &str) -> HttpResult {
        let Some(new_task) = request
            .body()
            .and_then(|body| serde_json::from_slice::<NewTask>(body).ok())
        else {
            return Ok(empty(400, request_id));
        };
        let mut state = self.state();
        let task = Task {
            id: Some(TaskId::Number(state.next_id)),
            title: new_task.title,
            completed: new_task.completed,
            updated_at: new_task.updated_at,
            local_only: false,
        };
        state.next_id += 1;
        state.tasks.push(task.clone());
        HttpResponse::json_body(201, &task, request_id)
    }

    fn replace(&self, task_id: &TaskId, request: &HttpRequest, request_id: &str) -> HttpResult {
        let Some(mut task) = request
            .body()
            .and_then(|body| serde_json::from_slice::<Task>(body).ok())
        else {
            return Ok(empty(400, request_id));
        };
        let mut state = self.state();
        let Some(existing) = state.tasks.iter_mut().find(|t| t.has_id(task_id)) else {
            return Ok(empty(404, request_id));
        };
        task.id = Some(task_id.clone());
        task.local_only = false;
        *existing = task.clone();
        HttpResponse::json_body(200, &task, request_id)
    }

    fn delete(&self, task_id: &TaskId, request_id: &str) -> HttpResponse {
        let mut state = self.state();
        let before = state.tasks.len();
        state.tasks.retain(|t| !t.has_id(task_id));
        if state.tasks.len() == before {
            empty(404, request_id)
        } else {
            empty(204, request_id)
        }
    }
}

fn empty(status: u16, request_id: &str) -> HttpResponse {
    HttpResponse::new(status, HttpHeaders::new(), Vec::new(), request_id.to_string(), 0)
}

#[async_trait]
impl HttpTransport for FakeRemote {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let latency = self.record(&request);
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        let unreachable = !self.state().reachable;
        let failure = if unreachable {
            Some(Failure::Network)
        } else {
            self.injected_failure(request.method())
        };

        match failure {
            Some(Failure::Network) => Err(HttpError::ConnectionError {
                host: request.url().host().to_string(),
                message: "network unreachable".to_string(),
            }),
            Some(Failure::Status(status)) => Ok(empty(status, request.request_id())),
            None => self.respond(&request),
        }
    }
}

/// Wraps a store and fails reads or writes on demand.
pub struct FailingKvStore<S: KeyValueStore> {
    inner: S,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<S: KeyValueStore> FailingKvStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn injected() -> KvError {
        KvError::storage(StorageErrorCode::IoError, "injected failure")
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for FailingKvStore<S> {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.delete(key).await
    }
}
