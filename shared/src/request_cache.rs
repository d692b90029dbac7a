//! Intercepting response cache with per-route strategies.
//!
//! Responses live in named generations (`todo-cache-v1`, ...) persisted
//! through the [`KeyValueStore`]. Installing a generation precaches the app
//! shell; activating it deletes every other generation. GET requests are
//! then routed through a [`RouteTable`]:
//!
//! - the task collection is served stale-while-revalidate,
//! - same-origin resources are fetched network-first with a cache fallback,
//! - everything else, and every non-GET, passes straight through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::{
    execute_with_timeout, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpResult,
    HttpTransport, ValidatedUrl,
};
use crate::capabilities::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, TypedKvStore};
use crate::config::SyncConfig;
use crate::model::{Task, UnixTimeMs};
use crate::remote::parse_tasks;

const INDEX_KEY: &str = "generations";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("http error: {0}")]
    Http(#[from] HttpError),

    #[error("invalid cache name '{0}'")]
    InvalidName(String),

    #[error("precache of {locator} failed: {reason}")]
    Install { locator: String, reason: String },

    #[error("{0} is unavailable: network failed and nothing is cached")]
    Unavailable(String),

    #[error("cached entry for {key} is unreadable: {reason}")]
    InvalidEntry { key: String, reason: String },
}

/// Normalized resource locator: absolute, lowercase scheme and host, no
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn for_url(url: &ValidatedUrl) -> Self {
        Self(url.without_fragment().as_str().to_string())
    }

    /// Resolves a possibly relative locator against `origin`.
    pub fn resolve(origin: &str, locator: &str) -> Result<Self, CacheError> {
        Ok(Self::for_url(&ValidatedUrl::resolve(origin, locator)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable snapshot of one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub response: HttpResponse,
    pub captured_at: UnixTimeMs,
}

impl CacheEntry {
    pub fn capture(key: RequestKey, response: HttpResponse) -> Self {
        Self {
            key,
            response,
            captured_at: UnixTimeMs::now(),
        }
    }
}

type Generation = BTreeMap<RequestKey, CacheEntry>;

/// Named, generation-versioned response store.
pub struct CacheStorage<S: KeyValueStore> {
    storage: Arc<S>,
    index: TypedKvStore<Vec<String>>,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> CacheStorage<S> {
    pub fn new(storage: Arc<S>) -> Result<Self, CacheError> {
        Ok(Self {
            storage,
            index: TypedKvStore::new(KvKey::new(KeyNamespace::Cache, INDEX_KEY)?),
            write_lock: Mutex::new(()),
        })
    }

    fn generation(name: &str) -> Result<TypedKvStore<Generation>, CacheError> {
        if name.trim().is_empty() {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        let key = KvKey::new(KeyNamespace::Cache, format!("generation:{name}"))
            .map_err(|_| CacheError::InvalidName(name.to_string()))?;
        Ok(TypedKvStore::new(key))
    }

    async fn load_index(&self) -> Result<Vec<String>, CacheError> {
        Ok(self
            .index
            .load(self.storage.as_ref())
            .await?
            .unwrap_or_default())
    }

    async fn load_generation(&self, name: &str) -> Result<Generation, CacheError> {
        Ok(Self::generation(name)?
            .load(self.storage.as_ref())
            .await?
            .unwrap_or_default())
    }

    /// Generation names, oldest first.
    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let _guard = self.write_lock.lock().await;
        self.load_index().await
    }

    pub async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.keys().await?.iter().any(|n| n == name))
    }

    pub async fn match_key(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.load_generation(name).await?.remove(key))
    }

    /// Looks `key` up across every generation, oldest first.
    pub async fn match_any(&self, key: &RequestKey) -> Result<Option<CacheEntry>, CacheError> {
        let _guard = self.write_lock.lock().await;
        for name in self.load_index().await? {
            if let Some(entry) = self.load_generation(&name).await?.remove(key) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Replaces the entry for `entry.key`. Last write wins.
    pub async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.put_all(name, vec![entry]).await
    }

    /// Stores every entry in one write, so either all land or none do.
    pub async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        let store = Self::generation(name)?;
        let _guard = self.write_lock.lock().await;

        let mut generation = self.load_generation(name).await?;
        for entry in entries {
            generation.insert(entry.key.clone(), entry);
        }
        store.save(self.storage.as_ref(), &generation).await?;

        let mut index = self.load_index().await?;
        if !index.iter().any(|n| n == name) {
            index.push(name.to_string());
            self.index.save(self.storage.as_ref(), &index).await?;
        }
        Ok(())
    }

    /// Drops a whole generation. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let store = Self::generation(name)?;
        let _guard = self.write_lock.lock().await;

        let mut index = self.load_index().await?;
        let before = index.len();
        index.retain(|n| n != name);
        let existed = index.len() != before;

        if existed {
            self.index.save(self.storage.as_ref(), &index).await?;
        }
        let had_entries = self.storage.delete(store.key()).await?;
        Ok(existed || had_entries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStrategy {
    StaleWhileRevalidate,
    NetworkFirst,
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    /// GET of the task collection, on any origin.
    TaskCollection,
    /// GET of anything else on the app origin.
    AppStatic,
    /// Non-GET requests and foreign origins.
    Other,
}

/// Resource class to strategy. Classification happens once per request.
#[derive(Debug, Clone)]
pub struct RouteTable {
    task_collection_path: String,
    app_origin: String,
    routes: Vec<(ResourceClass, CacheStrategy)>,
}

impl RouteTable {
    pub fn new(task_collection_path: impl Into<String>, app_origin: &ValidatedUrl) -> Self {
        Self {
            task_collection_path: task_collection_path.into(),
            app_origin: app_origin.origin().to_string(),
            routes: vec![
                (
                    ResourceClass::TaskCollection,
                    CacheStrategy::StaleWhileRevalidate,
                ),
                (ResourceClass::AppStatic, CacheStrategy::NetworkFirst),
                (ResourceClass::Other, CacheStrategy::Passthrough),
            ],
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, CacheError> {
        let origin = ValidatedUrl::new(config.app_origin.as_str())?;
        Ok(Self::new(config.task_collection_path.as_str(), &origin))
    }

    #[must_use]
    pub fn with_route(mut self, class: ResourceClass, strategy: CacheStrategy) -> Self {
        match self.routes.iter_mut().find(|(c, _)| *c == class) {
            Some(route) => route.1 = strategy,
            None => self.routes.push((class, strategy)),
        }
        self
    }

    pub fn classify(&self, method: HttpMethod, url: &ValidatedUrl) -> ResourceClass {
        if method != HttpMethod::Get {
            ResourceClass::Other
        } else if url.path() == self.task_collection_path {
            ResourceClass::TaskCollection
        } else if url.origin() == self.app_origin {
            ResourceClass::AppStatic
        } else {
            ResourceClass::Other
        }
    }

    pub fn strategy(&self, class: ResourceClass) -> CacheStrategy {
        self.routes
            .iter()
            .find(|(c, _)| *c == class)
            .map_or(CacheStrategy::Passthrough, |(_, s)| *s)
    }

    pub fn strategy_for(&self, request: &HttpRequest) -> CacheStrategy {
        self.strategy(self.classify(request.method(), request.url()))
    }
}

/// The interception point: wraps the network transport and answers from the
/// cache according to the [`RouteTable`].
pub struct RequestCache<T: HttpTransport + ?Sized, S: KeyValueStore> {
    network: Arc<T>,
    storage: CacheStorage<S>,
    routes: RouteTable,
    cache_name: String,
    app_origin: ValidatedUrl,
    app_shell: Vec<String>,
    tasks_key: RequestKey,
    timeout_ms: u64,
}

impl<T: HttpTransport + ?Sized, S: KeyValueStore> RequestCache<T, S> {
    pub fn new(network: Arc<T>, storage: Arc<S>, config: &SyncConfig) -> Result<Self, CacheError> {
        let app_origin = ValidatedUrl::new(config.app_origin.as_str())?;
        let tasks_key = RequestKey::for_url(&ValidatedUrl::new(config.tasks_url())?);
        Ok(Self {
            network,
            storage: CacheStorage::new(storage)?,
            routes: RouteTable::new(config.task_collection_path.as_str(), &app_origin),
            cache_name: config.cache_name.clone(),
            app_origin,
            app_shell: config.app_shell.clone(),
            tasks_key,
            timeout_ms: config.request_timeout_ms,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn storage(&self) -> &CacheStorage<S> {
        &self.storage
    }

    pub fn tasks_key(&self) -> &RequestKey {
        &self.tasks_key
    }

    /// Precaches the app shell into the current generation. All-or-nothing:
    /// a failed or non-2xx entry aborts before anything is stored.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn install(&self) -> Result<usize, CacheError> {
        let mut entries = Vec::with_capacity(self.app_shell.len());
        for locator in &self.app_shell {
            let url = ValidatedUrl::resolve(self.app_origin.as_str(), locator)?;
            let key = RequestKey::for_url(&url);
            let request = HttpRequest::new(HttpMethod::Get, url).with_timeout_ms(self.timeout_ms)?;

            let response = execute_with_timeout(self.network.as_ref(), request)
                .await
                .map_err(|e| CacheError::Install {
                    locator: locator.clone(),
                    reason: e.to_string(),
                })?;
            if !response.is_success() {
                return Err(CacheError::Install {
                    locator: locator.clone(),
                    reason: format!("status {}", response.status()),
                });
            }
            entries.push(CacheEntry::capture(key, response));
        }

        let count = entries.len();
        self.storage.put_all(&self.cache_name, entries).await?;
        info!(count, "app shell precached");
        Ok(count)
    }

    /// Deletes every generation except the current one. Returns the names
    /// removed.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn activate(&self) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        for name in self.storage.keys().await? {
            if name != self.cache_name {
                self.storage.delete(&name).await?;
                removed.push(name);
            }
        }
        if !removed.is_empty() {
            info!(?removed, "old cache generations deleted");
        }
        Ok(removed)
    }

    /// Runs `request` through the strategy its route selects.
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, CacheError> {
        let strategy = self.routes.strategy_for(&request);
        debug!(url = %request.url(), ?strategy, "intercepted");
        match strategy {
            CacheStrategy::Passthrough => Ok(self.network_call(request).await?),
            CacheStrategy::NetworkFirst => self.network_first(request).await,
            CacheStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    async fn network_call(&self, request: HttpRequest) -> HttpResult {
        execute_with_timeout(self.network.as_ref(), request).await
    }

    async fn stale_while_revalidate(
        &self,
        request: HttpRequest,
    ) -> Result<HttpResponse, CacheError> {
        let key = RequestKey::for_url(request.url());
        let (network, cached) = tokio::join!(
            self.network_call(request),
            self.storage.match_key(&self.cache_name, &key)
        );

        let cached = cached.unwrap_or_else(|e| {
            warn!(%key, error = %e, "cache lookup failed");
            None
        });

        match network {
            Ok(response) if response.is_success() => {
                let entry = CacheEntry::capture(key.clone(), response.clone());
                if let Err(e) = self.storage.put(&self.cache_name, entry).await {
                    warn!(%key, error = %e, "cache refresh failed");
                }
                Ok(response)
            }
            Ok(response) => match cached {
                Some(entry) => {
                    debug!(%key, status = response.status(), "serving cached over error status");
                    Ok(entry.response)
                }
                None => Ok(response),
            },
            Err(e) => match cached {
                Some(entry) => {
                    debug!(%key, error = %e, "serving cached copy");
                    Ok(entry.response)
                }
                None => Err(CacheError::Unavailable(key.to_string())),
            },
        }
    }

    async fn network_first(&self, request: HttpRequest) -> Result<HttpResponse, CacheError> {
        let key = RequestKey::for_url(request.url());
        match self.network_call(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(%key, error = %e, "network failed, trying cache");
                match self.storage.match_any(&key).await? {
                    Some(entry) => Ok(entry.response),
                    None => Err(CacheError::Unavailable(key.to_string())),
                }
            }
        }
    }

    /// Replaces the task-collection entry of the current generation.
    pub async fn put_tasks(&self, response: &HttpResponse) -> Result<(), CacheError> {
        let entry = CacheEntry::capture(self.tasks_key.clone(), response.clone());
        self.storage.put(&self.cache_name, entry).await
    }

    /// Cached task list, without touching the network.
    pub async fn cached_tasks(&self) -> Result<Option<Vec<Task>>, CacheError> {
        let Some(entry) = self
            .storage
            .match_key(&self.cache_name, &self.tasks_key)
            .await?
        else {
            return Ok(None);
        };
        parse_tasks(&entry.response)
            .map(Some)
            .map_err(|e| CacheError::InvalidEntry {
                key: self.tasks_key.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl<T: HttpTransport + ?Sized, S: KeyValueStore> HttpTransport for RequestCache<T, S> {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let host = request.url().host().to_string();
        self.fetch(request).await.map_err(|e| match e {
            CacheError::Http(http) => http,
            other => HttpError::ConnectionError {
                host,
                message: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKvStore;
    use crate::testing::FakeRemote;

    fn cache(remote: &Arc<FakeRemote>) -> RequestCache<FakeRemote, MemoryKvStore> {
        RequestCache::new(remote.clone(), Arc::new(MemoryKvStore::new()), &remote.config()).unwrap()
    }

    #[test]
    fn request_keys_are_normalized() {
        let a = RequestKey::resolve("https://App.Example.com", "/index.html#top").unwrap();
        let b = RequestKey::resolve("https://app.example.com/", "https://APP.example.com/index.html")
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://app.example.com/index.html");
    }

    #[test]
    fn route_table_classifies_requests() {
        let origin = ValidatedUrl::new("https://app.example.com").unwrap();
        let routes = RouteTable::new("/api/todos", &origin);
        let url = |s: &str| ValidatedUrl::new(s).unwrap();

        assert_eq!(
            routes.classify(HttpMethod::Get, &url("https://backend.example.net/api/todos")),
            ResourceClass::TaskCollection
        );
        assert_eq!(
            routes.classify(HttpMethod::Get, &url("https://app.example.com/index.html")),
            ResourceClass::AppStatic
        );
        assert_eq!(
            routes.classify(HttpMethod::Get, &url("https://cdn.example.org/lib.js")),
            ResourceClass::Other
        );
        assert_eq!(
            routes.classify(HttpMethod::Post, &url("https://backend.example.net/api/todos")),
            ResourceClass::Other
        );
        assert_eq!(
            routes.strategy(ResourceClass::TaskCollection),
            CacheStrategy::StaleWhileRevalidate
        );
        assert_eq!(
            routes.strategy(ResourceClass::AppStatic),
            CacheStrategy::NetworkFirst
        );

        let overridden = routes.with_route(ResourceClass::AppStatic, CacheStrategy::Passthrough);
        assert_eq!(
            overridden.strategy(ResourceClass::AppStatic),
            CacheStrategy::Passthrough
        );
    }

    #[tokio::test]
    async fn storage_generations_roundtrip() {
        let storage = CacheStorage::new(Arc::new(MemoryKvStore::new())).unwrap();
        let key = RequestKey::resolve("https://app.example.com", "/").unwrap();
        let response = HttpResponse::new(200, Default::default(), b"<html>".to_vec(), "r".into(), 0);

        storage
            .put("v1", CacheEntry::capture(key.clone(), response.clone()))
            .await
            .unwrap();
        storage
            .put("v2", CacheEntry::capture(key.clone(), response))
            .await
            .unwrap();

        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);
        assert!(storage.match_key("v1", &key).await.unwrap().is_some());
        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert!(storage.match_key("v1", &key).await.unwrap().is_none());
        assert!(storage.match_any(&key).await.unwrap().is_some());
        assert!(matches!(
            storage.put_all("", Vec::new()).await,
            Err(CacheError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn install_is_all_or_nothing() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_asset("/", "<html>");
        remote.set_asset("/index.html", "<html>");
        // manifest missing -> 404
        let cache = cache(&remote);

        let result = cache.install().await;
        assert!(matches!(result, Err(CacheError::Install { .. })));
        assert!(cache.storage().keys().await.unwrap().is_empty());

        remote.set_asset("/manifest.webmanifest", "{}");
        assert_eq!(cache.install().await.unwrap(), 3);
        assert_eq!(cache.storage().keys().await.unwrap(), vec!["todo-cache-v1"]);
    }

    #[tokio::test]
    async fn cached_tasks_reads_without_network() {
        let remote = Arc::new(FakeRemote::new());
        let cache = cache(&remote);
        assert_eq!(cache.cached_tasks().await.unwrap(), None);

        remote.insert_task("seeded", false);
        let response = HttpRequest::get(remote.config().tasks_url()).unwrap();
        cache.fetch(response).await.unwrap();

        remote.set_reachable(false);
        let before = remote.requests().len();
        let tasks = cache.cached_tasks().await.unwrap().unwrap();
        assert_eq!(tasks[0].title, "seeded");
        assert_eq!(remote.requests().len(), before);
    }

    #[tokio::test]
    async fn swr_non_success_prefers_cached_copy() {
        let remote = Arc::new(FakeRemote::new());
        let cache = cache(&remote);
        remote.insert_task("first", false);
        let url = remote.config().tasks_url();

        cache.fetch(HttpRequest::get(url.as_str()).unwrap()).await.unwrap();

        remote.fail_status(500);
        let response = cache.fetch(HttpRequest::get(url.as_str()).unwrap()).await.unwrap();
        assert_eq!(response.status(), 200);

        let fresh = self::cache(&remote);
        let response = fresh.fetch(HttpRequest::get(url.as_str()).unwrap()).await.unwrap();
        assert_eq!(response.status(), 500);
    }
}
