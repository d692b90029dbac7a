use std::sync::Arc;
use std::time::Duration;

use taskbox::capabilities::{
    HttpMethod, HttpRequest, HttpTransport, MemoryKvStore, ValidatedUrl,
};
use taskbox::request_cache::{CacheEntry, RequestKey};
use taskbox::testing::{Failure, FakeRemote, FAKE_APP_ORIGIN};
use taskbox::{CacheError, RequestCache, SyncConfig, Task};

type Cache = RequestCache<FakeRemote, MemoryKvStore>;

fn cache_with(remote: &Arc<FakeRemote>, storage: &Arc<MemoryKvStore>, config: &SyncConfig) -> Cache {
    RequestCache::new(remote.clone(), storage.clone(), config).unwrap()
}

fn setup() -> (Arc<FakeRemote>, Arc<MemoryKvStore>, Cache) {
    let remote = Arc::new(FakeRemote::new());
    let storage = Arc::new(MemoryKvStore::new());
    let cache = cache_with(&remote, &storage, &remote.config());
    (remote, storage, cache)
}

fn list_request(remote: &FakeRemote) -> HttpRequest {
    HttpRequest::get(remote.config().tasks_url()).unwrap()
}

fn asset(path: &str) -> HttpRequest {
    HttpRequest::get(format!("{FAKE_APP_ORIGIN}{path}")).unwrap()
}

#[tokio::test]
async fn stale_while_revalidate_serves_cache_when_network_fails() {
    let (remote, _, cache) = setup();
    remote.insert_task("cached", false);

    let first = cache.fetch(list_request(&remote)).await.unwrap();
    let cached: Vec<Task> = first.json().unwrap();

    remote.insert_task("never seen", false);
    remote.set_reachable(false);
    let second = cache.fetch(list_request(&remote)).await.unwrap();

    assert_eq!(second.body(), first.body());
    assert_eq!(second.json::<Vec<Task>>().unwrap(), cached);
}

#[tokio::test]
async fn stale_while_revalidate_replaces_entry_on_success() {
    let (remote, _, cache) = setup();
    remote.insert_task("one", false);
    cache.fetch(list_request(&remote)).await.unwrap();

    remote.insert_task("two", false);
    let response = cache.fetch(list_request(&remote)).await.unwrap();
    assert_eq!(response.json::<Vec<Task>>().unwrap().len(), 2);

    let cached = cache.cached_tasks().await.unwrap().unwrap();
    assert_eq!(cached.len(), 2);
}

#[tokio::test]
async fn stale_while_revalidate_without_cache_or_network_fails() {
    let (remote, _, cache) = setup();
    remote.set_reachable(false);

    let err = cache.fetch(list_request(&remote)).await.unwrap_err();
    assert!(matches!(err, CacheError::Unavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn slow_network_times_out_to_the_cached_copy() {
    let remote = Arc::new(FakeRemote::new());
    let storage = Arc::new(MemoryKvStore::new());
    let config = SyncConfig {
        request_timeout_ms: 1_000,
        ..remote.config()
    };
    let cache = cache_with(&remote, &storage, &config);
    remote.insert_task("cached", false);
    cache.fetch(list_request(&remote)).await.unwrap();

    remote.set_latency(Duration::from_secs(10));
    let request = list_request(&remote).with_timeout_ms(1_000).unwrap();
    let response = cache.fetch(request).await.unwrap();
    assert_eq!(response.json::<Vec<Task>>().unwrap()[0].title, "cached");
}

#[tokio::test]
async fn precache_then_activate_keeps_only_current_generation() {
    let remote = Arc::new(FakeRemote::new());
    for path in ["/", "/index.html", "/manifest.webmanifest"] {
        remote.set_asset(path, format!("asset {path}"));
    }
    let storage = Arc::new(MemoryKvStore::new());

    let v1 = cache_with(&remote, &storage, &remote.config());
    assert_eq!(v1.install().await.unwrap(), 3);
    v1.storage()
        .put(
            "scratch",
            CacheEntry::capture(
                RequestKey::resolve(FAKE_APP_ORIGIN, "/extra.js").unwrap(),
                taskbox::capabilities::HttpResponse::new(
                    200,
                    Default::default(),
                    b"x".to_vec(),
                    "r".into(),
                    0,
                ),
            ),
        )
        .await
        .unwrap();

    let v2_config = SyncConfig {
        cache_name: "todo-cache-v2".into(),
        ..remote.config()
    };
    let v2 = cache_with(&remote, &storage, &v2_config);
    v2.install().await.unwrap();
    let mut removed = v2.activate().await.unwrap();
    removed.sort();

    assert_eq!(removed, vec!["scratch", "todo-cache-v1"]);
    assert_eq!(v2.storage().keys().await.unwrap(), vec!["todo-cache-v2"]);
}

#[tokio::test]
async fn network_first_falls_back_to_any_generation() {
    let (remote, _, cache) = setup();
    for path in ["/", "/index.html", "/manifest.webmanifest"] {
        remote.set_asset(path, "shell");
    }
    cache.install().await.unwrap();

    remote.set_reachable(false);
    let response = cache.fetch(asset("/index.html")).await.unwrap();
    assert_eq!(response.body(), b"shell");

    let miss = cache.fetch(asset("/other.css")).await.unwrap_err();
    assert!(matches!(miss, CacheError::Unavailable(_)));
}

#[tokio::test]
async fn network_first_serves_fresh_copy_without_writing() {
    let (remote, _, cache) = setup();
    remote.set_asset("/app.js", "v1");

    let response = cache.fetch(asset("/app.js")).await.unwrap();
    assert_eq!(response.body(), b"v1");
    assert!(cache.storage().keys().await.unwrap().is_empty());

    // Error statuses are responses, not failures.
    let missing = cache.fetch(asset("/missing.js")).await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn non_get_requests_pass_through() {
    let (remote, _, cache) = setup();
    let request = HttpRequest::post(remote.config().tasks_url())
        .unwrap()
        .with_json(&serde_json::json!({
            "title": "through",
            "completed": false,
            "updatedAt": ""
        }))
        .unwrap();

    let response = cache.fetch(request).await.unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(remote.count(HttpMethod::Post), 1);
    assert_eq!(cache.cached_tasks().await.unwrap(), None);

    remote.fail_next(HttpMethod::Post, Failure::Network);
    let offline = HttpRequest::post(remote.config().tasks_url()).unwrap();
    assert!(matches!(
        cache.fetch(offline).await,
        Err(CacheError::Http(_))
    ));
}

#[tokio::test]
async fn cache_is_a_transport() {
    let (remote, _, cache) = setup();
    remote.insert_task("via transport", false);
    cache.execute(list_request(&remote)).await.unwrap();

    remote.set_reachable(false);
    let response = cache.execute(list_request(&remote)).await.unwrap();
    assert_eq!(response.json::<Vec<Task>>().unwrap()[0].title, "via transport");

    let err = cache.execute(asset("/nothing")).await.unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn cross_origin_static_requests_are_not_cached() {
    let remote = FakeRemote::new();
    let routes = taskbox::RouteTable::from_config(&remote.config()).unwrap();
    let url = ValidatedUrl::new("https://cdn.elsewhere.test/lib.js").unwrap();
    assert_eq!(
        routes.classify(HttpMethod::Get, &url),
        taskbox::ResourceClass::Other
    );
}
