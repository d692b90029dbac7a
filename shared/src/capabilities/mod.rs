//! Platform seams the shell provides: network access and durable storage.

pub mod http;
pub mod kv;

pub use self::http::{
    execute_with_timeout, ContentType, HttpError, HttpHeaders, HttpMethod, HttpRequest,
    HttpResponse, HttpResult, HttpTransport, ValidatedUrl,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode, TypedKvStore,
};

#[cfg(all(feature = "reqwest-transport", not(target_arch = "wasm32")))]
pub use self::http::ReqwestTransport;

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
