use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capabilities::kv::{check_value_size, KeyValueStore, KvError, KvKey, StorageErrorCode};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"TBKV";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for KvError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                StorageErrorCode::PermissionDenied
            }
            StoreError::Io(_) => StorageErrorCode::IoError,
            StoreError::StoreTooLarge { .. } => StorageErrorCode::DiskFull,
            StoreError::Serialization(_)
            | StoreError::Corrupted { .. }
            | StoreError::IntegrityCheckFailed { .. }
            | StoreError::FutureSchema { .. } => StorageErrorCode::Corrupted,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StorePayload {
    entries: BTreeMap<String, serde_bytes::ByteBuf>,
}

/// Single-file key-value store. The whole map is rewritten on every change
/// through a temp file and an atomic rename, so a crash leaves either the
/// old or the new snapshot on disk.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileKvStore {
    /// Opens the store at `path`. A missing file is an empty store; an empty
    /// or damaged file is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = Self::load_from_path(&path)?;
        info!(path = %path.display(), entries = entries.len(), "file store opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_path(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file",
            });
        }

        Self::decode(&bytes)
    }

    fn encode(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, StoreError> {
        let payload = StorePayload {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), serde_bytes::ByteBuf::from(v.clone())))
                .collect(),
        };

        let mut payload_bytes = Vec::new();
        ciborium::into_writer(&payload, &mut payload_bytes)?;

        let checksum = blake3::hash(&payload_bytes);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload_bytes,
        };

        let mut envelope_bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut envelope_bytes)?;

        if envelope_bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: envelope_bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }
        Ok(envelope_bytes)
    }

    fn decode(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual_checksum = blake3::hash(&envelope.payload);
        if actual_checksum.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual_checksum.as_bytes()),
            });
        }

        let payload: StorePayload = ciborium::from_reader(&envelope.payload[..])?;
        Ok(payload
            .entries
            .into_iter()
            .map(|(k, v)| (k, v.into_vec()))
            .collect())
    }

    fn write_snapshot(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let bytes = Self::encode(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.entries.lock().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        let mut entries = self.entries.lock().await;
        let raw = key.raw();
        let previous = entries.insert(raw.clone(), value);

        if let Err(e) = self.write_snapshot(&entries) {
            // Keep memory in step with what is on disk.
            match previous {
                Some(old) => entries.insert(raw, old),
                None => entries.remove(&raw),
            };
            warn!(error = %e, "file store write failed");
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        let raw = key.raw();
        let Some(previous) = entries.remove(&raw) else {
            return Ok(false);
        };

        if let Err(e) = self.write_snapshot(&entries) {
            entries.insert(raw, previous);
            warn!(error = %e, "file store write failed");
            return Err(e.into());
        }
        Ok(true)
    }
}
