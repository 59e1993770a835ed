//! Key-value persistence with optimistic concurrency
//!
//! Compliance records and remediation sequences are stored through
//! `KvStore`. Every write names the version it expects to replace, so two
//! writers racing on the same key cannot silently overwrite each other.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// A stored value together with its version (1 on first write)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: serde_json::Value,
    pub version: u64,
}

/// Generic key-value store with compare-and-set writes
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write a key if its current version equals `expected`
    ///
    /// `expected = None` means the key must not exist yet. Returns the new
    /// version, or `VersionConflict` when the check fails.
    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64>;

    /// List all entries whose key starts with `prefix`, ordered by key
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Remove a key (no-op if absent)
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Read and deserialize a key, returning the value and its version
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(v) => Ok(Some((serde_json::from_value(v.value)?, v.version))),
        None => Ok(None),
    }
}

/// Serialize and conditionally write a value
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    expected: Option<u64>,
) -> Result<u64> {
    store
        .put_if_version(key, serde_json::to_value(value)?, expected)
        .await
}

fn check_version(key: &str, current: Option<&Versioned>, expected: Option<u64>) -> Result<u64> {
    let found = current.map(|v| v.version);
    if found != expected {
        return Err(PipelineError::VersionConflict {
            key: key.to_string(),
            expected,
            found,
        });
    }
    Ok(found.unwrap_or(0) + 1)
}

/// In-memory store for testing and single-process use
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Versioned>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let version = check_version(key, entries.get(key), expected)?;
        entries.insert(key.to_string(), Versioned { value, version });
        Ok(version)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// JSON file-backed store
///
/// Keeps the full map in memory and rewrites the file on every mutation.
/// Writes go to a temp file that is then renamed over the original, so a
/// crash mid-write leaves the previous contents intact.
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Versioned>>,
}

impl FileKvStore {
    /// Open (or create) a store at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if tokio::fs::try_exists(&path).await? {
            let json = tokio::fs::read_to_string(&path).await?;
            let entries: BTreeMap<String, Versioned> =
                serde_json::from_str(&json).map_err(|e| {
                    PipelineError::Config(format!(
                        "Failed to parse store file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            tracing::debug!(path = %path.display(), count = entries.len(), "Store loaded");
            entries
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, Versioned>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!(path = %self.path.display(), "Store saved");
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected: Option<u64>,
    ) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let version = check_version(key, entries.get(key), expected)?;

        let mut next = entries.clone();
        next.insert(key.to_string(), Versioned { value, version });
        self.persist(&next).await?;
        *entries = next;

        Ok(version)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }
}
