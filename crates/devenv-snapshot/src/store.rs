//! Object storage abstraction
//!
//! The same contract serves the remote snapshot bucket, the in-cluster
//! destination bucket, and the local Velero bucket read during generation.
//! Keys are plain object keys relative to the bucket.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

use devenv_common::{Error, Result};

use crate::digest;

/// Stream of object content chunks
pub type ByteChunks = BoxStream<'static, Result<Bytes>>;

/// Listing entry for a stored object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    /// Object key
    pub key: String,
    /// Object size in bytes
    pub size: u64,
}

/// Storage backend for snapshot data.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store reads and writes
    fn bucket(&self) -> &str;

    /// Read a whole object into memory
    ///
    /// Returns `Error::ObjectNotFound` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Stream an object's content in chunks
    async fn get_stream(&self, key: &str) -> Result<ByteChunks>;

    /// Write an object, sending its Content-MD5 for server-side validation
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Upload a local file with a precomputed base64 Content-MD5
    async fn put_file(&self, key: &str, path: &Path, content_md5: &str) -> Result<()>;

    /// List every object under `prefix`, recursively
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory object store.
///
/// Records the order of writes so callers can verify commit ordering.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    bucket: String,
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
    writes: Arc<RwLock<Vec<String>>>,
}

impl MemoryStore {
    /// Create an empty store for `bucket`
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Snapshot of every object currently stored
    pub fn contents(&self) -> Result<BTreeMap<String, Bytes>> {
        Ok(self.read_objects()?.clone())
    }

    /// Keys written so far, in write order
    pub fn write_log(&self) -> Result<Vec<String>> {
        self.writes
            .read()
            .map(|w| w.clone())
            .map_err(|_| Error::internal_with_context("memory_store", "lock poisoned"))
    }

    fn read_objects(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Bytes>>> {
        self.objects
            .read()
            .map_err(|_| Error::internal_with_context("memory_store", "lock poisoned"))
    }

    fn insert(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::internal_with_context("memory_store", "lock poisoned"))?
            .insert(key.to_string(), data);
        self.writes
            .write()
            .map_err(|_| Error::internal_with_context("memory_store", "lock poisoned"))?
            .push(key.to_string());
        Ok(())
    }
}

/// Chunk size used when streaming from memory
const MEMORY_CHUNK: usize = 64 * 1024;

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.read_objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            })
    }

    async fn get_stream(&self, key: &str) -> Result<ByteChunks> {
        let data = self.get(key).await?;
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(MEMORY_CHUNK)
            .map(|start| Ok(data.slice(start..(start + MEMORY_CHUNK).min(data.len()))))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.insert(key, data)
    }

    async fn put_file(&self, key: &str, path: &Path, content_md5: &str) -> Result<()> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let actual = digest::content_md5(&data);
        if actual != content_md5 {
            return Err(Error::storage(
                "put",
                &self.bucket,
                format!("Content-MD5 mismatch for {}", key),
            ));
        }
        self.insert(key, data)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .read_objects()?
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| ObjectInfo {
                key: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::internal_with_context("memory_store", "lock poisoned"))?
            .remove(key);
        Ok(())
    }
}
