//! Content-addressed storage for context moved out of the payload

use crate::{Result, WardenError};
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::debug;

/// Prefix of every reference handed out by a store
pub const REFERENCE_PREFIX: &str = "sha256:";

/// External key/value store for large context items.
///
/// `put` returns an opaque reference; `get` resolves it back to the bytes.
pub trait ContentStore: Send + Sync {
    fn put<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>>;
    fn get<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Hex-encoded SHA-256 of the content
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn reference_for(bytes: &[u8]) -> String {
    format!("{}{}", REFERENCE_PREFIX, content_hash(bytes))
}

/// Strip and check the prefix, returning the bare hash
fn parse_reference(reference: &str) -> Result<&str> {
    let hash = reference
        .strip_prefix(REFERENCE_PREFIX)
        .ok_or_else(|| WardenError::ContentStore(format!("malformed reference: {}", reference)))?;
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WardenError::ContentStore(format!(
            "malformed reference: {}",
            reference
        )));
    }
    Ok(hash)
}

/// One file per blob under a root directory, named by content hash
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }
}

impl FsContentStore {
    async fn write_blob(&self, bytes: &[u8]) -> Result<String> {
        let reference = reference_for(bytes);
        let path = self.blob_path(&reference[REFERENCE_PREFIX.len()..]);
        let store_err = |path: &Path, e: std::io::Error| {
            WardenError::ContentStore(format!("{}: {}", path.display(), e))
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(reference);
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| store_err(&self.root, e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await.map_err(|e| store_err(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_err(&path, e))?;

        debug!("Stored {} bytes at {:?}", bytes.len(), path);
        Ok(reference)
    }

    async fn read_blob(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(parse_reference(reference)?);
        fs::read(&path)
            .await
            .map_err(|e| WardenError::ContentStore(format!("{}: {}", path.display(), e)))
    }
}

impl ContentStore for FsContentStore {
    fn put<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.write_blob(bytes))
    }

    fn get<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(self.read_blob(reference))
    }
}

/// Process-local store, mainly for tests and short-lived runs
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InMemoryContentStore {
    fn insert(&self, bytes: &[u8]) -> Result<String> {
        let reference = reference_for(bytes);
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| WardenError::ContentStore("store lock poisoned".to_string()))?;
        blobs
            .entry(reference.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(reference)
    }

    fn lookup(&self, reference: &str) -> Result<Vec<u8>> {
        parse_reference(reference)?;
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| WardenError::ContentStore("store lock poisoned".to_string()))?;
        blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| WardenError::ContentStore(format!("unknown reference: {}", reference)))
    }
}

impl ContentStore for InMemoryContentStore {
    fn put<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        let result = self.insert(bytes);
        Box::pin(async move { result })
    }

    fn get<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        let result = self.lookup(reference);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FsContentStore::new(dir.path().join("blobs"));

        let reference = store.put(b"large tool output").await.unwrap();
        assert!(reference.starts_with(REFERENCE_PREFIX));
        assert_eq!(store.get(&reference).await.unwrap(), b"large tool output");

        // Same content, same reference
        assert_eq!(store.put(b"large tool output").await.unwrap(), reference);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_bad_references() {
        let dir = TempDir::new().unwrap();
        let store = FsContentStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("sha256:nothex").await.is_err());
        let missing = format!("{}{}", REFERENCE_PREFIX, "0".repeat(64));
        assert!(store.get(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryContentStore::new();
        assert!(store.is_empty());
        let a = store.put(b"a").await.unwrap();
        store.put(b"a").await.unwrap();
        store.put(b"b").await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a).await.unwrap(), b"a");
    }
}
