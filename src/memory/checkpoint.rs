//! Durable session checkpoints.
//!
//! A checkpoint is one JSON document holding the working-memory operations,
//! usage state and active profile name. Files are replaced atomically: the
//! new content is written and synced to a sibling temp file, then renamed over
//! the target, so a failed write never corrupts the previous checkpoint.

use super::operation::{observe_sequence, Operation};
use crate::optimizer::content_hash;
use crate::window::UsageState;
use crate::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Schema version written into every checkpoint
pub const CHECKPOINT_VERSION: u32 = 1;

/// Hex characters of the content hash used as checkpoint id
const CHECKPOINT_ID_LEN: usize = 16;

/// Snapshot of a MemoryManager session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub window_size: usize,
    pub active_profile_name: String,
    pub usage_state: UsageState,
    /// Working memory contents, oldest first
    pub operations: Vec<Operation>,
}

impl Checkpoint {
    pub fn new(
        window_size: usize,
        active_profile_name: impl Into<String>,
        usage_state: UsageState,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            window_size,
            active_profile_name: active_profile_name.into(),
            usage_state,
            operations,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and version-check a serialized checkpoint
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| WardenError::RestoreValidation(format!("malformed checkpoint: {}", e)))?;

        match value.get("version").and_then(|v| v.as_u64()) {
            Some(v) if v == u64::from(CHECKPOINT_VERSION) => {}
            Some(v) => {
                return Err(WardenError::RestoreValidation(format!(
                    "unsupported checkpoint version {} (expected {})",
                    v, CHECKPOINT_VERSION
                )))
            }
            None => {
                return Err(WardenError::RestoreValidation(
                    "checkpoint has no version field".to_string(),
                ))
            }
        }

        let checkpoint: Self = serde_json::from_value(value)
            .map_err(|e| WardenError::RestoreValidation(format!("malformed checkpoint: {}", e)))?;
        for op in &checkpoint.operations {
            observe_sequence(op.seq);
        }
        Ok(checkpoint)
    }

    /// Content-hash id of serialized checkpoint bytes
    pub fn id_for(bytes: &[u8]) -> String {
        let mut id = content_hash(bytes);
        id.truncate(CHECKPOINT_ID_LEN);
        id
    }

    /// Write atomically to `path`, returning the checkpoint id
    pub async fn save(&self, path: &Path) -> Result<String> {
        let bytes = self.to_bytes()?;
        write_atomic(path, &bytes).await?;
        let id = Self::id_for(&bytes);
        info!(
            "Checkpoint {} written to {:?} ({} operations, {} tokens used)",
            id,
            path,
            self.operations.len(),
            self.usage_state.tokens_used
        );
        Ok(id)
    }

    /// Read and validate the checkpoint at `path`
    pub async fn load(path: &Path) -> Result<Self> {
        Ok(Self::load_with_id(path).await?.0)
    }

    /// Like [`load`](Self::load), also returning the checkpoint id
    pub async fn load_with_id(path: &Path) -> Result<(Self, String)> {
        let bytes = fs::read(path).await.map_err(|source| WardenError::CheckpointIo {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint = Self::from_slice(&bytes)?;
        let id = Self::id_for(&bytes);
        debug!("Loaded checkpoint {} from {:?}", id, path);
        Ok((checkpoint, id))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

/// Write-then-rename. The temp file is removed when any step fails.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let io_err = |source: std::io::Error| WardenError::CheckpointIo {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let tmp = temp_path(path);
    let written: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(source) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_err(source));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Zone;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        Checkpoint::new(
            32_000,
            "aggressive",
            UsageState {
                tokens_used: 1_200,
                limit: 24_000,
                zone: Zone::Green,
            },
            vec![
                Operation::new("task_start", json!("Implement login"), 200),
                Operation::new("agent_response", json!({"files": ["auth.rs"]}), 1_000),
            ],
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("checkpoint.json");
        let checkpoint = sample();

        let id = checkpoint.save(&path).await.unwrap();
        assert_eq!(id.len(), 16);
        assert!(!temp_path(&path).exists());

        let loaded = Checkpoint::load(&path).await.unwrap();
        assert_eq!(loaded, checkpoint);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(Checkpoint::id_for(&bytes), id);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        sample().save(&path).await.unwrap();

        let mut next = sample();
        next.operations.truncate(1);
        next.save(&path).await.unwrap();

        assert_eq!(Checkpoint::load(&path).await.unwrap().operations.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        // A directory at the target path makes the final rename fail
        let path = dir.path().join("checkpoint.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), b"prior").unwrap();

        let err = sample().save(&path).await.unwrap_err();
        assert!(matches!(err, WardenError::CheckpointIo { .. }));
        assert_eq!(std::fs::read(path.join("keep")).unwrap(), b"prior");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = Checkpoint::load(&dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::CheckpointIo { .. }));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["version"] = json!(99);
        let bytes = serde_json::to_vec(&value).unwrap();
        let err = Checkpoint::from_slice(&bytes).unwrap_err();
        assert!(matches!(err, WardenError::RestoreValidation(_)));

        let err = Checkpoint::from_slice(b"{\"operations\": []}").unwrap_err();
        assert!(matches!(err, WardenError::RestoreValidation(_)));

        let err = Checkpoint::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, WardenError::RestoreValidation(_)));
    }
}
