// Checkpoint Storage - Durable persistence of the policy value table

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Result as WafResult, WafError};

/// Backend that keeps the serialized policy between restarts
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the stored checkpoint, `None` if nothing was saved yet
    async fn load(&self) -> WafResult<Option<Vec<u8>>>;

    /// Replace the stored checkpoint
    async fn save(&self, bytes: &[u8]) -> WafResult<()>;

    /// Human readable location for logs
    fn location(&self) -> String;
}

/// Single JSON file on disk, replaced atomically via a temp file and rename
pub struct FileCheckpointStore {
    path: PathBuf,
    // Saves share one temp file; only one may write and rename at a time.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn ensure_parent_directory(&self) -> WafResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    WafError::checkpoint(
                        self.location(),
                        format!("Failed to create checkpoint directory: {}", e),
                    )
                })?;
                info!("Created checkpoint directory: {}", parent.display());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> WafResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                debug!("Read checkpoint {} ({} bytes)", self.path.display(), bytes.len());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WafError::checkpoint(
                self.location(),
                format!("Failed to read checkpoint: {}", e),
            )),
        }
    }

    async fn save(&self, bytes: &[u8]) -> WafResult<()> {
        let _guard = self.write_lock.lock().await;
        self.ensure_parent_directory().await?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await.map_err(|e| {
            WafError::checkpoint(
                self.location(),
                format!("Failed to write {}: {}", temp.display(), e),
            )
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            WafError::checkpoint(self.location(), format!("Failed to replace checkpoint: {}", e))
        })?;

        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory checkpoint storage (for testing or ephemeral deployments)
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    bytes: RwLock<Option<Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> WafResult<Option<Vec<u8>>> {
        Ok(self.bytes.read().await.clone())
    }

    async fn save(&self, bytes: &[u8]) -> WafResult<()> {
        *self.bytes.write().await = Some(bytes.to_vec());
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
