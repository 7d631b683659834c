//! Durable per-partition read positions.
//!
//! The stored value is the exclusive end offset of the last batch whose rows reached the
//! sink, which is also the next offset to pull. It is only ever written after the sink
//! write for that batch has succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::StartingOffsets;
use crate::errors::{CheckpointError, IngestionError};
use crate::model::{Offset, PartitionId};
use crate::source::{LogSource, resolve_starting_offset};

#[trait_variant::make(Send)]
pub trait CheckpointStore: Send + Sync + 'static {
    async fn get(&self, partition: PartitionId) -> Result<Option<Offset>, CheckpointError>;

    /// Replaces the stored offset. Must be durable once it returns.
    async fn put(&self, partition: PartitionId, offset: Offset) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CheckpointFile {
    topic: String,
    partition: PartitionId,
    offset: Offset,
    committed_at: DateTime<Utc>,
}

/// One JSON file per partition, replaced atomically through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    topic: String,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl AsRef<Path>, topic: &str) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            topic: topic.to_string(),
        })
    }

    fn path(&self, partition: PartitionId) -> PathBuf {
        self.dir.join(format!("{}-{}.json", self.topic, partition))
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, partition: PartitionId) -> Result<Option<Offset>, CheckpointError> {
        let content = match tokio::fs::read(self.path(partition)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Read {
                    partition,
                    reason: e.to_string(),
                });
            }
        };
        let file: CheckpointFile =
            serde_json::from_slice(&content).map_err(|e| CheckpointError::Corrupt {
                partition,
                reason: e.to_string(),
            })?;
        if file.partition != partition || file.topic != self.topic {
            return Err(CheckpointError::Corrupt {
                partition,
                reason: format!(
                    "file belongs to {}-{}",
                    file.topic, file.partition
                ),
            });
        }
        Ok(Some(file.offset))
    }

    async fn put(&self, partition: PartitionId, offset: Offset) -> Result<(), CheckpointError> {
        let persist_error = |e: std::io::Error| CheckpointError::Persist {
            partition,
            reason: e.to_string(),
        };
        let file = CheckpointFile {
            topic: self.topic.clone(),
            partition,
            offset,
            committed_at: Utc::now(),
        };
        let content = serde_json::to_vec_pretty(&file).map_err(|e| CheckpointError::Persist {
            partition,
            reason: e.to_string(),
        })?;

        let path = self.path(partition);
        let tmp_path = path.with_extension("json.tmp");
        let mut out = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await
            .map_err(persist_error)?;
        out.write_all(&content).await.map_err(persist_error)?;
        out.flush().await.map_err(persist_error)?;
        out.sync_all().await.map_err(persist_error)?;
        drop(out);
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(persist_error)?;

        // the data is already synced; only the rename may still be lost on power failure
        if let Err(e) = sync_dir(&self.dir).await {
            warn!(
                partition,
                offset,
                dir = %self.dir.display(),
                "Failed to sync checkpoint directory, rename may not be durable: {}",
                e
            );
        }
        Ok(())
    }
}

/// Flushes directory entries, making a completed rename durable.
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

/// In-process store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    offsets: Arc<Mutex<HashMap<PartitionId, Offset>>>,
    failures: Arc<Mutex<u32>>,
}

impl MemoryCheckpointStore {
    /// Makes the next `count` calls to `put` fail without storing anything.
    pub fn fail_next_puts(&self, count: u32) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }

    pub fn snapshot(&self) -> HashMap<PartitionId, Offset> {
        self.offsets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, partition: PartitionId) -> Result<Option<Offset>, CheckpointError> {
        Ok(self
            .offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&partition)
            .copied())
    }

    async fn put(&self, partition: PartitionId, offset: Offset) -> Result<(), CheckpointError> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(CheckpointError::Persist {
                    partition,
                    reason: "injected failure".to_string(),
                });
            }
        }
        self.offsets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(partition, offset);
        Ok(())
    }
}

/// Sole writer of checkpoints.
pub struct CheckpointManager<C> {
    store: C,
}

impl<C: CheckpointStore> CheckpointManager<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Next offset to pull for `partition`, or 0 if it was never committed.
    pub async fn load(&self, partition: PartitionId) -> Result<Offset, CheckpointError> {
        Ok(self.store.get(partition).await?.unwrap_or(0))
    }

    /// Like [`CheckpointManager::load`], but resolves `policy` against the source when
    /// no checkpoint exists yet.
    pub async fn load_or_resolve<S: LogSource>(
        &self,
        source: &S,
        partition: PartitionId,
        policy: StartingOffsets,
    ) -> Result<Offset, IngestionError> {
        if let Some(offset) = self.store.get(partition).await? {
            return Ok(offset);
        }
        let offset = resolve_starting_offset(source, partition, policy).await?;
        debug!(partition, offset, ?policy, "No checkpoint, starting from policy");
        Ok(offset)
    }

    /// Records that everything before `end_offset` is in the sink.
    ///
    /// A checkpoint never moves backwards; an older offset is ignored.
    pub async fn commit(
        &self,
        partition: PartitionId,
        end_offset: Offset,
    ) -> Result<Offset, CheckpointError> {
        if let Some(current) = self.store.get(partition).await? {
            if end_offset < current {
                warn!(
                    partition,
                    current, end_offset, "Ignoring checkpoint that would move backwards"
                );
                return Ok(current);
            }
        }
        self.store.put(partition, end_offset).await?;
        debug!(partition, end_offset, "Committed checkpoint");
        Ok(end_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;

    #[tokio::test]
    async fn test_file_store_round_trip_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "vendas").await.unwrap();

        assert_eq!(store.get(0).await.unwrap(), None);
        store.put(0, 150).await.unwrap();
        store.put(1, 7).await.unwrap();
        store.put(0, 200).await.unwrap();

        let reopened = FileCheckpointStore::open(dir.path(), "vendas").await.unwrap();
        assert_eq!(reopened.get(0).await.unwrap(), Some(200));
        assert_eq!(reopened.get(1).await.unwrap(), Some(7));
        assert!(!dir.path().join("vendas-0.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_sync_dir_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();
        assert!(sync_dir(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_file_store_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path(), "vendas").await.unwrap();
        std::fs::write(dir.path().join("vendas-3.json"), b"{not json").unwrap();

        assert!(matches!(
            store.get(3).await,
            Err(CheckpointError::Corrupt { partition: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let manager = CheckpointManager::new(MemoryCheckpointStore::default());
        assert_eq!(manager.load(0).await.unwrap(), 0);

        assert_eq!(manager.commit(0, 150).await.unwrap(), 150);
        assert_eq!(manager.commit(0, 100).await.unwrap(), 150);
        assert_eq!(manager.load(0).await.unwrap(), 150);
    }

    #[tokio::test]
    async fn test_failed_put_keeps_previous_offset() {
        let store = MemoryCheckpointStore::default();
        let manager = CheckpointManager::new(store.clone());
        manager.commit(0, 100).await.unwrap();

        store.fail_next_puts(1);
        assert!(manager.commit(0, 150).await.is_err());
        assert_eq!(manager.load(0).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_policy_only_applies_without_checkpoint() {
        let source = MemorySource::new(1);
        for i in 0..4 {
            source.append(0, vec![i]);
        }
        let manager = CheckpointManager::new(MemoryCheckpointStore::default());

        let offset = manager
            .load_or_resolve(&source, 0, StartingOffsets::Latest)
            .await
            .unwrap();
        assert_eq!(offset, 4);

        manager.commit(0, 2).await.unwrap();
        let offset = manager
            .load_or_resolve(&source, 0, StartingOffsets::Latest)
            .await
            .unwrap();
        assert_eq!(offset, 2);
    }
}
