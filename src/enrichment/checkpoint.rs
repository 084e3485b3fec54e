use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::state::EnrichmentState;
use crate::{data_dir::write_atomic, doc_id::RecordId, error::Result};

/// A record that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    /// Hash of the text the record had when it was enriched. An entry whose
    /// record has since changed is not reused.
    pub content_hash: String,
    pub state: EnrichmentState,
}

/// Durable progress of an interrupted enrichment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed: BTreeMap<RecordId, CheckpointEntry>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            processed: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl Checkpoint {
    /// Read the checkpoint at `path`. A missing file is an empty checkpoint;
    /// an unreadable one is discarded with a warning, since it only ever
    /// costs repeated API calls.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read(path)?;
        match serde_json::from_slice(&raw) {
            Ok(checkpoint) => Ok(checkpoint),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "discarding unreadable enrichment checkpoint"
                );
                Ok(Self::default())
            }
        }
    }
}

/// Single writer for the checkpoint of one enrichment run.
///
/// Workers report terminal states through [`CheckpointWriter::record`]; the
/// file is rewritten atomically by [`CheckpointWriter::flush`]. Both go
/// through one lock, so writes never interleave.
#[derive(Debug)]
pub struct CheckpointWriter {
    path: Option<PathBuf>,
    checkpoint: Mutex<Checkpoint>,
}

impl CheckpointWriter {
    /// `path == None` keeps progress in memory only.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let checkpoint = match &path {
            Some(p) => Checkpoint::load(p)?,
            None => Checkpoint::default(),
        };
        Ok(Self {
            path,
            checkpoint: Mutex::new(checkpoint),
        })
    }

    /// Terminal entries recorded so far, including resumed ones.
    pub async fn snapshot(&self) -> BTreeMap<RecordId, CheckpointEntry> {
        self.checkpoint.lock().await.processed.clone()
    }

    /// Drop resumed entries that do not belong to this run.
    pub async fn retain(&self, keep: impl Fn(RecordId, &CheckpointEntry) -> bool) {
        self.checkpoint
            .lock()
            .await
            .processed
            .retain(|id, entry| keep(*id, entry));
    }

    pub async fn record(&self, id: RecordId, entry: CheckpointEntry) {
        debug_assert!(entry.state.is_terminal());
        self.checkpoint.lock().await.processed.insert(id, entry);
    }

    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut checkpoint = self.checkpoint.lock().await;
        checkpoint.updated_at = Utc::now();
        let json = serde_json::to_vec(&*checkpoint)?;
        write_atomic(path, &json)?;
        debug!(
            processed = checkpoint.processed.len(),
            "enrichment checkpoint written"
        );
        Ok(())
    }

    /// Delete the checkpoint file after a fully successful run.
    pub async fn clear(&self) -> Result<()> {
        let mut checkpoint = self.checkpoint.lock().await;
        checkpoint.processed.clear();
        if let Some(path) = &self.path {
            remove_checkpoint(path)?;
        }
        Ok(())
    }
}

pub fn remove_checkpoint(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
