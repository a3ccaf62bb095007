//! Persistent journal of served action chunks (Sled).
//!
//! Purely diagnostic: a debugging session can pull past chunks back out and
//! replay them through the trajectory integrator.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::ActionChunk;
use crate::error::JournalError;

const CHUNKS_TREE: &str = "chunks";

/// One served request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub checkpoint_id: String,
    pub unnorm_key: String,
    pub task_description: String,
    pub actions: ActionChunk,
}

impl JournalEntry {
    pub fn now(
        checkpoint_id: &str,
        unnorm_key: &str,
        task_description: &str,
        actions: ActionChunk,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp,
            checkpoint_id: checkpoint_id.to_string(),
            unnorm_key: unnorm_key.to_string(),
            task_description: task_description.to_string(),
            actions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkJournal {
    db: sled::Db,
}

impl ChunkJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Wraps an already-open database, e.g. a temporary one in tests.
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    pub fn record(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let tree = self.db.open_tree(CHUNKS_TREE)?;
        let id = self.db.generate_id()?;

        // Zero-padded so lexicographic order is timestamp order.
        let key = format!("{:020}_{id:020}", entry.timestamp);
        let value = serde_json::to_vec(entry)?;

        tree.insert(key.as_bytes(), value)?;
        tree.flush()?;
        Ok(())
    }

    /// Entries recorded at or after `start_ts` (ms), oldest first.
    pub fn since(&self, start_ts: u64) -> Vec<JournalEntry> {
        let Ok(tree) = self.db.open_tree(CHUNKS_TREE) else {
            return Vec::new();
        };
        let start = format!("{start_ts:020}");

        tree.range(start.as_bytes()..)
            .filter_map(|res| match res {
                Ok(kv) => Some(kv),
                Err(e) => {
                    warn!("skipping unreadable journal entry: {e}");
                    None
                }
            })
            .filter_map(|(k, v)| match serde_json::from_slice::<JournalEntry>(&v) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    let key = String::from_utf8_lossy(&k);
                    warn!(%key, "skipping undecodable journal entry: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn latest(&self) -> Option<JournalEntry> {
        let tree = self.db.open_tree(CHUNKS_TREE).ok()?;
        let (_, v) = tree.last().ok()??;
        serde_json::from_slice(&v)
            .map_err(|e| warn!("latest journal entry is undecodable: {e}"))
            .ok()
    }

    pub fn len(&self) -> usize {
        self.db
            .open_tree(CHUNKS_TREE)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
