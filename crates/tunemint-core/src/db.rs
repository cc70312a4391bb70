// ============================================================================
// TaskDb — Pending-Task Journal (redb)
// ============================================================================
// Persistent local journal of in-flight generation tasks so they survive a
// restart and can be re-checked on startup.
// Default path: ~/.tunemint/tunemint.redb (override via TUNEMINT_DB_PATH)
// ============================================================================

use anyhow::{anyhow, Result};
use redb::{Database, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::GenerationTask;

const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_tasks");

/// Embedded journal of pending generation tasks
pub struct TaskDb {
    db: Database,
    path: PathBuf,
}

impl TaskDb {
    /// Open (or create) the journal at the given path.
    /// If `path` is None, uses TUNEMINT_DB_PATH or ~/.tunemint/tunemint.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("TUNEMINT_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let dir = home.join(".tunemint");
            std::fs::create_dir_all(&dir)
                .map_err(|e| anyhow!("Failed to create .tunemint directory: {}", e))?;
            dir.join("tunemint.redb")
        };

        info!("Opening task journal at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open journal: {}", e))?;

        // Ensure the table exists by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(PENDING)
                .map_err(|e| anyhow!("Failed to create pending table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self { db, path: db_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store_pending(&self, task: &GenerationTask) -> Result<()> {
        let value = bincode::serialize(task)
            .map_err(|e| anyhow!("Failed to serialize task: {}", e))?;

        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let mut table = write_txn.open_table(PENDING)
                .map_err(|e| anyhow!("Failed to open pending table: {}", e))?;
            table.insert(task.task_id.as_str(), value.as_slice())
                .map_err(|e| anyhow!("Failed to insert task: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;

        debug!("Journaled pending task: {}", task.task_id);
        Ok(())
    }

    pub fn remove_pending(&self, task_id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        let removed;
        {
            let mut table = write_txn.open_table(PENDING)
                .map_err(|e| anyhow!("Failed to open pending table: {}", e))?;
            removed = table.remove(task_id)
                .map_err(|e| anyhow!("Failed to remove task: {}", e))?
                .is_some();
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Removed task from journal: {}", task_id);
        }
        Ok(removed)
    }

    pub fn list_pending(&self) -> Result<Vec<GenerationTask>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(PENDING)
            .map_err(|e| anyhow!("Failed to open pending table: {}", e))?;

        let mut results = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate tasks: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let task: GenerationTask = bincode::deserialize(value.value())
                .map_err(|e| anyhow!("Failed to deserialize task: {}", e))?;
            results.push(task);
        }
        Ok(results)
    }
}
