use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use weft_core::error::{Result, WeftError};
use weft_core::event::CheckpointInfo;
use weft_core::types::{CheckpointId, RunId};

use super::{Checkpoint, CheckpointStore};

/// Persistent checkpoint store backed by SQLite.
///
/// One row per checkpoint; the snapshot itself is stored as JSON.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

fn store_err(context: &str, e: impl std::fmt::Display) -> WeftError {
    WeftError::Checkpoint(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn =
            Connection::open(path).map_err(|e| store_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| store_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                 id TEXT PRIMARY KEY,
                 run_id TEXT NOT NULL,
                 workflow_name TEXT NOT NULL,
                 superstep INTEGER NOT NULL,
                 checkpoint_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_wcp_run_superstep
                 ON workflow_checkpoints(run_id, superstep DESC);",
        )
        .map_err(|e| store_err("Failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn save_sync(&self, cp: &Checkpoint) -> Result<()> {
        let json = cp.to_json()?;
        let conn = self.conn.lock().map_err(|e| store_err("Lock poisoned", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO workflow_checkpoints
                 (id, run_id, workflow_name, superstep, checkpoint_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cp.id.as_str(),
                cp.run_id.as_str(),
                cp.workflow_name,
                cp.superstep as i64,
                json,
                cp.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| store_err("Failed to save checkpoint", e))?;
        Ok(())
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().map_err(|e| store_err("Lock poisoned", e))?;
        let json: Option<String> = conn
            .query_row(sql, params![key], |row| row.get(0))
            .optional()
            .map_err(|e| store_err("Failed to load checkpoint", e))?;
        json.map(|j| Checkpoint::from_json(&j)).transpose()
    }

    fn list_sync(&self, run_id: &RunId) -> Result<Vec<CheckpointInfo>> {
        let conn = self.conn.lock().map_err(|e| store_err("Lock poisoned", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, superstep FROM workflow_checkpoints
                 WHERE run_id = ?1
                 ORDER BY superstep ASC, created_at ASC",
            )
            .map_err(|e| store_err("Failed to prepare query", e))?;
        let rows = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok(CheckpointInfo {
                    checkpoint_id: CheckpointId(row.get(0)?),
                    run_id: RunId(row.get(1)?),
                    superstep: row.get::<_, i64>(2)? as u64,
                })
            })
            .map_err(|e| store_err("Failed to list checkpoints", e))?;

        let mut infos = Vec::new();
        for row in rows {
            infos.push(row.map_err(|e| store_err("Failed to read checkpoint row", e))?);
        }
        Ok(infos)
    }

    fn delete_sync(&self, run_id: &RunId) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| store_err("Lock poisoned", e))?;
        conn.execute(
            "DELETE FROM workflow_checkpoints WHERE run_id = ?1",
            params![run_id.as_str()],
        )
        .map_err(|e| store_err("Failed to delete checkpoints", e))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move { self.save_sync(&checkpoint) })
    }

    fn load(&self, id: &CheckpointId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let id = id.clone();
        Box::pin(async move {
            self.query_one(
                "SELECT checkpoint_json FROM workflow_checkpoints WHERE id = ?1",
                id.as_str(),
            )
        })
    }

    fn latest_for_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.query_one(
                "SELECT checkpoint_json FROM workflow_checkpoints
                 WHERE run_id = ?1
                 ORDER BY superstep DESC, created_at DESC
                 LIMIT 1",
                run_id.as_str(),
            )
        })
    }

    fn list_for_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<CheckpointInfo>>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.list_sync(&run_id) })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<usize>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.delete_sync(&run_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::sample_checkpoint;

    fn temp_store() -> (tempfile::TempDir, SqliteCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCheckpointStore::open(&dir.path().join("nested/checkpoints.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (_dir, store) = temp_store();
        let cp = sample_checkpoint("run-1", 2);
        store.save(&cp).await.unwrap();

        let loaded = store.load(&cp.id).await.unwrap().unwrap();
        assert_eq!(loaded.superstep, 2);
        assert_eq!(loaded.pending.len(), 1);
        assert_eq!(loaded.pending[0].payload.decode::<String>().unwrap(), "next");
    }

    #[tokio::test]
    async fn test_latest_and_list() {
        let (_dir, store) = temp_store();
        for step in [0, 2, 1] {
            store.save(&sample_checkpoint("run-1", step)).await.unwrap();
        }
        let run = RunId::from_str("run-1");

        let latest = store.latest_for_run(&run).await.unwrap().unwrap();
        assert_eq!(latest.superstep, 2);

        let steps: Vec<u64> = store
            .list_for_run(&run)
            .await
            .unwrap()
            .iter()
            .map(|i| i.superstep)
            .collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_save_same_id_replaces() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let mut cp = sample_checkpoint("run-1", 0);
        store.save(&cp).await.unwrap();
        cp.superstep = 4;
        store.save(&cp).await.unwrap();

        let listed = store.list_for_run(&cp.run_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].superstep, 4);
    }

    #[tokio::test]
    async fn test_delete_run() {
        let (_dir, store) = temp_store();
        store.save(&sample_checkpoint("run-del", 0)).await.unwrap();
        store.save(&sample_checkpoint("run-del", 1)).await.unwrap();

        let run = RunId::from_str("run-del");
        assert_eq!(store.delete_run(&run).await.unwrap(), 2);
        assert!(store.latest_for_run(&run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (_dir, store) = temp_store();
        assert!(store.load(&CheckpointId::new()).await.unwrap().is_none());
    }
}
