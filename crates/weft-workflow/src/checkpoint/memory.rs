use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use weft_core::error::Result;
use weft_core::event::CheckpointInfo;
use weft_core::types::{CheckpointId, RunId};

use super::{Checkpoint, CheckpointStore};

/// Process-local checkpoint store.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<CheckpointId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn for_run(&self, run_id: &RunId) -> Vec<Checkpoint> {
        let map = self.checkpoints.read().await;
        let mut list: Vec<Checkpoint> = map
            .values()
            .filter(|cp| &cp.run_id == run_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.superstep.cmp(&b.superstep).then(a.created_at.cmp(&b.created_at)));
        list
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            self.checkpoints
                .write()
                .await
                .insert(checkpoint.id.clone(), checkpoint);
            Ok(())
        })
    }

    fn load(&self, id: &CheckpointId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.checkpoints.read().await.get(&id).cloned()) })
    }

    fn latest_for_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let run_id = run_id.clone();
        Box::pin(async move { Ok(self.for_run(&run_id).await.pop()) })
    }

    fn list_for_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<CheckpointInfo>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            Ok(self
                .for_run(&run_id)
                .await
                .iter()
                .map(Checkpoint::info)
                .collect())
        })
    }

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<usize>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let mut map = self.checkpoints.write().await;
            let before = map.len();
            map.retain(|_, cp| cp.run_id != run_id);
            Ok(before - map.len())
        })
    }
}
