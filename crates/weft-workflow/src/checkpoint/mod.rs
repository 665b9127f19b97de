mod memory;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use weft_core::config::{CheckpointStoreKind, WeftConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::CheckpointInfo;
use weft_core::message::{Envelope, Payload};
use weft_core::types::{CheckpointId, ExecutorId, RequestId, RunId};

use crate::builder::Workflow;
use crate::context::ScopedState;
use crate::edge::FanInState;

pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// A request for external input that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutstandingRequest {
    pub request_id: RequestId,
    pub executor_id: ExecutorId,
    pub payload: Payload,
}

/// Everything needed to continue a run after a completed superstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub workflow_name: String,
    /// Index of the last completed superstep.
    pub superstep: u64,
    /// Messages to deliver in the next superstep.
    pub pending: Vec<Envelope>,
    #[serde(default)]
    pub fan_in: FanInState,
    #[serde(default)]
    pub shared_state: ScopedState,
    #[serde(default)]
    pub executor_state: BTreeMap<ExecutorId, serde_json::Value>,
    #[serde(default)]
    pub outstanding_requests: Vec<OutstandingRequest>,
    #[serde(default)]
    pub outputs: Vec<Payload>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            checkpoint_id: self.id.clone(),
            run_id: self.run_id.clone(),
            superstep: self.superstep,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every executor and fan-in edge the checkpoint mentions must exist in
    /// `workflow`. No partial resume is attempted.
    pub fn validate_against(&self, workflow: &Workflow) -> Result<()> {
        let missing = |id: &ExecutorId, what: &str| {
            WeftError::CheckpointMismatch(format!(
                "{} references executor '{}', which workflow '{}' does not contain",
                what,
                id,
                workflow.name()
            ))
        };

        for env in &self.pending {
            for id in env.meta.target.iter().chain(env.meta.source.iter()) {
                if !workflow.contains(id) {
                    return Err(missing(id, "pending message"));
                }
            }
        }
        for id in self.executor_state.keys() {
            if !workflow.contains(id) {
                return Err(missing(id, "executor state"));
            }
        }
        for req in &self.outstanding_requests {
            if !workflow.contains(&req.executor_id) {
                return Err(missing(&req.executor_id, "outstanding request"));
            }
        }
        for (edge_id, buffers) in &self.fan_in {
            if workflow.edge_map().get(edge_id).is_none() {
                return Err(WeftError::CheckpointMismatch(format!(
                    "fan-in buffer for unknown edge '{}'",
                    edge_id
                )));
            }
            for id in buffers.keys() {
                if !workflow.contains(id) {
                    return Err(missing(id, "fan-in buffer"));
                }
            }
        }
        Ok(())
    }
}

/// Durable storage for checkpoints.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> BoxFuture<'_, Result<()>>;

    fn load(&self, id: &CheckpointId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// The checkpoint with the highest superstep for a run.
    fn latest_for_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Checkpoints of a run, ordered by superstep.
    fn list_for_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<CheckpointInfo>>>;

    fn delete_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<usize>>;
}

/// Open the store selected by `[checkpoint]`, if checkpointing is enabled.
pub fn open_store(config: &WeftConfig) -> Result<Option<Arc<dyn CheckpointStore>>> {
    if !config.checkpoint.enabled {
        return Ok(None);
    }
    let store: Arc<dyn CheckpointStore> = match config.checkpoint.store {
        CheckpointStoreKind::Memory => Arc::new(InMemoryCheckpointStore::new()),
        CheckpointStoreKind::Sqlite => {
            let path = config.checkpoint_path().ok_or_else(|| {
                WeftError::Config("checkpoint.path is required for the sqlite store".into())
            })?;
            Arc::new(SqliteCheckpointStore::open(&path)?)
        }
    };
    Ok(Some(store))
}

#[cfg(test)]
pub(crate) fn sample_checkpoint(run: &str, superstep: u64) -> Checkpoint {
    Checkpoint {
        id: CheckpointId::new(),
        run_id: RunId::from_str(run),
        workflow_name: "workflow".into(),
        superstep,
        pending: vec![Envelope::new(Payload::text("next")).with_target("reverse")],
        fan_in: FanInState::new(),
        shared_state: ScopedState::new(),
        executor_state: BTreeMap::new(),
        outstanding_requests: Vec::new(),
        outputs: Vec::new(),
        created_at: Utc::now(),
    }
}
