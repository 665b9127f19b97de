//! Weft: typed workflow graphs executed in bulk-synchronous supersteps.
//!
//! Build a [`Workflow`] from executors and edges, then drive it with
//! [`Workflow::run`], a [`WorkflowRunner`] or a [`StreamingRun`].

pub use weft_core::{
    config, error, event, message, types, Envelope, EventBus, EventKind, EventWatchers, Payload,
    Result, TypeTag, WeftConfig, WeftError, WorkflowEvent, WorkflowMessage,
};
pub use weft_workflow::*;

/// The names most workflows need.
pub mod prelude {
    pub use weft_core::types::{ChatMessage, ExecutorId, RequestId, Role, RunId};
    pub use weft_core::{
        Envelope, EventKind, Payload, Result, TypeTag, WeftConfig, WeftError, WorkflowEvent,
        WorkflowMessage,
    };
    pub use weft_workflow::{
        Agent, Checkpoint, CheckpointStore, Condition, Executor, FunctionExecutor, RunOptions,
        RunStatus, StreamingRun, Workflow, WorkflowBuilder, WorkflowContext, WorkflowRunner,
    };
}
