pub mod builder;
pub mod checkpoint;
pub mod context;
pub mod edge;
pub mod executor;
pub mod patterns;
pub mod runner;
pub mod streaming;
pub mod subworkflow;
pub mod viz;

pub use builder::{ExecutorFactory, SwitchBuilder, Workflow, WorkflowBuilder};
pub use checkpoint::{
    open_store, Checkpoint, CheckpointStore, InMemoryCheckpointStore, OutstandingRequest,
    SqliteCheckpointStore,
};
pub use context::{ScopedState, WorkflowContext};
pub use edge::{Condition, Edge, EdgeKind, FanInState, SwitchCase};
pub use executor::{Executor, ExecutorState, FunctionExecutor, HandlerFn, HandlerSet};
pub use patterns::{
    concurrent, handoff_tool_name, sequential, Agent, AgentExecutor, AgentOutput, HandoffBuilder,
    HandoffTurn, HANDOFF_END,
};
pub use runner::{RunOptions, RunResult, RunStatus, WorkflowRunner};
pub use streaming::StreamingRun;
pub use subworkflow::SubworkflowExecutor;
pub use viz::to_dot;
