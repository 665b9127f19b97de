use futures::future::BoxFuture;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::WorkflowEvent;
use weft_core::message::{Envelope, TypeTag};
use weft_core::types::ExecutorId;

use crate::builder::Workflow;
use crate::context::WorkflowContext;
use crate::executor::Executor;
use crate::runner::{RunOptions, RunStatus, WorkflowRunner};

/// Runs a nested workflow to idle for every message it receives.
///
/// Nested outputs are sent on as messages of the parent. Nested warnings
/// and errors surface as `SubworkflowWarning` / `SubworkflowError`.
pub struct SubworkflowExecutor {
    id: ExecutorId,
    workflow: Workflow,
    options: RunOptions,
    input_types: Vec<TypeTag>,
}

impl SubworkflowExecutor {
    pub fn new(id: impl Into<ExecutorId>, workflow: Workflow) -> Self {
        let input_types = workflow.input_types();
        Self {
            id: id.into(),
            workflow,
            options: RunOptions::default(),
            input_types,
        }
    }

    /// Options for nested runs. The cancel token is always derived from the
    /// parent run.
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    fn nested_failure(&self, ctx: &WorkflowContext, message: String) -> WeftError {
        ctx.add_event(WorkflowEvent::SubworkflowError {
            executor_id: self.id.clone(),
            message: message.clone(),
        });
        WeftError::Subworkflow {
            executor: self.id.to_string(),
            message,
        }
    }

    async fn run_nested(&self, envelope: Envelope, ctx: WorkflowContext) -> Result<()> {
        let mut options = self.options.clone();
        options.cancel = ctx.child_cancel_token();

        let mut runner = WorkflowRunner::start_payload(&self.workflow, envelope.payload, options)
            .map_err(|e| self.nested_failure(&ctx, e.to_string()))?;
        debug!(
            executor_id = %self.id,
            nested_run = %runner.run_id(),
            workflow = %self.workflow.name(),
            "Sub-workflow started"
        );
        let events = runner.run_until_idle().await;

        let mut failure = None;
        for event in events {
            match event {
                WorkflowEvent::Output { payload, .. } => ctx.send_payload(payload),
                WorkflowEvent::Warning { message, .. } => {
                    ctx.add_event(WorkflowEvent::SubworkflowWarning {
                        executor_id: self.id.clone(),
                        message,
                    });
                }
                WorkflowEvent::Error { message, .. } => {
                    ctx.add_event(WorkflowEvent::SubworkflowError {
                        executor_id: self.id.clone(),
                        message,
                    });
                }
                WorkflowEvent::Failed { error, .. } => failure = Some(error),
                event @ (WorkflowEvent::AgentRunUpdate { .. }
                | WorkflowEvent::AgentRunResponse { .. }
                | WorkflowEvent::Custom { .. }
                | WorkflowEvent::SubworkflowWarning { .. }
                | WorkflowEvent::SubworkflowError { .. }) => ctx.add_event(event),
                _ => {}
            }
        }

        match runner.status() {
            RunStatus::Completed => Ok(()),
            RunStatus::Cancelled => Err(WeftError::Cancelled),
            RunStatus::Halted => {
                warn!(executor_id = %self.id, "Sub-workflow halted waiting for input");
                Err(self.nested_failure(
                    &ctx,
                    "nested workflow requested external input, which is not forwarded".into(),
                ))
            }
            status => Err(self.nested_failure(
                &ctx,
                failure.unwrap_or_else(|| format!("nested run ended as {:?}", status)),
            )),
        }
    }
}

impl Executor for SubworkflowExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<TypeTag> {
        self.input_types.clone()
    }

    fn handle(&self, envelope: Envelope, ctx: WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.run_nested(envelope, ctx))
    }

    fn validate(&self) -> Result<()> {
        if self.input_types.is_empty() {
            return Err(WeftError::definition(format!(
                "sub-workflow '{}' has a start executor without handlers",
                self.id
            )));
        }
        Ok(())
    }
}
