use std::sync::Arc;

use weft_core::error::{Result, WeftError};

use super::{Agent, AgentExecutor, AgentOutput};
use crate::builder::{Workflow, WorkflowBuilder};

/// Chain agents so each one continues the transcript of the previous one.
/// The last agent yields the full transcript.
pub fn sequential(agents: Vec<Arc<dyn Agent>>) -> Result<Workflow> {
    let Some(first) = agents.first() else {
        return Err(WeftError::definition("sequential workflow needs at least one agent"));
    };

    let mut builder = WorkflowBuilder::new(first.name()).with_name("sequential");
    let last = agents.len() - 1;
    for (i, agent) in agents.iter().enumerate() {
        let output = if i == last {
            AgentOutput::Yield
        } else {
            AgentOutput::Transcript
        };
        builder = builder.add_executor(AgentExecutor::new(agent.clone()).with_output(output));
    }
    for pair in agents.windows(2) {
        builder = builder.add_edge(pair[0].name(), pair[1].name());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(matches!(
            sequential(Vec::new()),
            Err(WeftError::WorkflowDefinition(_))
        ));
    }
}
