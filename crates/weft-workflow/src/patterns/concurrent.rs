use std::sync::Arc;

use weft_core::error::{Result, WeftError};
use weft_core::types::{ChatMessage, Role};

use super::{Agent, AgentExecutor, AgentOutput};
use crate::builder::{Workflow, WorkflowBuilder};
use crate::executor::FunctionExecutor;

const DISPATCH: &str = "dispatch";
const AGGREGATE: &str = "aggregate";

/// Send the same transcript to every agent at once and yield their
/// combined assistant replies, in agent order.
pub fn concurrent(agents: Vec<Arc<dyn Agent>>) -> Result<Workflow> {
    if agents.len() < 2 {
        return Err(WeftError::definition("concurrent workflow needs at least two agents"));
    }

    let dispatch = FunctionExecutor::new(DISPATCH)
        .handler::<String, _, _>(|prompt, ctx| async move {
            ctx.send_message(&vec![ChatMessage::user(prompt)])
        })
        .handler::<ChatMessage, _, _>(|message, ctx| async move { ctx.send_message(&vec![message]) })
        .handler::<Vec<ChatMessage>, _, _>(|transcript, ctx| async move { ctx.send_message(&transcript) })
        .shareable();

    let aggregate = FunctionExecutor::new(AGGREGATE)
        .handler::<Vec<Vec<ChatMessage>>, _, _>(|replies, ctx| async move {
            let combined: Vec<ChatMessage> = replies
                .into_iter()
                .flatten()
                .filter(|m| m.role == Role::Assistant)
                .collect();
            ctx.yield_output(&combined)
        })
        .shareable();

    let names: Vec<String> = agents.iter().map(|a| a.name().to_string()).collect();
    let mut builder = WorkflowBuilder::new(DISPATCH)
        .with_name("concurrent")
        .add_executor(dispatch)
        .add_executor(aggregate);
    for agent in agents {
        builder = builder.add_executor(AgentExecutor::new(agent).with_output(AgentOutput::Replies));
    }
    builder
        .add_fan_out_edge(DISPATCH, names.clone())
        .add_fan_in_edge(names, AGGREGATE)
        .build()
}
