use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::message::{Envelope, TypeTag, WorkflowMessage};
use weft_core::types::{ChatMessage, ContentBlock, ExecutorId, Role, ToolDefinition};

use super::{run_agent_turn, transcript_from, transcript_types, Agent};
use crate::builder::{Workflow, WorkflowBuilder};
use crate::context::WorkflowContext;
use crate::edge::Condition;
use crate::executor::Executor;

/// Id of the executor that ends a handoff conversation.
pub const HANDOFF_END: &str = "handoff_end";

/// The rolling conversation passed between handoff participants.
///
/// The transcript is kept whole, tool traffic included. Each agent gets a
/// relabelled view of it when its turn comes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffTurn {
    pub transcript: Vec<ChatMessage>,
    /// Executor the last agent transferred control to, if any.
    #[serde(default)]
    pub handoff_to: Option<ExecutorId>,
}

impl WorkflowMessage for HandoffTurn {
    fn type_tag() -> TypeTag {
        TypeTag::new("handoff_turn")
    }
}

struct ToolNames {
    invalid: Regex,
}

impl ToolNames {
    fn new() -> Result<Self> {
        let invalid = Regex::new(r"[^A-Za-z0-9_-]")
            .map_err(|e| WeftError::definition(format!("tool name pattern: {}", e)))?;
        Ok(Self { invalid })
    }

    fn sanitize(&self, name: &str) -> String {
        self.invalid.replace_all(name, "_").into_owned()
    }

    fn transfer_tool(&self, target: &str) -> String {
        format!("transfer_to_{}", self.sanitize(target))
    }
}

/// The tool an agent calls to hand the conversation to `target`.
pub fn handoff_tool_name(target: &str) -> Result<String> {
    Ok(ToolNames::new()?.transfer_tool(target))
}

struct HandoffTarget {
    tool: ToolDefinition,
    executor: ExecutorId,
}

struct HandoffAgentExecutor {
    id: ExecutorId,
    agent: Arc<dyn Agent>,
    targets: Vec<HandoffTarget>,
}

impl HandoffAgentExecutor {
    /// The transcript as this agent should see it: its own turns as
    /// assistant messages, other agents' turns as user context.
    fn view(&self, transcript: &[ChatMessage]) -> Vec<ChatMessage> {
        transcript
            .iter()
            .cloned()
            .filter_map(|mut m| match m.author_name.as_deref() {
                Some(author) if author == self.agent.name() => {
                    if m.role == Role::User {
                        m.role = Role::Assistant;
                    }
                    Some(m)
                }
                Some(_) => as_peer_context(m),
                None => Some(m),
            })
            .collect()
    }

    async fn turn(&self, envelope: Envelope, ctx: WorkflowContext) -> Result<()> {
        let turn = if envelope.payload.is::<HandoffTurn>() {
            envelope.payload.decode::<HandoffTurn>()?
        } else {
            HandoffTurn {
                transcript: transcript_from(&envelope.payload)?,
                handoff_to: None,
            }
        };

        let tools = self.targets.iter().map(|t| t.tool.clone()).collect();
        let produced =
            run_agent_turn(self.agent.as_ref(), &self.id, self.view(&turn.transcript), tools, &ctx)
                .await?;

        let handoff_to = produced
            .iter()
            .flat_map(|m| m.tool_uses())
            .find_map(|(_, name, _)| self.targets.iter().find(|t| t.tool.name == name))
            .map(|t| t.executor.clone());
        if let Some(target) = &handoff_to {
            debug!(from = %self.id, to = %target, "Handoff requested");
        }

        let mut transcript = turn.transcript;
        transcript.extend(produced);
        ctx.send_message(&HandoffTurn {
            transcript,
            handoff_to,
        })
    }
}

/// Relabel another agent's turn as user context: assistant becomes user,
/// tool traffic is dropped.
fn as_peer_context(mut message: ChatMessage) -> Option<ChatMessage> {
    if message.role == Role::Tool {
        return None;
    }
    message
        .content
        .retain(|b| matches!(b, ContentBlock::Text { .. }));
    if message.content.is_empty() {
        return None;
    }
    if message.role == Role::Assistant {
        message.role = Role::User;
    }
    Some(message)
}

impl Executor for HandoffAgentExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<TypeTag> {
        let mut types = transcript_types();
        types.push(HandoffTurn::type_tag());
        types
    }

    fn handle(&self, envelope: Envelope, ctx: WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.turn(envelope, ctx))
    }

    fn is_cross_run_shareable(&self) -> bool {
        true
    }
}

/// Yields the final transcript with every agent turn as an assistant message.
struct HandoffEndExecutor {
    id: ExecutorId,
    agents: HashSet<String>,
}

impl Executor for HandoffEndExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<TypeTag> {
        vec![HandoffTurn::type_tag()]
    }

    fn handle(&self, envelope: Envelope, ctx: WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let turn: HandoffTurn = envelope.payload.decode()?;
            let transcript: Vec<ChatMessage> = turn
                .transcript
                .into_iter()
                .map(|mut m| {
                    let by_agent = m.author_name.as_ref().is_some_and(|a| self.agents.contains(a));
                    if m.role == Role::User && by_agent {
                        m.role = Role::Assistant;
                    }
                    m
                })
                .collect();
            ctx.yield_output(&transcript)
        })
    }

    fn is_cross_run_shareable(&self) -> bool {
        true
    }
}

/// Builds a workflow where agents transfer control by calling
/// `transfer_to_<agent>` tools.
pub struct HandoffBuilder {
    initial: Arc<dyn Agent>,
    agents: Vec<Arc<dyn Agent>>,
    handoffs: Vec<(String, String, String)>,
    name: String,
}

impl HandoffBuilder {
    pub fn new(initial: Arc<dyn Agent>) -> Self {
        Self {
            agents: vec![initial.clone()],
            initial,
            handoffs: Vec::new(),
            name: "handoff".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn register(&mut self, agent: &Arc<dyn Agent>) {
        if !self.agents.iter().any(|a| a.name() == agent.name()) {
            self.agents.push(agent.clone());
        }
    }

    /// Allow `from` to transfer the conversation to `to`. An empty
    /// description falls back to the target agent's own description.
    pub fn add_handoff(
        mut self,
        from: &Arc<dyn Agent>,
        to: &Arc<dyn Agent>,
        description: impl Into<String>,
    ) -> Self {
        self.register(from);
        self.register(to);
        let edge = (from.name().to_string(), to.name().to_string(), description.into());
        if !self.handoffs.iter().any(|(f, t, _)| *f == edge.0 && *t == edge.1) {
            self.handoffs.push(edge);
        }
        self
    }

    pub fn build(self) -> Result<Workflow> {
        let names = ToolNames::new()?;
        let executor_id = |agent: &str| ExecutorId::new(names.sanitize(agent));

        let mut builder = WorkflowBuilder::new(executor_id(self.initial.name())).with_name(self.name);
        let mut routes: Vec<(ExecutorId, Vec<(String, ExecutorId)>)> = Vec::new();

        for agent in &self.agents {
            let id = executor_id(agent.name());
            let targets: Vec<HandoffTarget> = self
                .handoffs
                .iter()
                .filter(|(from, _, _)| from == agent.name())
                .filter_map(|(_, to, description)| {
                    let target = self.agents.iter().find(|a| a.name() == to)?;
                    let description = if description.is_empty() {
                        match target.description() {
                            "" => format!("Hand the conversation over to {}.", to),
                            d => d.to_string(),
                        }
                    } else {
                        description.clone()
                    };
                    Some(HandoffTarget {
                        tool: ToolDefinition {
                            name: names.transfer_tool(to),
                            description,
                            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
                        },
                        executor: executor_id(to.as_str()),
                    })
                })
                .collect();

            routes.push((
                id.clone(),
                targets
                    .iter()
                    .map(|t| (t.tool.name.clone(), t.executor.clone()))
                    .collect(),
            ));
            builder = builder.add_executor(HandoffAgentExecutor {
                id,
                agent: agent.clone(),
                targets,
            });
        }

        builder = builder.add_executor(HandoffEndExecutor {
            id: ExecutorId::new(HANDOFF_END),
            agents: self.agents.iter().map(|a| a.name().to_string()).collect(),
        });

        for (source, targets) in routes {
            if targets.is_empty() {
                builder = builder.add_edge(source, HANDOFF_END);
                continue;
            }
            builder = builder.add_switch(source, |mut switch| {
                for (tool, target) in targets {
                    let wanted = target.clone();
                    switch = switch.case(
                        Condition::when::<HandoffTurn, _>(tool, move |turn| {
                            turn.handoff_to.as_ref() == Some(&wanted)
                        }),
                        target,
                    );
                }
                switch.default(HANDOFF_END)
            });
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names_are_sanitized() {
        assert_eq!(handoff_tool_name("billing agent").unwrap(), "transfer_to_billing_agent");
        assert_eq!(handoff_tool_name("x.y/z-1").unwrap(), "transfer_to_x_y_z-1");
    }
}
