//! Graph fragments built from agents: handoff, sequential and concurrent.

mod concurrent;
mod handoff;
mod sequential;

use std::sync::Arc;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::event::WorkflowEvent;
use weft_core::message::{Envelope, Payload, TypeTag};
use weft_core::types::{ChatMessage, ExecutorId, ToolDefinition};

use crate::context::WorkflowContext;
use crate::executor::Executor;

pub use concurrent::concurrent;
pub use handoff::{handoff_tool_name, HandoffBuilder, HandoffTurn, HANDOFF_END};
pub use sequential::sequential;

/// A conversational participant, usually backed by a chat model.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Produce the agent's next messages for the given transcript. `tools`
    /// lists the extra tools the agent may call during this turn.
    fn run(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;
}

/// Decode a transcript from a prompt, a single message or a message list.
pub(crate) fn transcript_from(payload: &Payload) -> Result<Vec<ChatMessage>> {
    if payload.is::<Vec<ChatMessage>>() {
        payload.decode()
    } else if payload.is::<ChatMessage>() {
        Ok(vec![payload.decode()?])
    } else if payload.is::<String>() {
        Ok(vec![ChatMessage::user(payload.decode::<String>()?)])
    } else {
        Err(WeftError::TypeMismatch {
            expected: "transcript".into(),
            actual: payload.tag.to_string(),
        })
    }
}

pub(crate) fn transcript_types() -> Vec<TypeTag> {
    vec![
        TypeTag::of::<String>(),
        TypeTag::of::<ChatMessage>(),
        TypeTag::of::<Vec<ChatMessage>>(),
    ]
}

/// Run one agent turn, stamping authorship and reporting progress events.
pub(crate) async fn run_agent_turn(
    agent: &dyn Agent,
    executor_id: &ExecutorId,
    view: Vec<ChatMessage>,
    tools: Vec<ToolDefinition>,
    ctx: &WorkflowContext,
) -> Result<Vec<ChatMessage>> {
    let produced = tokio::select! {
        result = agent.run(view, tools) => result?,
        _ = ctx.cancelled() => return Err(WeftError::Cancelled),
    };

    let produced: Vec<ChatMessage> = produced
        .into_iter()
        .map(|m| match m.author_name {
            Some(_) => m,
            None => m.with_author(agent.name()),
        })
        .collect();
    for message in &produced {
        ctx.add_event(WorkflowEvent::AgentRunUpdate {
            executor_id: executor_id.clone(),
            message: message.clone(),
        });
    }
    ctx.add_event(WorkflowEvent::AgentRunResponse {
        executor_id: executor_id.clone(),
        messages: produced.clone(),
    });
    Ok(produced)
}

/// What an [`AgentExecutor`] does with the result of its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutput {
    /// Send the transcript with the agent's replies appended.
    Transcript,
    /// Send only the agent's replies.
    Replies,
    /// Yield the transcript with the agent's replies as workflow output.
    Yield,
}

/// Wraps an [`Agent`] as a stateless executor over transcripts.
pub struct AgentExecutor {
    id: ExecutorId,
    agent: Arc<dyn Agent>,
    tools: Vec<ToolDefinition>,
    output: AgentOutput,
}

impl AgentExecutor {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            id: ExecutorId::new(agent.name()),
            agent,
            tools: Vec::new(),
            output: AgentOutput::Transcript,
        }
    }

    pub fn with_id(mut self, id: impl Into<ExecutorId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output(mut self, output: AgentOutput) -> Self {
        self.output = output;
        self
    }

    async fn turn(&self, envelope: Envelope, ctx: WorkflowContext) -> Result<()> {
        let mut transcript = transcript_from(&envelope.payload)?;
        let produced = run_agent_turn(
            self.agent.as_ref(),
            &self.id,
            transcript.clone(),
            self.tools.clone(),
            &ctx,
        )
        .await?;

        match self.output {
            AgentOutput::Replies => ctx.send_message(&produced),
            AgentOutput::Transcript => {
                transcript.extend(produced);
                ctx.send_message(&transcript)
            }
            AgentOutput::Yield => {
                transcript.extend(produced);
                ctx.yield_output(&transcript)
            }
        }
    }
}

impl Executor for AgentExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<TypeTag> {
        transcript_types()
    }

    fn handle(&self, envelope: Envelope, ctx: WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.turn(envelope, ctx))
    }

    fn is_cross_run_shareable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_from_accepts_prompt_and_lists() {
        let prompt = transcript_from(&Payload::text("hi")).unwrap();
        assert_eq!(prompt, vec![ChatMessage::user("hi")]);

        let list = Payload::new(&vec![ChatMessage::user("a"), ChatMessage::user("b")]).unwrap();
        assert_eq!(transcript_from(&list).unwrap().len(), 2);

        assert!(matches!(
            transcript_from(&Payload::new(&1i64).unwrap()),
            Err(WeftError::TypeMismatch { .. })
        ));
    }
}
