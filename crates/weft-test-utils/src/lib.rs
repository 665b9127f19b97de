//! Fixtures shared by the Weft test suites.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tempfile::NamedTempFile;

use weft_core::error::{Result, WeftError};
use weft_core::event::{EventKind, WorkflowEvent};
use weft_core::types::{ChatMessage, RequestId, ToolDefinition};
use weft_workflow::{Agent, Executor, FunctionExecutor, Workflow, WorkflowBuilder};

/// Install a test subscriber once. Honours `RUST_LOG`, defaults to `warn`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// `String -> uppercase`, sent on.
pub fn uppercase(id: &str) -> FunctionExecutor {
    FunctionExecutor::map(id, |s: String| Ok(s.to_uppercase()))
}

/// `String -> reversed`, yielded as output.
pub fn reverse_output(id: &str) -> FunctionExecutor {
    FunctionExecutor::output(id, |s: String| Ok(s.chars().rev().collect::<String>()))
}

/// `upper -> reverse`, with a fresh executor pair per run.
pub fn upper_reverse_workflow() -> Workflow {
    WorkflowBuilder::new("upper")
        .with_name("upper-reverse")
        .add_executor_factory("upper", || Arc::new(uppercase("upper")) as Arc<dyn Executor>)
        .add_executor_factory("reverse", || {
            Arc::new(reverse_output("reverse")) as Arc<dyn Executor>
        })
        .add_edge("upper", "reverse")
        .build()
        .expect("upper-reverse workflow is valid")
}

pub fn event_kinds(events: &[WorkflowEvent]) -> Vec<EventKind> {
    events.iter().map(WorkflowEvent::kind).collect()
}

pub fn count_kind(events: &[WorkflowEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

pub fn request_ids(events: &[WorkflowEvent]) -> Vec<RequestId> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::RequestInfo { request_id, .. } => Some(request_id.clone()),
            _ => None,
        })
        .collect()
}

/// Drop the `Started` event, which carries the run id and resume marker.
pub fn without_started(events: &[WorkflowEvent]) -> Vec<WorkflowEvent> {
    events
        .iter()
        .filter(|e| e.kind() != EventKind::Started)
        .cloned()
        .collect()
}

/// Write `content` to a temporary TOML file.
pub fn temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

/// An agent that replays canned turns and records every view it was given.
pub struct ScriptedAgent {
    name: String,
    turns: Mutex<VecDeque<Vec<ChatMessage>>>,
    seen: Mutex<Vec<(Vec<ChatMessage>, Vec<ToolDefinition>)>>,
    fail: bool,
}

impl ScriptedAgent {
    pub fn new(name: &str, turns: Vec<Vec<ChatMessage>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn replying(name: &str, text: &str) -> Arc<Self> {
        Self::new(name, vec![vec![ChatMessage::assistant_text(text)]])
    }

    /// Every turn fails with an executor error.
    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            turns: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    /// A turn that calls `transfer_to_<target>` after a short remark.
    pub fn transfer_turn(target: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::assistant_text(format!("Passing you to {}.", target)),
            ChatMessage::tool_call(
                format!("call-{}", target),
                format!("transfer_to_{}", target),
                serde_json::json!({}),
            ),
        ]
    }

    pub fn views(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().iter().map(|(v, _)| v.clone()).collect()
    }

    pub fn tools_offered(&self) -> Vec<Vec<ToolDefinition>> {
        self.seen.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn as_agent(self: &Arc<Self>) -> Arc<dyn Agent> {
        self.clone()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        self.seen.lock().unwrap().push((messages, tools));
        let next = self.turns.lock().unwrap().pop_front().unwrap_or_default();
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                return Err(WeftError::executor(self.name.as_str(), "scripted failure"));
            }
            Ok(next)
        })
    }
}
