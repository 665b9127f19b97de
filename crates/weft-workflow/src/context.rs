use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use weft_core::error::Result;
use weft_core::event::WorkflowEvent;
use weft_core::message::{Envelope, MessageMeta, Payload, WorkflowMessage};
use weft_core::types::{ExecutorId, RequestId, RunId};

/// Checkpoint-visible state: scope name -> key -> value.
pub type ScopedState = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StateWrite {
    pub scope: String,
    pub key: String,
    pub value: serde_json::Value,
}

/// Everything one invocation produced. Nothing here is visible to other
/// executors until the runner merges it at the superstep boundary.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub messages: Vec<Envelope>,
    pub outputs: Vec<Payload>,
    pub events: Vec<WorkflowEvent>,
    pub requests: Vec<(RequestId, Payload)>,
    pub state_writes: Vec<StateWrite>,
    pub retry: Option<String>,
}

pub(crate) struct ContextParams {
    pub executor_id: ExecutorId,
    pub run_id: RunId,
    pub superstep: u64,
    pub message: Option<MessageMeta>,
    pub state: Arc<ScopedState>,
    pub cancel: CancellationToken,
    pub request_seq: Arc<AtomicUsize>,
    pub default_max_retries: u32,
}

struct Inner {
    params: ContextParams,
    outbox: Mutex<Outbox>,
}

/// Handle given to an executor for the duration of one message delivery.
///
/// Cloning is cheap; all clones write to the same outbox.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Inner>,
}

impl WorkflowContext {
    pub(crate) fn new(params: ContextParams) -> Self {
        Self {
            inner: Arc::new(Inner {
                params,
                outbox: Mutex::new(Outbox::default()),
            }),
        }
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.inner.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn take_outbox(&self) -> Outbox {
        std::mem::take(&mut *self.outbox())
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.inner.params.executor_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.params.run_id
    }

    pub fn superstep(&self) -> u64 {
        self.inner.params.superstep
    }

    /// Metadata of the message being handled.
    pub fn message(&self) -> Option<&MessageMeta> {
        self.inner.params.message.as_ref()
    }

    /// Send a message along this executor's outgoing edges.
    pub fn send_message<T: WorkflowMessage>(&self, value: &T) -> Result<()> {
        self.send_envelope(self.envelope(value)?);
        Ok(())
    }

    /// Send a message to one connected sink only.
    pub fn send_message_to<T: WorkflowMessage>(
        &self,
        target: impl Into<ExecutorId>,
        value: &T,
    ) -> Result<()> {
        self.send_envelope(self.envelope(value)?.with_target(target));
        Ok(())
    }

    /// Send a prepared envelope, keeping its priority, timeout, target and
    /// retry budget.
    pub fn send_envelope(&self, mut envelope: Envelope) {
        envelope.meta.source = Some(self.executor_id().clone());
        self.outbox().messages.push(envelope);
    }

    /// A new envelope carrying the run's default retry budget.
    pub fn envelope<T: WorkflowMessage>(&self, value: &T) -> Result<Envelope> {
        Ok(Envelope::of(value)?.with_max_retries(self.inner.params.default_max_retries))
    }

    /// Send an already-encoded payload along this executor's outgoing edges.
    pub fn send_payload(&self, payload: Payload) {
        self.send_envelope(
            Envelope::new(payload).with_max_retries(self.inner.params.default_max_retries),
        );
    }

    /// Publish a workflow-level output.
    pub fn yield_output<T: WorkflowMessage>(&self, value: &T) -> Result<()> {
        self.yield_payload(Payload::new(value)?);
        Ok(())
    }

    pub fn yield_payload(&self, payload: Payload) {
        let mut outbox = self.outbox();
        outbox.events.push(WorkflowEvent::Output {
            executor_id: self.executor_id().clone(),
            payload: payload.clone(),
        });
        outbox.outputs.push(payload);
    }

    pub fn add_event(&self, event: WorkflowEvent) {
        self.outbox().events.push(event);
    }

    /// Ask the caller for external input. The run halts after this
    /// superstep until every outstanding request has a response.
    pub fn request_info<T: WorkflowMessage>(&self, request: &T) -> Result<RequestId> {
        let payload = Payload::new(request)?;
        let seq = self.inner.params.request_seq.fetch_add(1, Ordering::SeqCst);
        let id = RequestId::derive(self.run_id(), self.superstep(), self.executor_id(), seq);
        self.outbox().requests.push((id.clone(), payload));
        Ok(id)
    }

    /// Ask the runtime to redeliver the current message in the next
    /// superstep. Everything else this invocation produced is discarded.
    pub fn request_retry(&self, reason: impl Into<String>) {
        self.outbox().retry = Some(reason.into());
    }

    /// Read from this executor's private scope.
    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let scope = self.executor_id().as_str().to_string();
        self.get_scoped_state(&scope, key)
    }

    pub fn set_state<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let scope = self.executor_id().as_str().to_string();
        self.set_scoped_state(&scope, key, value)
    }

    /// Read a value from a named scope, seeing this invocation's own writes.
    pub fn get_scoped_state<T: DeserializeOwned>(&self, scope: &str, key: &str) -> Result<Option<T>> {
        let pending = self
            .outbox()
            .state_writes
            .iter()
            .rev()
            .find(|w| w.scope == scope && w.key == key)
            .map(|w| w.value.clone());
        let value = match pending {
            Some(v) => Some(v),
            None => self
                .inner
                .params
                .state
                .get(scope)
                .and_then(|s| s.get(key))
                .cloned(),
        };
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Write a value into a named scope. Committed at the end of the superstep.
    pub fn set_scoped_state<T: Serialize>(&self, scope: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.outbox().state_writes.push(StateWrite {
            scope: scope.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.params.cancel.is_cancelled()
    }

    /// A token cancelled together with this run, for nested work.
    pub fn child_cancel_token(&self) -> CancellationToken {
        self.inner.params.cancel.child_token()
    }

    /// Resolves when the run is cancelled. Await this alongside long calls.
    pub async fn cancelled(&self) {
        self.inner.params.cancel.cancelled().await
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("executor_id", self.executor_id())
            .field("superstep", &self.superstep())
            .finish()
    }
}

/// Apply committed writes to the state map, in order.
pub(crate) fn apply_writes(state: &mut ScopedState, writes: Vec<StateWrite>) {
    for w in writes {
        state.entry(w.scope).or_default().insert(w.key, w.value);
    }
}

#[cfg(test)]
pub(crate) fn test_context(executor: &str) -> WorkflowContext {
    WorkflowContext::new(ContextParams {
        executor_id: ExecutorId::new(executor),
        run_id: RunId::from_str("run-test"),
        superstep: 0,
        message: None,
        state: Arc::new(ScopedState::new()),
        cancel: CancellationToken::new(),
        request_seq: Arc::new(AtomicUsize::new(0)),
        default_max_retries: 3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_sets_source_and_retry_budget() {
        let ctx = test_context("upper");
        ctx.send_message(&"HI".to_string()).unwrap();
        ctx.send_message_to("reverse", &"HI".to_string()).unwrap();

        let outbox = ctx.take_outbox();
        assert_eq!(outbox.messages.len(), 2);
        assert_eq!(outbox.messages[0].meta.source.as_ref().unwrap().as_str(), "upper");
        assert_eq!(outbox.messages[0].meta.max_retries, 3);
        assert!(outbox.messages[0].meta.target.is_none());
        assert_eq!(outbox.messages[1].meta.target.as_ref().unwrap().as_str(), "reverse");
    }

    #[test]
    fn test_state_reads_own_writes() {
        let ctx = test_context("counter");
        assert_eq!(ctx.get_state::<i64>("n").unwrap(), None);
        ctx.set_state("n", &1i64).unwrap();
        ctx.set_state("n", &2i64).unwrap();
        assert_eq!(ctx.get_state::<i64>("n").unwrap(), Some(2));
        // Private scope is keyed by executor id.
        assert_eq!(ctx.get_scoped_state::<i64>("counter", "n").unwrap(), Some(2));
        assert_eq!(ctx.get_scoped_state::<i64>("other", "n").unwrap(), None);
    }

    #[test]
    fn test_request_ids_are_sequential_and_deterministic() {
        let ctx = test_context("approve");
        let a = ctx.request_info(&"ok?".to_string()).unwrap();
        let b = ctx.request_info(&"really?".to_string()).unwrap();
        assert_eq!(a.as_str(), "run-test:0:approve:0");
        assert_eq!(b.as_str(), "run-test:0:approve:1");
        assert_eq!(ctx.take_outbox().requests.len(), 2);
    }

    #[test]
    fn test_yield_output_records_event_in_order() {
        let ctx = test_context("sink");
        ctx.add_event(WorkflowEvent::Warning {
            executor_id: None,
            message: "first".into(),
        });
        ctx.yield_output(&"done".to_string()).unwrap();

        let outbox = ctx.take_outbox();
        assert_eq!(outbox.outputs.len(), 1);
        assert!(matches!(outbox.events[0], WorkflowEvent::Warning { .. }));
        assert!(matches!(outbox.events[1], WorkflowEvent::Output { .. }));
    }

    #[test]
    fn test_apply_writes() {
        let mut state = ScopedState::new();
        apply_writes(
            &mut state,
            vec![
                StateWrite {
                    scope: "s".into(),
                    key: "k".into(),
                    value: serde_json::json!(1),
                },
                StateWrite {
                    scope: "s".into(),
                    key: "k".into(),
                    value: serde_json::json!(2),
                },
            ],
        );
        assert_eq!(state["s"]["k"], serde_json::json!(2));
    }
}
