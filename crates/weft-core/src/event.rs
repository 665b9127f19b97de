use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::Payload;
use crate::types::{ChatMessage, CheckpointId, ExecutorId, RequestId, RunId};

/// Reference to the checkpoint captured at the end of a superstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: CheckpointId,
    pub run_id: RunId,
    pub superstep: u64,
}

/// Observable events of a workflow run, in emission order.
///
/// Events carry no wall-clock timestamps so that a resumed run can be
/// compared event-for-event with an uninterrupted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Run started, or resumed from the checkpoint of `resumed_from`.
    Started {
        run_id: RunId,
        resumed_from: Option<u64>,
    },
    SuperstepStarted { superstep: u64 },
    SuperstepCompleted {
        superstep: u64,
        checkpoint: Option<CheckpointInfo>,
    },
    ExecutorInvoked {
        executor_id: ExecutorId,
        superstep: u64,
    },
    ExecutorCompleted {
        executor_id: ExecutorId,
        superstep: u64,
    },
    ExecutorFailed {
        executor_id: ExecutorId,
        superstep: u64,
        error: String,
    },
    /// An agent produced one message during its turn.
    AgentRunUpdate {
        executor_id: ExecutorId,
        message: ChatMessage,
    },
    /// An agent finished its turn.
    AgentRunResponse {
        executor_id: ExecutorId,
        messages: Vec<ChatMessage>,
    },
    /// The run needs externally supplied data before it can continue.
    RequestInfo {
        request_id: RequestId,
        executor_id: ExecutorId,
        payload: Payload,
    },
    Output {
        executor_id: ExecutorId,
        payload: Payload,
    },
    Warning {
        executor_id: Option<ExecutorId>,
        message: String,
    },
    Error {
        executor_id: Option<ExecutorId>,
        message: String,
    },
    SubworkflowError {
        executor_id: ExecutorId,
        message: String,
    },
    SubworkflowWarning {
        executor_id: ExecutorId,
        message: String,
    },
    /// Free-form event raised by an executor.
    Custom {
        executor_id: ExecutorId,
        name: String,
        data: serde_json::Value,
    },
    /// Run paused waiting for responses to outstanding requests.
    Halted {
        superstep: u64,
        pending_requests: Vec<RequestId>,
    },
    Completed { superstep: u64 },
    Failed { superstep: u64, error: String },
    Cancelled { superstep: u64 },
}

/// Variant tag of a [`WorkflowEvent`], used to key subscriptions.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    SuperstepStarted,
    SuperstepCompleted,
    ExecutorInvoked,
    ExecutorCompleted,
    ExecutorFailed,
    AgentRunUpdate,
    AgentRunResponse,
    RequestInfo,
    Output,
    Warning,
    Error,
    SubworkflowError,
    SubworkflowWarning,
    Custom,
    Halted,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::SuperstepStarted { .. } => EventKind::SuperstepStarted,
            Self::SuperstepCompleted { .. } => EventKind::SuperstepCompleted,
            Self::ExecutorInvoked { .. } => EventKind::ExecutorInvoked,
            Self::ExecutorCompleted { .. } => EventKind::ExecutorCompleted,
            Self::ExecutorFailed { .. } => EventKind::ExecutorFailed,
            Self::AgentRunUpdate { .. } => EventKind::AgentRunUpdate,
            Self::AgentRunResponse { .. } => EventKind::AgentRunResponse,
            Self::RequestInfo { .. } => EventKind::RequestInfo,
            Self::Output { .. } => EventKind::Output,
            Self::Warning { .. } => EventKind::Warning,
            Self::Error { .. } => EventKind::Error,
            Self::SubworkflowError { .. } => EventKind::SubworkflowError,
            Self::SubworkflowWarning { .. } => EventKind::SubworkflowWarning,
            Self::Custom { .. } => EventKind::Custom,
            Self::Halted { .. } => EventKind::Halted,
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
            Self::Cancelled { .. } => EventKind::Cancelled,
        }
    }

    /// True for events after which the run makes no further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Halted { .. } | Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

pub type EventListener = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Subscription registry keyed by event kind.
///
/// Listeners for the event's kind run first, then the "any event"
/// listeners, each list in registration order.
#[derive(Clone, Default)]
pub struct EventWatchers {
    by_kind: HashMap<EventKind, Vec<EventListener>>,
    any: Vec<EventListener>,
}

impl EventWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, listener: F) -> &mut Self
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.by_kind.entry(kind).or_default().push(Arc::new(listener));
        self
    }

    pub fn on_any<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.any.push(Arc::new(listener));
        self
    }

    pub fn notify(&self, event: &WorkflowEvent) {
        if let Some(listeners) = self.by_kind.get(&event.kind()) {
            for listener in listeners {
                listener(event);
            }
        }
        for listener in &self.any {
            listener(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.by_kind.values().all(|v| v.is_empty())
    }
}

impl std::fmt::Debug for EventWatchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWatchers")
            .field("kinds", &self.by_kind.len())
            .field("any", &self.any.len())
            .finish()
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_watchers_kind_then_any_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut watchers = EventWatchers::new();

        let l = log.clone();
        watchers.on_any(move |_| l.lock().unwrap().push("any-1"));
        let l = log.clone();
        watchers.on(EventKind::Output, move |_| l.lock().unwrap().push("output-1"));
        let l = log.clone();
        watchers.on(EventKind::Output, move |_| l.lock().unwrap().push("output-2"));
        let l = log.clone();
        watchers.on(EventKind::Warning, move |_| l.lock().unwrap().push("warning"));

        watchers.notify(&WorkflowEvent::Output {
            executor_id: "x".into(),
            payload: Payload::text("done"),
        });

        assert_eq!(*log.lock().unwrap(), vec!["output-1", "output-2", "any-1"]);
    }

    #[test]
    fn test_kind_and_terminal() {
        let e = WorkflowEvent::Halted {
            superstep: 2,
            pending_requests: vec![],
        };
        assert_eq!(e.kind(), EventKind::Halted);
        assert!(e.is_terminal());
        assert!(!WorkflowEvent::SuperstepStarted { superstep: 0 }.is_terminal());
    }

    #[test]
    fn test_event_serde_tagging() {
        let e = WorkflowEvent::SuperstepStarted { superstep: 4 };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "superstep_started");
        assert_eq!(json["superstep"], 4);
    }

    #[tokio::test]
    async fn test_event_bus_fan_out() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(WorkflowEvent::Completed { superstep: 1 });
        assert_eq!(a.recv().await.unwrap().kind(), EventKind::Completed);
        assert_eq!(b.recv().await.unwrap().kind(), EventKind::Completed);
    }
}
