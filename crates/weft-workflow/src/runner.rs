use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use weft_core::config::{RetryConfig, RuntimeConfig, TelemetryConfig, WeftConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::{EventBus, EventWatchers, WorkflowEvent};
use weft_core::message::{Envelope, Payload, TypeTag, WorkflowMessage};
use weft_core::types::{CheckpointId, ExecutorId, RequestId, RunId};

use crate::builder::{RunExecutors, Workflow};
use crate::checkpoint::{open_store, Checkpoint, CheckpointStore, OutstandingRequest};
use crate::context::{apply_writes, ContextParams, Outbox, ScopedState, WorkflowContext};
use crate::edge::FanInState;
use crate::executor::Executor;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Created,
    Running,
    /// Waiting for responses to outstanding requests.
    Halted,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-run settings. Nothing here is process-global.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub runtime: RuntimeConfig,
    pub retry: RetryConfig,
    pub telemetry: TelemetryConfig,
    /// When set, a checkpoint is captured and saved after every superstep.
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub watchers: EventWatchers,
    pub event_bus: Option<Arc<EventBus>>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &WeftConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runtime: config.runtime.clone(),
            retry: config.retry.clone(),
            telemetry: config.telemetry.clone(),
            checkpoint_store: open_store(config)?,
            ..Self::default()
        })
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_watchers(mut self, watchers: EventWatchers) -> Self {
        self.watchers = watchers;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcome of a run driven to idle.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub events: Vec<WorkflowEvent>,
    pub outputs: Vec<Payload>,
}

impl RunResult {
    /// The last output, decoded.
    pub fn output<T: WorkflowMessage>(&self) -> Result<Option<T>> {
        self.outputs.last().map(|p| p.decode()).transpose()
    }

    pub fn outputs_as<T: WorkflowMessage>(&self) -> Result<Vec<T>> {
        self.outputs.iter().map(|p| p.decode()).collect()
    }
}

struct Invocation {
    envelope: Envelope,
    result: Result<()>,
    outbox: Outbox,
}

struct ExecutorOutcome {
    executor_id: ExecutorId,
    invocations: Vec<Invocation>,
    /// Messages not delivered because the run was cancelled.
    skipped: Vec<Envelope>,
}

/// Work for one executor in one superstep.
struct Job {
    executor_id: ExecutorId,
    executor: Option<Arc<dyn Executor>>,
    envelopes: Vec<Envelope>,
    run_id: RunId,
    superstep: u64,
    state: Arc<ScopedState>,
    cancel: CancellationToken,
    default_max_retries: u32,
    enforce_timeouts: bool,
    telemetry: bool,
}

impl Job {
    async fn run(self) -> ExecutorOutcome {
        let request_seq = Arc::new(AtomicUsize::new(0));
        let mut view = self.state.clone();
        let mut invocations = Vec::with_capacity(self.envelopes.len());
        let mut skipped = Vec::new();

        let mut queue = self.envelopes.into_iter();
        while let Some(envelope) = queue.next() {
            if self.cancel.is_cancelled() {
                skipped.push(envelope);
                skipped.extend(queue.by_ref());
                break;
            }
            let ctx = WorkflowContext::new(ContextParams {
                executor_id: self.executor_id.clone(),
                run_id: self.run_id.clone(),
                superstep: self.superstep,
                message: Some(envelope.meta.clone()),
                state: view.clone(),
                cancel: self.cancel.clone(),
                request_seq: request_seq.clone(),
                default_max_retries: self.default_max_retries,
            });

            let result = match &self.executor {
                Some(executor) => {
                    let span = if self.telemetry {
                        info_span!("executor", executor_id = %self.executor_id)
                    } else {
                        Span::none()
                    };
                    let handled = executor.handle(envelope.clone(), ctx.clone()).instrument(span);
                    match (self.enforce_timeouts, envelope.meta.timeout_ms) {
                        (true, Some(ms)) => {
                            match tokio::time::timeout(Duration::from_millis(ms), handled).await {
                                Ok(r) => r,
                                Err(_) => Err(WeftError::Timeout {
                                    executor: self.executor_id.to_string(),
                                    timeout_ms: ms,
                                }),
                            }
                        }
                        _ => handled.await,
                    }
                }
                None => Err(WeftError::executor(
                    self.executor_id.as_str(),
                    "executor is not part of this run",
                )),
            };

            let outbox = ctx.take_outbox();
            // Later messages to the same executor see earlier writes.
            if result.is_ok() && outbox.retry.is_none() && !outbox.state_writes.is_empty() {
                let mut next = (*view).clone();
                apply_writes(&mut next, outbox.state_writes.clone());
                view = Arc::new(next);
            }
            invocations.push(Invocation {
                envelope,
                result,
                outbox,
            });
        }

        ExecutorOutcome {
            executor_id: self.executor_id,
            invocations,
            skipped,
        }
    }
}

/// Drives one run of a workflow, superstep by superstep.
pub struct WorkflowRunner {
    workflow: Workflow,
    executors: RunExecutors,
    options: RunOptions,
    run_id: RunId,
    status: RunStatus,
    next_superstep: u64,
    last_completed: Option<u64>,
    pending: Vec<Envelope>,
    fan_in: FanInState,
    state: ScopedState,
    outstanding: Vec<OutstandingRequest>,
    outputs: Vec<Payload>,
    buffered: Vec<WorkflowEvent>,
    span: Option<Span>,
}

impl WorkflowRunner {
    fn assemble(workflow: &Workflow, executors: RunExecutors, options: RunOptions, run_id: RunId) -> Self {
        let span = options.telemetry.enabled.then(|| {
            info_span!(
                "workflow_run",
                span_name = %options.telemetry.span_name,
                workflow = %workflow.name(),
                run_id = %run_id,
            )
        });
        Self {
            workflow: workflow.clone(),
            executors,
            options,
            run_id,
            status: RunStatus::Created,
            next_superstep: 0,
            last_completed: None,
            pending: Vec::new(),
            fan_in: FanInState::new(),
            state: ScopedState::new(),
            outstanding: Vec::new(),
            outputs: Vec::new(),
            buffered: Vec::new(),
            span,
        }
    }

    /// Start a run. Fails if the start executor cannot handle the input type.
    pub fn start<T: WorkflowMessage>(workflow: &Workflow, input: &T, options: RunOptions) -> Result<Self> {
        Self::start_payload(workflow, Payload::new(input)?, options)
    }

    pub fn start_payload(workflow: &Workflow, input: Payload, options: RunOptions) -> Result<Self> {
        let executors = workflow.instantiate()?;
        let start = workflow.start_id();
        let accepts = executors
            .executors
            .get(start)
            .is_some_and(|e| e.can_handle(&input.tag));
        if !accepts {
            return Err(WeftError::InvalidArgument(format!(
                "start executor '{}' cannot handle input of type '{}'",
                start, input.tag
            )));
        }

        let envelope = Envelope::new(input)
            .with_target(start.clone())
            .with_max_retries(options.runtime.default_max_retries);
        let mut runner = Self::assemble(workflow, executors, options, RunId::new());
        runner.pending.push(envelope);

        info!(run_id = %runner.run_id, workflow = %workflow.name(), "Workflow run started");
        runner.emit(WorkflowEvent::Started {
            run_id: runner.run_id.clone(),
            resumed_from: None,
        });
        Ok(runner)
    }

    /// Continue a run from a checkpoint.
    ///
    /// Fails with `CheckpointMismatch` if the checkpoint references anything
    /// the workflow does not contain.
    pub fn resume(workflow: &Workflow, checkpoint: Checkpoint, options: RunOptions) -> Result<Self> {
        checkpoint.validate_against(workflow)?;
        let executors = workflow.instantiate()?;
        for (id, state) in checkpoint.executor_state {
            match executors.executors.get(&id) {
                Some(executor) => executor.import_state(state)?,
                None => {
                    return Err(WeftError::CheckpointMismatch(format!(
                        "no executor '{}' to restore state into",
                        id
                    )))
                }
            }
        }

        let mut runner = Self::assemble(workflow, executors, options, checkpoint.run_id);
        runner.next_superstep = checkpoint.superstep + 1;
        runner.last_completed = Some(checkpoint.superstep);
        runner.pending = checkpoint.pending;
        runner.fan_in = checkpoint.fan_in;
        runner.state = checkpoint.shared_state;
        runner.outstanding = checkpoint.outstanding_requests;
        runner.outputs = checkpoint.outputs;

        info!(
            run_id = %runner.run_id,
            superstep = checkpoint.superstep,
            pending = runner.pending.len(),
            "Workflow run resumed from checkpoint"
        );
        runner.emit(WorkflowEvent::Started {
            run_id: runner.run_id.clone(),
            resumed_from: Some(checkpoint.superstep),
        });
        if !runner.outstanding.is_empty() {
            runner.halt(checkpoint.superstep);
        }
        Ok(runner)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn outputs(&self) -> &[Payload] {
        &self.outputs
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Requests waiting for a response.
    pub fn outstanding_requests(&self) -> &[OutstandingRequest] {
        &self.outstanding
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.options.cancel.clone()
    }

    /// Run one superstep and return the events it produced.
    ///
    /// A halted or finished run returns immediately.
    pub async fn step(&mut self) -> Vec<WorkflowEvent> {
        if self.status.is_terminal() {
            return self.drain();
        }
        if self.options.cancel.is_cancelled() {
            self.cancel_run(self.next_superstep);
            return self.drain();
        }
        if self.status == RunStatus::Halted {
            return self.drain();
        }
        self.status = RunStatus::Running;

        if self.pending.is_empty() {
            self.complete(self.last_completed.unwrap_or(0));
            return self.drain();
        }

        let n = self.next_superstep;
        if n >= self.options.runtime.max_supersteps {
            let message = format!(
                "run exceeded the limit of {} supersteps",
                self.options.runtime.max_supersteps
            );
            self.emit(WorkflowEvent::Error {
                executor_id: None,
                message: message.clone(),
            });
            self.fail(n, message);
            return self.drain();
        }

        let span = match &self.span {
            Some(run) => info_span!(parent: run, "superstep", superstep = n),
            None => Span::none(),
        };
        self.run_superstep(n).instrument(span).await;
        self.drain()
    }

    /// Step until the run completes, fails, halts or is cancelled.
    pub async fn run_until_idle(&mut self) -> Vec<WorkflowEvent> {
        let mut events = self.drain();
        loop {
            events.extend(self.step().await);
            if !matches!(self.status, RunStatus::Created | RunStatus::Running) {
                break;
            }
        }
        events
    }

    /// Answer an outstanding request. The response is delivered to the
    /// requesting executor in the next superstep, correlated by request id.
    pub fn respond(&mut self, request_id: &RequestId, payload: Payload) -> Result<()> {
        let index = self
            .outstanding
            .iter()
            .position(|r| &r.request_id == request_id)
            .ok_or_else(|| {
                WeftError::InvalidArgument(format!("no outstanding request '{}'", request_id))
            })?;

        let executor_id = self.outstanding[index].executor_id.clone();
        let accepts = self
            .executors
            .executors
            .get(&executor_id)
            .is_some_and(|e| e.can_handle(&payload.tag));
        if !accepts {
            return Err(WeftError::InvalidArgument(format!(
                "executor '{}' cannot handle a response of type '{}'",
                executor_id, payload.tag
            )));
        }

        self.outstanding.remove(index);
        self.pending.push(
            Envelope::new(payload)
                .with_target(executor_id)
                .with_correlation_id(request_id.as_str())
                .with_max_retries(self.options.runtime.default_max_retries),
        );
        debug!(run_id = %self.run_id, request_id = %request_id, "Request answered");

        if self.outstanding.is_empty() && self.status == RunStatus::Halted {
            self.status = RunStatus::Running;
        }
        Ok(())
    }

    pub fn respond_with<T: WorkflowMessage>(&mut self, request_id: &RequestId, value: &T) -> Result<()> {
        self.respond(request_id, Payload::new(value)?)
    }

    /// Snapshot the run after its last completed superstep.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        let superstep = self.last_completed.ok_or_else(|| {
            WeftError::InvalidArgument("no superstep has completed yet".into())
        })?;
        self.capture(superstep)
    }

    pub(crate) fn into_result(self, events: Vec<WorkflowEvent>) -> RunResult {
        RunResult {
            run_id: self.run_id,
            status: self.status,
            events,
            outputs: self.outputs,
        }
    }

    fn capture(&self, superstep: u64) -> Result<Checkpoint> {
        let mut executor_state = std::collections::BTreeMap::new();
        for id in self.workflow.executor_ids() {
            if let Some(executor) = self.executors.executors.get(id) {
                if let Some(state) = executor.export_state()? {
                    executor_state.insert(id.clone(), state);
                }
            }
        }
        Ok(Checkpoint {
            id: CheckpointId::new(),
            run_id: self.run_id.clone(),
            workflow_name: self.workflow.name().to_string(),
            superstep,
            pending: self.pending.clone(),
            fan_in: self.fan_in.clone(),
            shared_state: self.state.clone(),
            executor_state,
            outstanding_requests: self.outstanding.clone(),
            outputs: self.outputs.clone(),
            created_at: Utc::now(),
        })
    }

    async fn run_superstep(&mut self, n: u64) {
        self.emit(WorkflowEvent::SuperstepStarted { superstep: n });
        debug!(run_id = %self.run_id, superstep = n, pending = self.pending.len(), "Superstep started");

        let snapshot = Arc::new(self.state.clone());
        let jobs: Vec<Job> = group_by_target(std::mem::take(&mut self.pending))
            .into_iter()
            .map(|(executor_id, envelopes)| Job {
                executor: self.executors.executors.get(&executor_id).cloned(),
                executor_id,
                envelopes,
                run_id: self.run_id.clone(),
                superstep: n,
                state: snapshot.clone(),
                cancel: self.options.cancel.clone(),
                default_max_retries: self.options.runtime.default_max_retries,
                enforce_timeouts: self.options.runtime.enforce_message_timeouts,
                telemetry: self.options.telemetry.enabled,
            })
            .collect();

        let outcomes = if self.options.runtime.concurrent_dispatch {
            join_all(jobs.into_iter().map(Job::run)).await
        } else {
            let mut outcomes = Vec::with_capacity(jobs.len());
            for job in jobs {
                outcomes.push(job.run().await);
            }
            outcomes
        };

        let mut failure: Option<(ExecutorId, WeftError)> = None;
        let mut to_route: Vec<(ExecutorId, Envelope)> = Vec::new();
        let mut retries: Vec<Envelope> = Vec::new();
        let mut deferred: Vec<WorkflowEvent> = Vec::new();
        let mut writes = Vec::new();
        let mut leftover: Vec<Envelope> = Vec::new();
        let mut raised: Vec<OutstandingRequest> = Vec::new();

        for outcome in outcomes {
            let id = outcome.executor_id;
            leftover.extend(outcome.skipped);
            for inv in outcome.invocations {
                self.emit(WorkflowEvent::ExecutorInvoked {
                    executor_id: id.clone(),
                    superstep: n,
                });
                match inv.result {
                    Err(WeftError::Cancelled) if self.options.cancel.is_cancelled() => {
                        leftover.push(inv.envelope);
                    }
                    Err(e) => {
                        // Diagnostics raised before the failure still surface.
                        for event in inv.outbox.events {
                            if !matches!(event, WorkflowEvent::Output { .. }) {
                                self.emit(event);
                            }
                        }
                        error!(run_id = %self.run_id, executor_id = %id, superstep = n, error = %e, "Executor failed");
                        self.emit(WorkflowEvent::ExecutorFailed {
                            executor_id: id.clone(),
                            superstep: n,
                            error: e.to_string(),
                        });
                        if failure.is_none() {
                            failure = Some((id.clone(), e));
                        }
                    }
                    Ok(()) if inv.outbox.retry.is_some() => {
                        let reason = inv.outbox.retry.unwrap_or_default();
                        match inv.envelope.with_retry() {
                            Ok(next) => {
                                warn!(
                                    executor_id = %id,
                                    attempt = next.meta.retries,
                                    max_retries = next.meta.max_retries,
                                    reason = %reason,
                                    "Message retry requested"
                                );
                                retries.push(next);
                            }
                            Err(e) => {
                                warn!(executor_id = %id, error = %e, "Message retries exhausted");
                                self.emit(WorkflowEvent::Error {
                                    executor_id: Some(id.clone()),
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                    Ok(()) => {
                        let Outbox {
                            messages,
                            outputs,
                            events,
                            requests,
                            state_writes,
                            ..
                        } = inv.outbox;
                        for event in events {
                            self.emit(event);
                        }
                        self.outputs.extend(outputs);
                        to_route.extend(messages.into_iter().map(|m| (id.clone(), m)));
                        writes.extend(state_writes);
                        for (request_id, payload) in requests {
                            raised.push(OutstandingRequest {
                                request_id: request_id.clone(),
                                executor_id: id.clone(),
                                payload: payload.clone(),
                            });
                            deferred.push(WorkflowEvent::RequestInfo {
                                request_id,
                                executor_id: id.clone(),
                                payload,
                            });
                        }
                        self.emit(WorkflowEvent::ExecutorCompleted {
                            executor_id: id.clone(),
                            superstep: n,
                        });
                    }
                }
            }
        }

        if let Some((id, e)) = failure {
            self.emit(WorkflowEvent::SuperstepCompleted {
                superstep: n,
                checkpoint: None,
            });
            self.fail(n, format!("executor '{}' failed: {}", id, e));
            return;
        }

        let mut next = leftover;
        let mut warnings = Vec::new();
        {
            let executors = &self.executors.executors;
            let accepts = |sink: &ExecutorId, tag: &TypeTag| {
                executors.get(sink).is_some_and(|e| e.can_handle(tag))
            };
            let edges = self.workflow.edge_map();
            for (source, envelope) in to_route {
                let routed = edges.route(
                    &source,
                    &envelope,
                    &accepts,
                    &mut self.fan_in,
                    self.options.runtime.default_max_retries,
                );
                if !routed.matched {
                    if edges.has_outgoing(&source) {
                        warnings.push(WorkflowEvent::Warning {
                            executor_id: Some(source.clone()),
                            message: format!(
                                "message of type '{}' from '{}' matched no edge and was dropped",
                                envelope.tag(),
                                source
                            ),
                        });
                    } else {
                        debug!(executor_id = %source, "Message from executor without outgoing edges dropped");
                    }
                }
                for (sink, tag) in routed.rejected_joins {
                    warnings.push(WorkflowEvent::Warning {
                        executor_id: Some(sink.clone()),
                        message: format!("fan-in sink '{}' cannot handle '{}'; join dropped", sink, tag),
                    });
                }
                next.extend(routed.deliveries);
            }
        }
        for warning in warnings {
            if let WorkflowEvent::Warning { message, .. } = &warning {
                warn!(run_id = %self.run_id, superstep = n, "{}", message);
            }
            self.emit(warning);
        }

        let backoff = retries
            .iter()
            .map(|e| self.options.retry.backoff(e.meta.retries.saturating_sub(1)))
            .max()
            .unwrap_or(Duration::ZERO);
        next.extend(retries);
        apply_writes(&mut self.state, writes);
        self.outstanding.extend(raised);

        // Messages skipped by a cancellation stay pending with the routed ones.
        self.pending = next;
        self.last_completed = Some(n);
        self.next_superstep = n + 1;

        if !backoff.is_zero() && !self.options.cancel.is_cancelled() {
            debug!(backoff_ms = backoff.as_millis() as u64, "Backing off before retry");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.options.cancel.cancelled() => {}
            }
        }

        let checkpoint = match self.options.checkpoint_store.clone() {
            Some(store) => match self.save_checkpoint(store.as_ref(), n).await {
                Ok(info) => Some(info),
                Err(e) => {
                    self.emit(WorkflowEvent::SuperstepCompleted {
                        superstep: n,
                        checkpoint: None,
                    });
                    self.fail(n, format!("checkpoint after superstep {} failed: {}", n, e));
                    return;
                }
            },
            None => None,
        };

        self.emit(WorkflowEvent::SuperstepCompleted {
            superstep: n,
            checkpoint,
        });
        for event in deferred {
            self.emit(event);
        }

        if self.options.cancel.is_cancelled() {
            self.cancel_run(n);
        } else if !self.outstanding.is_empty() {
            self.halt(n);
        } else if self.pending.is_empty() {
            self.complete(n);
        }
    }

    async fn save_checkpoint(
        &self,
        store: &dyn CheckpointStore,
        superstep: u64,
    ) -> Result<weft_core::event::CheckpointInfo> {
        let checkpoint = self.capture(superstep)?;
        store.save(&checkpoint).await?;
        debug!(run_id = %self.run_id, superstep, checkpoint_id = %checkpoint.id, "Checkpoint saved");
        Ok(checkpoint.info())
    }

    fn emit(&mut self, event: WorkflowEvent) {
        self.options.watchers.notify(&event);
        if let Some(bus) = &self.options.event_bus {
            bus.publish(event.clone());
        }
        self.buffered.push(event);
    }

    fn drain(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.buffered)
    }

    fn halt(&mut self, superstep: u64) {
        self.status = RunStatus::Halted;
        let pending_requests: Vec<RequestId> =
            self.outstanding.iter().map(|r| r.request_id.clone()).collect();
        info!(run_id = %self.run_id, superstep, requests = pending_requests.len(), "Workflow run halted for input");
        self.emit(WorkflowEvent::Halted {
            superstep,
            pending_requests,
        });
    }

    fn complete(&mut self, superstep: u64) {
        self.status = RunStatus::Completed;
        self.executors.release();
        info!(run_id = %self.run_id, superstep, outputs = self.outputs.len(), "Workflow run completed");
        self.emit(WorkflowEvent::Completed { superstep });
    }

    fn fail(&mut self, superstep: u64, error: String) {
        self.status = RunStatus::Failed;
        self.executors.release();
        error!(run_id = %self.run_id, superstep, error = %error, "Workflow run failed");
        self.emit(WorkflowEvent::Failed { superstep, error });
    }

    fn cancel_run(&mut self, superstep: u64) {
        self.status = RunStatus::Cancelled;
        self.executors.release();
        info!(run_id = %self.run_id, superstep, "Workflow run cancelled");
        self.emit(WorkflowEvent::Cancelled { superstep });
    }
}

/// Group pending messages by target in order of first appearance, each
/// group ordered by descending priority (stable).
fn group_by_target(pending: Vec<Envelope>) -> Vec<(ExecutorId, Vec<Envelope>)> {
    let mut groups: Vec<(ExecutorId, Vec<Envelope>)> = Vec::new();
    let mut index: HashMap<ExecutorId, usize> = HashMap::new();
    for envelope in pending {
        let Some(target) = envelope.meta.target.clone() else {
            warn!(message_id = %envelope.meta.id, "Pending message without target dropped");
            continue;
        };
        match index.get(&target) {
            Some(&i) => groups[i].1.push(envelope),
            None => {
                index.insert(target.clone(), groups.len());
                groups.push((target, vec![envelope]));
            }
        }
    }
    for (_, envelopes) in &mut groups {
        envelopes.sort_by(|a, b| b.meta.priority.cmp(&a.meta.priority));
    }
    groups
}

impl Workflow {
    /// Run to idle with default options.
    pub async fn run<T: WorkflowMessage>(&self, input: &T) -> Result<RunResult> {
        self.run_with(input, RunOptions::default()).await
    }

    pub async fn run_with<T: WorkflowMessage>(&self, input: &T, options: RunOptions) -> Result<RunResult> {
        let mut runner = WorkflowRunner::start(self, input, options)?;
        let events = runner.run_until_idle().await;
        Ok(runner.into_result(events))
    }
}
