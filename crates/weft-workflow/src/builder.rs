use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::message::TypeTag;
use weft_core::types::ExecutorId;

use crate::edge::{Condition, Edge, EdgeKind, EdgeMap, SwitchCase};
use crate::executor::Executor;

pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn Executor> + Send + Sync>;

/// How a workflow obtains the executor for an id when a run starts.
#[derive(Clone)]
pub(crate) enum ExecutorBinding {
    /// One instance, reset whenever a later run reuses it.
    Instance(Arc<BoundInstance>),
    /// A fresh instance per run.
    Factory(ExecutorFactory),
}

pub(crate) struct BoundInstance {
    executor: Arc<dyn Executor>,
    claimed: AtomicBool,
    used: AtomicBool,
}

/// Releases an exclusively claimed instance when dropped.
pub(crate) struct InstanceClaim {
    instance: Arc<BoundInstance>,
}

impl Drop for InstanceClaim {
    fn drop(&mut self) {
        self.instance.claimed.store(false, Ordering::SeqCst);
    }
}

/// The executors one run works with.
pub(crate) struct RunExecutors {
    pub executors: HashMap<ExecutorId, Arc<dyn Executor>>,
    claims: Vec<InstanceClaim>,
}

impl RunExecutors {
    /// Give bound instances back to the workflow once the run has ended.
    pub(crate) fn release(&mut self) {
        self.claims.clear();
    }
}

/// Builder for a [`SwitchCase`] list.
#[derive(Debug)]
pub struct SwitchBuilder {
    cases: Vec<SwitchCase>,
    default: Option<ExecutorId>,
}

impl SwitchBuilder {
    fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
        }
    }

    pub fn case(mut self, condition: Condition, sink: impl Into<ExecutorId>) -> Self {
        self.cases.push(SwitchCase {
            condition,
            sink: sink.into(),
        });
        self
    }

    pub fn default(mut self, sink: impl Into<ExecutorId>) -> Self {
        self.default = Some(sink.into());
        self
    }
}

/// Accumulates executors and edges, then validates them into a [`Workflow`].
pub struct WorkflowBuilder {
    name: String,
    start: ExecutorId,
    order: Vec<ExecutorId>,
    bindings: HashMap<ExecutorId, ExecutorBinding>,
    edges: Vec<Edge>,
    errors: Vec<String>,
}

impl WorkflowBuilder {
    pub fn new(start: impl Into<ExecutorId>) -> Self {
        Self {
            name: "workflow".to_string(),
            start: start.into(),
            order: Vec::new(),
            bindings: HashMap::new(),
            edges: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Bind a single instance. It is claimed by one run at a time unless it
    /// reports itself cross-run shareable.
    pub fn add_executor(self, executor: impl Executor + 'static) -> Self {
        self.add_executor_arc(Arc::new(executor))
    }

    pub fn add_executor_arc(mut self, executor: Arc<dyn Executor>) -> Self {
        let id = executor.id().clone();
        if let Err(e) = executor.validate() {
            self.errors.push(e.to_string());
        }
        let binding = ExecutorBinding::Instance(Arc::new(BoundInstance {
            executor,
            claimed: AtomicBool::new(false),
            used: AtomicBool::new(false),
        }));
        self.bind(id, binding);
        self
    }

    /// Bind a factory that builds a fresh instance for every run.
    pub fn add_executor_factory<F>(mut self, id: impl Into<ExecutorId>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Executor> + Send + Sync + 'static,
    {
        let id = id.into();
        let probe = factory();
        if probe.id() != &id {
            self.errors.push(format!(
                "factory for '{}' produced an executor with id '{}'",
                id,
                probe.id()
            ));
        }
        if let Err(e) = probe.validate() {
            self.errors.push(e.to_string());
        }
        self.bind(id, ExecutorBinding::Factory(Arc::new(factory)));
        self
    }

    fn bind(&mut self, id: ExecutorId, binding: ExecutorBinding) {
        if self.bindings.contains_key(&id) {
            self.errors.push(format!("duplicate executor id '{}'", id));
            return;
        }
        self.order.push(id.clone());
        self.bindings.insert(id, binding);
    }

    fn next_edge_id(&self, kind: &str) -> String {
        format!("{}-{}", kind, self.edges.len())
    }

    pub fn add_edge(mut self, source: impl Into<ExecutorId>, sink: impl Into<ExecutorId>) -> Self {
        let id = self.next_edge_id("direct");
        self.edges.push(Edge::direct(id, source, sink));
        self
    }

    /// A direct edge that only forwards messages satisfying `condition`.
    pub fn add_edge_if(
        mut self,
        source: impl Into<ExecutorId>,
        sink: impl Into<ExecutorId>,
        condition: Condition,
    ) -> Self {
        let id = self.next_edge_id("direct");
        self.edges.push(Edge {
            id,
            kind: EdgeKind::Direct {
                source: source.into(),
                sink: sink.into(),
                condition: Some(condition),
            },
        });
        self
    }

    pub fn add_fan_out_edge<I, S>(mut self, source: impl Into<ExecutorId>, sinks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        let id = self.next_edge_id("fan_out");
        self.edges.push(Edge {
            id,
            kind: EdgeKind::FanOut {
                source: source.into(),
                sinks: sinks.into_iter().map(Into::into).collect(),
            },
        });
        self
    }

    pub fn add_fan_in_edge<I, S>(mut self, sources: I, sink: impl Into<ExecutorId>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExecutorId>,
    {
        let id = self.next_edge_id("fan_in");
        self.edges.push(Edge {
            id,
            kind: EdgeKind::FanIn {
                sources: sources.into_iter().map(Into::into).collect(),
                sink: sink.into(),
            },
        });
        self
    }

    pub fn add_switch<F>(mut self, source: impl Into<ExecutorId>, cases: F) -> Self
    where
        F: FnOnce(SwitchBuilder) -> SwitchBuilder,
    {
        let built = cases(SwitchBuilder::new());
        let id = self.next_edge_id("switch");
        self.edges.push(Edge {
            id,
            kind: EdgeKind::Switch {
                source: source.into(),
                cases: built.cases,
                default: built.default,
            },
        });
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Workflow> {
        let mut errors = self.errors;

        if !self.bindings.contains_key(&self.start) {
            errors.push(format!("start executor '{}' is not registered", self.start));
        }

        for edge in &self.edges {
            for endpoint in edge.sources().into_iter().chain(edge.sinks()) {
                if !self.bindings.contains_key(endpoint) {
                    errors.push(format!(
                        "edge '{}' references unknown executor '{}'",
                        edge.id, endpoint
                    ));
                }
            }
            match &edge.kind {
                EdgeKind::FanIn { sources, .. } => {
                    let distinct: HashSet<&ExecutorId> = sources.iter().collect();
                    if distinct.len() < 2 {
                        errors.push(format!(
                            "fan-in edge '{}' needs at least two distinct sources",
                            edge.id
                        ));
                    } else if distinct.len() != sources.len() {
                        errors.push(format!("fan-in edge '{}' lists a source twice", edge.id));
                    }
                }
                EdgeKind::Switch { cases, default, .. } => {
                    if cases.is_empty() {
                        errors.push(format!("switch '{}' has no cases", edge.id));
                    }
                    if default.is_none() {
                        errors.push(format!("switch '{}' has no default case", edge.id));
                    }
                }
                EdgeKind::FanOut { sinks, .. } if sinks.is_empty() => {
                    errors.push(format!("fan-out edge '{}' has no sinks", edge.id));
                }
                _ => {}
            }
        }

        if !errors.is_empty() {
            return Err(WeftError::WorkflowDefinition(errors.join("; ")));
        }

        let edges = EdgeMap::new(self.edges);
        for id in unreachable(&self.start, &self.order, &edges) {
            warn!(executor_id = %id, workflow = %self.name, "Executor is unreachable from the start executor");
        }
        debug!(
            workflow = %self.name,
            executors = self.order.len(),
            edges = edges.edges().len(),
            "Workflow built"
        );

        Ok(Workflow {
            inner: Arc::new(WorkflowDef {
                name: self.name,
                start: self.start,
                order: self.order,
                bindings: self.bindings,
                edges,
            }),
        })
    }
}

fn unreachable<'a>(start: &ExecutorId, order: &'a [ExecutorId], edges: &EdgeMap) -> Vec<&'a ExecutorId> {
    let mut seen: HashSet<ExecutorId> = HashSet::new();
    let mut queue = VecDeque::from([start.clone()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        for edge in edges.edges() {
            if edge.sources().contains(&&id) {
                queue.extend(edge.sinks().into_iter().cloned());
            }
        }
    }
    order.iter().filter(|id| !seen.contains(*id)).collect()
}

struct WorkflowDef {
    name: String,
    start: ExecutorId,
    order: Vec<ExecutorId>,
    bindings: HashMap<ExecutorId, ExecutorBinding>,
    edges: EdgeMap,
}

/// An immutable workflow graph. Cheap to clone and safe to share between runs.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowDef>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn start_id(&self) -> &ExecutorId {
        &self.inner.start
    }

    /// Executor ids in registration order.
    pub fn executor_ids(&self) -> &[ExecutorId] {
        &self.inner.order
    }

    pub fn contains(&self, id: &ExecutorId) -> bool {
        self.inner.bindings.contains_key(id)
    }

    pub fn edges(&self) -> &[Edge] {
        self.inner.edges.edges()
    }

    /// Payload types the start executor accepts.
    pub fn input_types(&self) -> Vec<TypeTag> {
        match self.inner.bindings.get(&self.inner.start) {
            Some(ExecutorBinding::Instance(instance)) => instance.executor.input_types(),
            Some(ExecutorBinding::Factory(factory)) => factory().input_types(),
            None => Vec::new(),
        }
    }

    pub(crate) fn edge_map(&self) -> &EdgeMap {
        &self.inner.edges
    }

    /// Resolve every binding into an executor for a new run.
    pub(crate) fn instantiate(&self) -> Result<RunExecutors> {
        let mut executors = HashMap::new();
        let mut claims = Vec::new();
        for id in &self.inner.order {
            let Some(binding) = self.inner.bindings.get(id) else {
                continue;
            };
            let executor = match binding {
                ExecutorBinding::Factory(factory) => factory(),
                ExecutorBinding::Instance(instance) => {
                    let shareable = instance.executor.is_cross_run_shareable();
                    if !shareable {
                        if instance
                            .claimed
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_err()
                        {
                            return Err(WeftError::InvalidArgument(format!(
                                "executor '{}' is bound to another active run; \
                                 use add_executor_factory for concurrent runs",
                                id
                            )));
                        }
                        claims.push(InstanceClaim {
                            instance: instance.clone(),
                        });
                    }
                    if instance.used.swap(true, Ordering::SeqCst) {
                        debug!(executor_id = %id, "Resetting reused executor instance");
                        instance.executor.reset();
                    }
                    instance.executor.clone()
                }
            };
            executors.insert(id.clone(), executor);
        }
        Ok(RunExecutors {
            executors,
            claims,
        })
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.inner.name)
            .field("start", &self.inner.start)
            .field("executors", &self.inner.order)
            .field("edges", &self.inner.edges.edges().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorState, FunctionExecutor};

    fn upper() -> FunctionExecutor {
        FunctionExecutor::map("upper", |s: String| Ok(s.to_uppercase()))
    }

    fn reverse() -> FunctionExecutor {
        FunctionExecutor::output("reverse", |s: String| Ok(s.chars().rev().collect::<String>()))
    }

    fn definition_error(result: Result<Workflow>) -> String {
        match result {
            Err(WeftError::WorkflowDefinition(msg)) => msg,
            other => panic!("expected definition error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_build_valid_chain() {
        let wf = WorkflowBuilder::new("upper")
            .add_executor(upper())
            .add_executor(reverse())
            .add_edge("upper", "reverse")
            .build()
            .unwrap();
        assert_eq!(wf.start_id().as_str(), "upper");
        assert_eq!(wf.executor_ids().len(), 2);
        assert_eq!(wf.edges()[0].id, "direct-0");
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let msg = definition_error(
            WorkflowBuilder::new("upper")
                .add_executor(upper())
                .add_edge("upper", "missing")
                .build(),
        );
        assert!(msg.contains("missing"));
    }

    #[test]
    fn test_missing_start_rejected() {
        let msg = definition_error(WorkflowBuilder::new("nope").add_executor(upper()).build());
        assert!(msg.contains("start executor 'nope'"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let msg = definition_error(
            WorkflowBuilder::new("upper")
                .add_executor(upper())
                .add_executor(upper())
                .build(),
        );
        assert!(msg.contains("duplicate executor id"));
    }

    #[test]
    fn test_fan_in_needs_two_sources() {
        let msg = definition_error(
            WorkflowBuilder::new("upper")
                .add_executor(upper())
                .add_executor(reverse())
                .add_fan_in_edge(["upper", "upper"], "reverse")
                .build(),
        );
        assert!(msg.contains("two distinct sources"));
    }

    #[test]
    fn test_switch_needs_default() {
        let msg = definition_error(
            WorkflowBuilder::new("upper")
                .add_executor(upper())
                .add_executor(reverse())
                .add_switch("upper", |s| {
                    s.case(Condition::new("always", |_| true), "reverse")
                })
                .build(),
        );
        assert!(msg.contains("no default"));
    }

    #[test]
    fn test_factory_id_must_match() {
        let msg = definition_error(
            WorkflowBuilder::new("upper")
                .add_executor(upper())
                .add_executor_factory("other", || Arc::new(reverse()) as Arc<dyn Executor>)
                .build(),
        );
        assert!(msg.contains("factory for 'other'"));
    }

    #[test]
    fn test_instance_claimed_exclusively_and_reset_on_reuse() {
        let state = ExecutorState::new(serde_json::json!(0));
        let exec = upper().with_state(state.clone());
        let wf = WorkflowBuilder::new("upper").add_executor(exec).build().unwrap();

        let first = wf.instantiate().unwrap();
        assert!(wf.instantiate().is_err());
        state.set(serde_json::json!(7));
        drop(first);

        let _second = wf.instantiate().unwrap();
        assert_eq!(state.get(), serde_json::json!(0));
    }

    #[test]
    fn test_release_frees_instance_while_run_is_held() {
        let wf = WorkflowBuilder::new("upper").add_executor(upper()).build().unwrap();
        let mut first = wf.instantiate().unwrap();
        assert!(wf.instantiate().is_err());
        first.release();
        assert!(wf.instantiate().is_ok());
    }

    #[test]
    fn test_shareable_instances_serve_concurrent_runs() {
        let wf = WorkflowBuilder::new("upper")
            .add_executor(upper().shareable())
            .build()
            .unwrap();
        let _a = wf.instantiate().unwrap();
        let _b = wf.instantiate().unwrap();
    }

    #[test]
    fn test_factories_build_fresh_instances() {
        let wf = WorkflowBuilder::new("upper")
            .add_executor_factory("upper", || Arc::new(upper()) as Arc<dyn Executor>)
            .build()
            .unwrap();
        let a = wf.instantiate().unwrap();
        let b = wf.instantiate().unwrap();
        let id = ExecutorId::new("upper");
        assert!(!Arc::ptr_eq(&a.executors[&id], &b.executors[&id]));
    }
}
