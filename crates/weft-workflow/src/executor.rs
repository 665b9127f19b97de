use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;

use weft_core::error::{Result, WeftError};
use weft_core::message::{Envelope, TypeTag, WorkflowMessage};
use weft_core::types::ExecutorId;

use crate::context::WorkflowContext;

/// A node of the workflow graph.
///
/// Executors are invoked at most once per pending message per superstep.
/// Mutable state lives behind interior mutability; the runner never calls
/// `handle` concurrently on the same instance.
pub trait Executor: Send + Sync {
    fn id(&self) -> &ExecutorId;

    /// Payload tags this executor has handlers for.
    fn input_types(&self) -> Vec<TypeTag>;

    fn can_handle(&self, tag: &TypeTag) -> bool {
        self.input_types().iter().any(|t| t == tag || t.is_json())
    }

    fn handle(&self, envelope: Envelope, ctx: WorkflowContext) -> BoxFuture<'_, Result<()>>;

    /// Restore initial state. Called when an instance is reused by a new run.
    fn reset(&self) {}

    /// Shareable instances may serve several runs at once.
    fn is_cross_run_shareable(&self) -> bool {
        false
    }

    /// Serialized state for checkpoints. `None` for stateless executors.
    fn export_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    fn import_state(&self, _state: serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Structural checks run when the workflow is built.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

pub type HandlerFn =
    Arc<dyn Fn(Envelope, WorkflowContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Typed handlers keyed by payload tag.
///
/// An exact tag match wins over a `json` catch-all handler. Registering a
/// tag twice is recorded and reported by [`HandlerSet::validate`].
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<TypeTag, HandlerFn>,
    order: Vec<TypeTag>,
    conflicts: Vec<TypeTag>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that receives the decoded payload.
    pub fn add<T, F, Fut>(&mut self, handler: F)
    where
        T: WorkflowMessage,
        F: Fn(T, WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let wrapped: HandlerFn = Arc::new(move |envelope: Envelope, ctx: WorkflowContext| {
            match envelope.payload.decode::<T>() {
                Ok(value) => handler(value, ctx).boxed(),
                Err(e) => async move { Err(e) }.boxed(),
            }
        });
        self.insert(T::type_tag(), wrapped);
    }

    /// Register a handler that receives the raw envelope.
    pub fn add_raw(&mut self, tag: TypeTag, handler: HandlerFn) {
        self.insert(tag, handler);
    }

    fn insert(&mut self, tag: TypeTag, handler: HandlerFn) {
        if self.handlers.contains_key(&tag) {
            self.conflicts.push(tag);
            return;
        }
        self.order.push(tag.clone());
        self.handlers.insert(tag, handler);
    }

    /// The most specific handler for a tag.
    pub fn resolve(&self, tag: &TypeTag) -> Option<&HandlerFn> {
        self.handlers
            .get(tag)
            .or_else(|| self.handlers.get(&TypeTag::json()))
    }

    pub fn tags(&self) -> Vec<TypeTag> {
        self.order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn validate(&self, owner: &ExecutorId) -> Result<()> {
        if let Some(tag) = self.conflicts.first() {
            return Err(WeftError::definition(format!(
                "executor '{}' registers more than one handler for '{}'",
                owner, tag
            )));
        }
        if self.handlers.is_empty() {
            return Err(WeftError::definition(format!(
                "executor '{}' has no handlers",
                owner
            )));
        }
        Ok(())
    }

    pub async fn dispatch(&self, owner: &ExecutorId, envelope: Envelope, ctx: WorkflowContext) -> Result<()> {
        match self.resolve(envelope.tag()) {
            Some(handler) => handler(envelope, ctx).await,
            None => Err(WeftError::executor(
                owner.as_str(),
                format!("no handler for '{}'", envelope.tag()),
            )),
        }
    }
}

/// JSON state cell owned by one executor instance.
///
/// Clones share the same cell, so a handler closure can capture one.
#[derive(Debug, Clone)]
pub struct ExecutorState {
    initial: serde_json::Value,
    current: Arc<Mutex<serde_json::Value>>,
}

impl ExecutorState {
    pub fn new(initial: serde_json::Value) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial.clone())),
            initial,
        }
    }

    pub fn get(&self) -> serde_json::Value {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, value: serde_json::Value) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut serde_json::Value) -> R) -> R {
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn reset(&self) {
        self.set(self.initial.clone());
    }
}

/// An executor assembled from typed async closures.
pub struct FunctionExecutor {
    id: ExecutorId,
    handlers: HandlerSet,
    state: Option<ExecutorState>,
    shareable: bool,
}

impl FunctionExecutor {
    pub fn new(id: impl Into<ExecutorId>) -> Self {
        Self {
            id: id.into(),
            handlers: HandlerSet::new(),
            state: None,
            shareable: false,
        }
    }

    /// Add a handler for payloads of type `T`.
    pub fn handler<T, F, Fut>(mut self, handler: F) -> Self
    where
        T: WorkflowMessage,
        F: Fn(T, WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.add::<T, F, Fut>(handler);
        self
    }

    /// An executor that transforms `I` into `O` and sends the result on.
    pub fn map<I, O, F>(id: impl Into<ExecutorId>, f: F) -> Self
    where
        I: WorkflowMessage,
        O: WorkflowMessage,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(id).handler::<I, _, _>(move |input, ctx| {
            let f = f.clone();
            async move { ctx.send_message(&f(input)?) }
        })
    }

    /// An executor that transforms `I` into `O` and yields it as workflow output.
    pub fn output<I, O, F>(id: impl Into<ExecutorId>, f: F) -> Self
    where
        I: WorkflowMessage,
        O: WorkflowMessage,
        F: Fn(I) -> Result<O> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(id).handler::<I, _, _>(move |input, ctx| {
            let f = f.clone();
            async move { ctx.yield_output(&f(input)?) }
        })
    }

    /// Attach a state cell that takes part in reset and checkpoints.
    pub fn with_state(mut self, state: ExecutorState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn shareable(mut self) -> Self {
        self.shareable = true;
        self
    }
}

impl Executor for FunctionExecutor {
    fn id(&self) -> &ExecutorId {
        &self.id
    }

    fn input_types(&self) -> Vec<TypeTag> {
        self.handlers.tags()
    }

    fn handle(&self, envelope: Envelope, ctx: WorkflowContext) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.handlers.dispatch(&self.id, envelope, ctx))
    }

    fn reset(&self) {
        if let Some(state) = &self.state {
            state.reset();
        }
    }

    fn is_cross_run_shareable(&self) -> bool {
        self.shareable
    }

    fn export_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.state.as_ref().map(|s| s.get()))
    }

    fn import_state(&self, state: serde_json::Value) -> Result<()> {
        match &self.state {
            Some(cell) => {
                cell.set(state);
                Ok(())
            }
            None => Err(WeftError::CheckpointMismatch(format!(
                "executor '{}' is stateless but the checkpoint carries state for it",
                self.id
            ))),
        }
    }

    fn validate(&self) -> Result<()> {
        self.handlers.validate(&self.id)
    }
}
