//! Middleware: one per description field, chained into a pipeline.
//!
//! Each middleware wraps the remainder of the chain. It may act before
//! calling [`Next::run`], after it, or instead of it.

pub mod action;
pub mod arguments;
pub mod cleanup;
pub mod log;
pub mod name;
pub mod setup;
pub mod skip;
pub mod substeps;
pub mod suppress;
pub mod validator;

use crate::composer::Field;
use crate::config::EngineConfig;
use crate::description::Description;
use crate::journal::Journal;
use crate::pipeline::Runtime;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use kumihimo_core::{ActionError, Callable, EngineError, Scope, StepName, Value};
use std::fmt;
use std::sync::Arc;

pub use suppress::SuppressPolicy;

/// When a middleware runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Wraps the rest of the chain.
    Chain,
    /// Runs once after the chain has returned, on every exit path.
    Exit,
}

/// How a step ended, as far as the chain is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    Skipped,
    Suppressed {
        error: EngineError,
        policy: SuppressPolicy,
    },
}

/// Per-invocation state handed down the chain.
pub struct StepContext {
    step: StepName,
    scope: Scope,
    runtime: Runtime,
    flow: Flow,
    failed_step: Option<StepName>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step)
            .field("scope", &self.scope)
            .field("flow", &self.flow)
            .finish()
    }
}

impl StepContext {
    pub(crate) fn new(step: StepName, scope: Scope, runtime: Runtime) -> Self {
        Self {
            step,
            scope,
            runtime,
            flow: Flow::Continue,
            failed_step: None,
        }
    }

    pub fn step(&self) -> &StepName {
        &self.step
    }

    /// The step's own scope layer.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &EngineConfig {
        self.runtime.config()
    }

    pub fn journal(&self) -> &Journal {
        self.runtime.journal()
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn mark_skipped(&mut self) {
        self.flow = Flow::Skipped;
    }

    pub fn mark_suppressed(&mut self, error: EngineError, policy: SuppressPolicy) {
        self.failed_step = None;
        self.flow = Flow::Suppressed { error, policy };
    }

    /// Records which nested step an error bubbling through this one came from.
    pub fn set_failed_step(&mut self, step: StepName) {
        self.failed_step = Some(step);
    }

    pub(crate) fn into_parts(self) -> (Flow, Option<StepName>) {
        (self.flow, self.failed_step)
    }

    /// Binds `callable` against the step scope and invokes it under the
    /// configured timeout.
    pub async fn call(&self, callable: &Callable) -> Result<Value, EngineError> {
        let call = callable.bind(&self.scope)?;
        let result = match self.config().action_timeout {
            Some(limit) => match tokio::time::timeout(limit, call.invoke()).await {
                Ok(result) => result,
                Err(_) => Err(ActionError::tagged(
                    "timeout",
                    format!("'{}' timed out after {:?}", callable.name(), limit),
                )),
            },
            None => call.invoke().await,
        };
        result.map_err(|source| EngineError::Action {
            step_name: self.step.clone(),
            source,
        })
    }
}

/// The remainder of a chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { rest: chain }
    }

    /// An empty remainder.
    pub fn end() -> Next<'static> {
        Next { rest: &[] }
    }

    /// Runs the remainder against `ctx`.
    pub fn run(self, ctx: &'a mut StepContext) -> BoxFuture<'a, Result<(), EngineError>> {
        match self.rest.split_first() {
            Some((head, tail)) => head.apply(ctx, Next { rest: tail }),
            None => Box::pin(async { Ok(()) }),
        }
    }
}

/// One composable behaviour of a step.
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// The description field this middleware implements.
    fn field(&self) -> Field;

    fn phase(&self) -> Phase {
        Phase::Chain
    }

    /// Whether this middleware only passes control on.
    fn is_noop(&self) -> bool {
        false
    }

    /// Policy under which an error raised outside the chain (a panic or a
    /// failing exit hook) is turned into a suppressed outcome, if any.
    fn absorbs(&self, _ctx: &StepContext, _error: &EngineError) -> Option<SuppressPolicy> {
        None
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError>;
}

/// Stands in for an absent field.
#[derive(Debug, Clone, Copy)]
pub struct Noop {
    field: Field,
}

impl Noop {
    pub fn new(field: Field) -> Self {
        Self { field }
    }
}

#[async_trait]
impl Middleware for Noop {
    fn field(&self) -> Field {
        self.field
    }

    fn is_noop(&self) -> bool {
        true
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        next.run(ctx).await
    }
}

/// Accepts a callable whose signature is well formed.
pub(crate) fn expect_callable(value: &Description, path: &str) -> Result<Callable, EngineError> {
    let callable = value.as_callable().ok_or_else(|| {
        EngineError::malformed(path, format!("expected a callable, found {}", value.type_name()))
    })?;
    callable.signature().check().map_err(|e| {
        EngineError::malformed(path, format!("callable '{}': {e}", callable.name()))
    })?;
    Ok(callable.clone())
}

/// Accepts a callable or a list of callables.
pub(crate) fn expect_callables(
    value: Description,
    path: &str,
) -> Result<Vec<Callable>, EngineError> {
    match value {
        Description::List(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| expect_callable(item, &format!("{path}[{i}]")))
            .collect(),
        single => expect_callable(&single, path).map(|c| vec![c]),
    }
}

/// Splits a map into its entries, rejecting keys outside `allowed`.
pub(crate) fn expect_map(
    value: Description,
    path: &str,
    allowed: &[&str],
) -> Result<indexmap::IndexMap<String, Description>, EngineError> {
    let Description::Map(map) = value else {
        return Err(EngineError::malformed(
            path,
            format!("expected a map, found {}", value.type_name()),
        ));
    };
    if let Some(key) = map.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(EngineError::malformed(path, format!("unknown key '{key}'")));
    }
    Ok(map)
}
