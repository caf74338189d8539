//! Composed steps and their invocation.

use crate::composer::Field;
use crate::config::EngineConfig;
use crate::engine::Work;
use crate::journal::{Journal, StepRecord, StepStatus};
use crate::middleware::{Flow, Middleware, Next, Phase, StepContext, SuppressPolicy};
use async_trait::async_trait;
use futures_util::FutureExt;
use kumihimo_core::{ActionError, EngineError, ErrorKind, Scope, StepName};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// State shared by every step of one run.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: Arc<EngineConfig>,
    journal: Journal,
}

impl Runtime {
    pub fn new(config: EngineConfig, journal: Journal) -> Self {
        Self {
            config: Arc::new(config),
            journal,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

/// How a step ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Skipped,
    Suppressed { kind: ErrorKind },
}

/// A step that failed, and the step the error originated in.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("step '{step}' failed: {error}")]
pub struct StepFailure {
    /// The innermost step the error came from.
    pub step: StepName,
    #[source]
    pub error: EngineError,
}

/// A composed step: one middleware per field, in application order.
pub struct Pipeline {
    name: StepName,
    middlewares: Vec<Arc<dyn Middleware>>,
    chain: Vec<Arc<dyn Middleware>>,
    exit: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("active_fields", &self.active_fields())
            .finish()
    }
}

impl Pipeline {
    pub(crate) fn new(name: StepName, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        let (exit, chain): (Vec<_>, Vec<_>) = middlewares
            .iter()
            .cloned()
            .partition(|m| m.phase() == Phase::Exit);
        Self {
            name,
            middlewares,
            chain,
            exit,
        }
    }

    pub fn name(&self) -> &StepName {
        &self.name
    }

    /// Fields of every middleware, in application order.
    pub fn fields(&self) -> Vec<Field> {
        self.middlewares.iter().map(|m| m.field()).collect()
    }

    /// Fields whose middleware does more than pass control on.
    pub fn active_fields(&self) -> Vec<Field> {
        self.middlewares
            .iter()
            .filter(|m| !m.is_noop())
            .map(|m| m.field())
            .collect()
    }

    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Runs the step in a child of `parent`.
    ///
    /// The child's writes are merged into `parent` when the step succeeds or
    /// is skipped, and when it is suppressed under [`SuppressPolicy::Keep`].
    /// Exit-phase middleware run once, after the chain, whatever its result.
    /// A panic in the chain is an action error tagged `panic`; it and an
    /// exit-phase error are subject to the step's `suppress`.
    pub async fn invoke(&self, parent: &Scope, runtime: &Runtime) -> Result<StepOutcome, StepFailure> {
        let started = Instant::now();
        let mut ctx = StepContext::new(self.name.clone(), parent.child(), runtime.clone());
        let scope = ctx.scope().clone();

        let chained = AssertUnwindSafe(Next::new(&self.chain).run(&mut ctx))
            .catch_unwind()
            .await;
        let mut result = match chained {
            Ok(result) => result,
            Err(payload) => {
                let error = panicked(&self.name, payload.as_ref());
                warn!("Step '{}' panicked: {}", self.name, error);
                self.absorb(&mut ctx, error)
            }
        };
        for middleware in &self.exit {
            if let Err(e) = middleware.apply(&mut ctx, Next::end()).await {
                match result {
                    Ok(()) => result = self.absorb(&mut ctx, e),
                    Err(_) => warn!("Step '{}' exit failed after an earlier error: {}", self.name, e),
                }
            }
        }

        let (flow, failed_step) = ctx.into_parts();
        let (outcome, status) = match result {
            Err(error) => {
                let step = failed_step.unwrap_or_else(|| self.name.clone());
                warn!("Step '{}' failed: {}", self.name, error);
                let status = StepStatus::Failed {
                    kind: error.kind(),
                    message: error.to_string(),
                };
                self.record(runtime, status, started);
                return Err(StepFailure { step, error });
            }
            Ok(()) => match flow {
                Flow::Continue => {
                    scope.merge_into_parent();
                    info!("Step '{}' completed successfully", self.name);
                    (StepOutcome::Succeeded, StepStatus::Succeeded)
                }
                Flow::Skipped => {
                    scope.merge_into_parent();
                    (StepOutcome::Skipped, StepStatus::Skipped)
                }
                Flow::Suppressed { error, policy } => {
                    if policy == SuppressPolicy::Keep {
                        scope.merge_into_parent();
                    }
                    let kind = error.kind();
                    let status = StepStatus::Suppressed {
                        kind,
                        message: error.to_string(),
                    };
                    (StepOutcome::Suppressed { kind }, status)
                }
            },
        };
        self.record(runtime, status, started);
        Ok(outcome)
    }

    /// Lets a chain middleware (`suppress`) catch an error the chain never saw.
    fn absorb(&self, ctx: &mut StepContext, error: EngineError) -> Result<(), EngineError> {
        let policy = self.chain.iter().find_map(|m| m.absorbs(ctx, &error));
        match policy {
            Some(policy) => {
                warn!("Step '{}' suppressed {}: {}", self.name, error.kind(), error);
                ctx.mark_suppressed(error, policy);
                Ok(())
            }
            None => Err(error),
        }
    }

    fn record(&self, runtime: &Runtime, status: StepStatus, started: Instant) {
        runtime.journal().record(StepRecord {
            name: self.name.clone(),
            status,
            elapsed: started.elapsed(),
        });
    }
}

/// The action error a panic inside `step` is reported as.
pub(crate) fn panicked(step: &StepName, payload: &(dyn Any + Send)) -> EngineError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    let message = match detail {
        Some(detail) => format!("step panicked: {detail}"),
        None => "step panicked".to_string(),
    };
    EngineError::Action {
        step_name: step.clone(),
        source: ActionError::tagged("panic", message),
    }
}

#[async_trait]
impl Work for Pipeline {
    fn label(&self) -> &StepName {
        &self.name
    }

    async fn perform(&self, scope: &Scope, runtime: &Runtime) -> Result<(), StepFailure> {
        self.invoke(scope, runtime).await.map(|_| ())
    }
}
