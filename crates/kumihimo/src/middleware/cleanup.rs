//! `cleanup`: release hooks that run on every exit path.

use super::{expect_callables, Middleware, Next, Phase, StepContext};
use crate::composer::{Field, FieldInput};
use async_trait::async_trait;
use kumihimo_core::{Callable, EngineError};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Cleanup {
    hooks: Vec<Callable>,
}

impl Cleanup {
    pub fn new(hooks: Vec<Callable>) -> Self {
        Self { hooks }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    Ok(Arc::new(Cleanup::new(expect_callables(input.value, &input.path)?)))
}

#[async_trait]
impl Middleware for Cleanup {
    fn field(&self) -> Field {
        Field::Cleanup
    }

    fn phase(&self) -> Phase {
        Phase::Exit
    }

    /// Runs every hook in reverse order, even after one fails, and reports
    /// the first failure.
    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        let mut first_error = None;
        for hook in self.hooks.iter().rev() {
            debug!("Running cleanup '{}'", hook.name());
            if let Err(e) = ctx.call(hook).await {
                warn!("Cleanup '{}' of step '{}' failed: {}", hook.name(), ctx.step(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => next.run(ctx).await,
        }
    }
}
