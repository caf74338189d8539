//! `setup`: hooks run before the rest of the step.

use super::{expect_callables, Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use async_trait::async_trait;
use kumihimo_core::{Callable, EngineError, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Setup {
    hooks: Vec<Callable>,
}

impl Setup {
    pub fn new(hooks: Vec<Callable>) -> Self {
        Self { hooks }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    Ok(Arc::new(Setup::new(expect_callables(input.value, &input.path)?)))
}

#[async_trait]
impl Middleware for Setup {
    fn field(&self) -> Field {
        Field::Setup
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        for hook in &self.hooks {
            debug!("Running setup '{}'", hook.name());
            // An object result provides entries for the rest of the step.
            if let Value::Object(entries) = ctx.call(hook).await? {
                ctx.scope().extend(entries);
            }
        }
        next.run(ctx).await
    }
}
