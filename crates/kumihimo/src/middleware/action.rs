//! `action`: the step's own callable.

use super::{expect_callable, Middleware, Next, Noop, StepContext};
use crate::composer::{Field, FieldInput};
use crate::description::Description;
use async_trait::async_trait;
use kumihimo_core::{Callable, EngineError};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Action {
    callable: Callable,
}

impl Action {
    pub fn new(callable: Callable) -> Self {
        Self { callable }
    }

    pub fn callable(&self) -> &Callable {
        &self.callable
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    match input.value {
        Description::Void => Ok(Arc::new(Noop::new(Field::Action))),
        value => Ok(Arc::new(Action::new(expect_callable(&value, &input.path)?))),
    }
}

#[async_trait]
impl Middleware for Action {
    fn field(&self) -> Field {
        Field::Action
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        debug!("Invoking '{}'", self.callable.name());
        let output = ctx.call(&self.callable).await?;
        if !output.is_null() {
            ctx.scope().insert(ctx.step().as_str(), output);
        }
        next.run(ctx).await
    }
}
