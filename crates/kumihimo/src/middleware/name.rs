//! `name`: labels the step and opens its tracing span.

use super::{Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use async_trait::async_trait;
use kumihimo_core::{EngineError, StepName};
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct Name {
    step: StepName,
}

impl Name {
    pub fn new(step: StepName) -> Self {
        Self { step }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    Ok(Arc::new(Name::new(input.step.clone())))
}

#[async_trait]
impl Middleware for Name {
    fn field(&self) -> Field {
        Field::Name
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        let span = info_span!("step", name = %self.step);
        async move {
            debug!("Entering step");
            next.run(ctx).await
        }
        .instrument(span)
        .await
    }
}
