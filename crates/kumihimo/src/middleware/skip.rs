//! `skip`: bypasses the remainder when its condition holds.

use super::{expect_callable, expect_map, Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use crate::description::Description;
use async_trait::async_trait;
use kumihimo_core::{is_truthy, Callable, EngineError, Value};
use std::sync::Arc;
use tracing::info;

/// The skip condition.
#[derive(Debug, Clone)]
pub enum Condition {
    Fixed(bool),
    Predicate(Callable),
}

#[derive(Debug, Clone)]
pub struct Skip {
    condition: Condition,
    /// Runs in place of the step when it is skipped.
    action: Option<Callable>,
}

impl Skip {
    pub fn new(condition: Condition, action: Option<Callable>) -> Self {
        Self { condition, action }
    }

    async fn holds(&self, ctx: &StepContext) -> Result<bool, EngineError> {
        match &self.condition {
            Condition::Fixed(value) => Ok(*value),
            Condition::Predicate(predicate) => ctx.call(predicate).await.map(|v| is_truthy(&v)),
        }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    let path = input.path;
    let canonical = match input.value {
        Description::Map(map) => Description::Map(map),
        value => Description::map([("value", value)]),
    };
    let mut map = expect_map(canonical, &path, &["value", "action"])?;

    let value_path = format!("{path}.value");
    let condition = match map.shift_remove("value") {
        Some(Description::Value(Value::Bool(b))) => Condition::Fixed(b),
        Some(predicate @ Description::Callable(_)) => {
            Condition::Predicate(expect_callable(&predicate, &value_path)?)
        }
        Some(other) => {
            return Err(EngineError::malformed(
                value_path,
                format!("expected a boolean or a callable, found {}", other.type_name()),
            ))
        }
        None => return Err(EngineError::malformed(&path, "missing 'value'")),
    };
    let action = map
        .shift_remove("action")
        .map(|action| expect_callable(&action, &format!("{path}.action")))
        .transpose()?;

    Ok(Arc::new(Skip::new(condition, action)))
}

#[async_trait]
impl Middleware for Skip {
    fn field(&self) -> Field {
        Field::Skip
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        if !self.holds(ctx).await? {
            return next.run(ctx).await;
        }

        info!("Step '{}' skipped", ctx.step());
        if let Some(action) = &self.action {
            let output = ctx.call(action).await?;
            if !output.is_null() {
                ctx.scope().insert(ctx.step().as_str(), output);
            }
        }
        ctx.mark_skipped();
        Ok(())
    }
}
