//! `validator`: predicates checked around the rest of the step.

use super::{expect_callable, expect_map, Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use crate::description::Description;
use async_trait::async_trait;
use kumihimo_core::{is_truthy, Callable, EngineError};
use std::sync::Arc;

/// A predicate and the message reported when it fails.
#[derive(Debug, Clone)]
pub struct Check {
    predicate: Callable,
    message: String,
}

impl Check {
    pub fn new(predicate: Callable, message: Option<String>) -> Self {
        let message =
            message.unwrap_or_else(|| format!("predicate '{}' returned a falsy value", predicate.name()));
        Self { predicate, message }
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), EngineError> {
        let verdict = ctx.call(&self.predicate).await?;
        if is_truthy(&verdict) {
            Ok(())
        } else {
            Err(EngineError::ValidationFailed {
                step_name: ctx.step().clone(),
                message: self.message.clone(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    before: Option<Check>,
    after: Option<Check>,
}

impl Validator {
    pub fn new(before: Option<Check>, after: Option<Check>) -> Self {
        Self { before, after }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    let path = input.path;
    let canonical = match input.value {
        Description::Map(map) if map.contains_key("predicate") => {
            Description::map([("before", Description::Map(map))])
        }
        Description::Map(map) => Description::Map(map),
        predicate => Description::map([("before", predicate)]),
    };
    let mut map = expect_map(canonical, &path, &["before", "after"])?;

    let before = map
        .shift_remove("before")
        .map(|c| check(c, &format!("{path}.before")))
        .transpose()?;
    let after = map
        .shift_remove("after")
        .map(|c| check(c, &format!("{path}.after")))
        .transpose()?;
    if before.is_none() && after.is_none() {
        return Err(EngineError::malformed(path, "expected 'before' or 'after'"));
    }
    Ok(Arc::new(Validator::new(before, after)))
}

fn check(value: Description, path: &str) -> Result<Check, EngineError> {
    let value = match value {
        callable @ Description::Callable(_) => Description::map([("predicate", callable)]),
        other => other,
    };
    let mut map = expect_map(value, path, &["predicate", "message"])?;
    let predicate = map
        .shift_remove("predicate")
        .ok_or_else(|| EngineError::malformed(path, "missing 'predicate'"))?;
    let predicate = expect_callable(&predicate, &format!("{path}.predicate"))?;
    let message = match map.shift_remove("message") {
        None => None,
        Some(message) => Some(
            message
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| EngineError::malformed(format!("{path}.message"), "expected a string"))?,
        ),
    };
    Ok(Check::new(predicate, message))
}

#[async_trait]
impl Middleware for Validator {
    fn field(&self) -> Field {
        Field::Validator
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        if let Some(before) = &self.before {
            before.run(ctx).await?;
        }
        next.run(ctx).await?;
        if let Some(after) = &self.after {
            after.run(ctx).await?;
        }
        Ok(())
    }
}
