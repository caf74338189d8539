//! `log`: emits a message once the action has run.

use super::{expect_callable, expect_map, Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use crate::description::Description;
use crate::logging::parse_level;
use async_trait::async_trait;
use kumihimo_core::{Callable, EngineError, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn, Level};

#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    /// Rendered from the callable's result.
    Computed(Callable),
}

#[derive(Debug, Clone)]
pub struct Log {
    message: Message,
    level: Level,
}

impl Log {
    pub fn new(message: Message, level: Level) -> Self {
        Self { message, level }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    async fn render(&self, ctx: &StepContext) -> Result<String, EngineError> {
        match &self.message {
            Message::Text(text) => Ok(text.clone()),
            Message::Computed(callable) => Ok(match ctx.call(callable).await? {
                Value::String(text) => text,
                other => other.to_string(),
            }),
        }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    let path = input.path;
    let canonical = match input.value {
        Description::Map(map) => Description::Map(map),
        message => Description::map([("message", message)]),
    };
    let mut map = expect_map(canonical, &path, &["message", "level"])?;

    let message_path = format!("{path}.message");
    let message = match map.shift_remove("message") {
        Some(Description::Value(Value::String(text))) => Message::Text(text),
        Some(callable @ Description::Callable(_)) => {
            Message::Computed(expect_callable(&callable, &message_path)?)
        }
        Some(other) => {
            return Err(EngineError::malformed(
                message_path,
                format!("expected text or a callable, found {}", other.type_name()),
            ))
        }
        None => return Err(EngineError::malformed(&path, "missing 'message'")),
    };

    let level = parse_level_field(map.shift_remove("level"), &path)?;
    Ok(Arc::new(Log::new(message, level)))
}

fn parse_level_field(level: Option<Description>, path: &str) -> Result<Level, EngineError> {
    match level {
        None => Ok(Level::INFO),
        Some(level) => level.as_str().and_then(parse_level).ok_or_else(|| {
            EngineError::malformed(
                format!("{path}.level"),
                "expected one of trace, debug, info, warn, error",
            )
        }),
    }
}

#[async_trait]
impl Middleware for Log {
    fn field(&self) -> Field {
        Field::Log
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        let message = self.render(ctx).await?;
        let step = ctx.step().as_str();
        if self.level == Level::TRACE {
            trace!(step, "{}", message);
        } else if self.level == Level::DEBUG {
            debug!(step, "{}", message);
        } else if self.level == Level::INFO {
            info!(step, "{}", message);
        } else if self.level == Level::WARN {
            warn!(step, "{}", message);
        } else {
            error!(step, "{}", message);
        }
        next.run(ctx).await
    }
}
