//! `suppress`: turns matching run-time errors of the remainder into a
//! suppressed outcome.

use super::{expect_map, Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use crate::description::Description;
use async_trait::async_trait;
use kumihimo_core::{EngineError, ErrorKind, Value};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

/// What happens to a suppressed step's local writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressPolicy {
    /// Writes made before the failure are dropped.
    #[default]
    Discard,
    /// Writes made before the failure are merged like on success.
    Keep,
}

impl FromStr for SuppressPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(SuppressPolicy::Discard),
            "keep" => Ok(SuppressPolicy::Keep),
            other => Err(format!("unknown suppress policy '{other}'")),
        }
    }
}

impl fmt::Display for SuppressPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuppressPolicy::Discard => f.write_str("discard"),
            SuppressPolicy::Keep => f.write_str("keep"),
        }
    }
}

/// One entry of a suppress list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Kind(ErrorKind),
    /// An action error carrying this tag.
    Tag(String),
}

impl Matcher {
    fn parse(text: &str, path: &str) -> Result<Self, EngineError> {
        match text.parse::<ErrorKind>() {
            Ok(kind) if kind.is_suppressible() => Ok(Matcher::Kind(kind)),
            Ok(kind) => Err(EngineError::malformed(
                path,
                format!("{kind} is a composition-time error and cannot be suppressed"),
            )),
            Err(()) => Ok(Matcher::Tag(text.to_string())),
        }
    }

    pub fn matches(&self, error: &EngineError) -> bool {
        match self {
            Matcher::Kind(kind) => error.kind() == *kind,
            Matcher::Tag(tag) => error.action_tag() == Some(tag.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Suppress {
    matchers: Vec<Matcher>,
    policy: Option<SuppressPolicy>,
}

impl Suppress {
    pub fn new(matchers: Vec<Matcher>, policy: Option<SuppressPolicy>) -> Self {
        Self { matchers, policy }
    }

    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    fn catches(&self, error: &EngineError) -> bool {
        error.is_suppressible() && self.matchers.iter().any(|m| m.matches(error))
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    let path = input.path;
    let canonical = match input.value {
        Description::Map(map) => Description::Map(map),
        kinds => Description::map([("kinds", kinds)]),
    };
    let mut map = expect_map(canonical, &path, &["kinds", "policy"])?;

    let kinds = match map.shift_remove("kinds") {
        Some(Description::List(items)) => items,
        Some(single @ Description::Value(Value::String(_))) => vec![single],
        Some(other) => {
            return Err(EngineError::malformed(
                format!("{path}.kinds"),
                format!("expected a list of error kinds, found {}", other.type_name()),
            ))
        }
        None => return Err(EngineError::malformed(&path, "missing 'kinds'")),
    };
    let matchers = kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let at = format!("{path}.kinds[{i}]");
            kind.as_str()
                .ok_or_else(|| EngineError::malformed(&at, "expected an error kind name"))
                .and_then(|text| Matcher::parse(text, &at))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let policy = match map.shift_remove("policy") {
        None => None,
        Some(policy) => Some(
            policy
                .as_str()
                .ok_or_else(|| EngineError::malformed(format!("{path}.policy"), "expected a string"))?
                .parse::<SuppressPolicy>()
                .map_err(|reason| EngineError::malformed(format!("{path}.policy"), reason))?,
        ),
    };

    Ok(Arc::new(Suppress::new(matchers, policy)))
}

#[async_trait]
impl Middleware for Suppress {
    fn field(&self) -> Field {
        Field::Suppress
    }

    fn absorbs(&self, ctx: &StepContext, error: &EngineError) -> Option<SuppressPolicy> {
        self.catches(error)
            .then(|| self.policy.unwrap_or(ctx.config().suppress_policy))
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        match next.run(ctx).await {
            Err(error) if self.catches(&error) => {
                warn!("Step '{}' suppressed {}: {}", ctx.step(), error.kind(), error);
                let policy = self.policy.unwrap_or(ctx.config().suppress_policy);
                ctx.mark_suppressed(error, policy);
                Ok(())
            }
            other => other,
        }
    }
}
