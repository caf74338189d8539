//! `arguments`: writes declared values into the step scope.

use super::{expect_callable, expect_map, Middleware, Next, StepContext};
use crate::composer::{Field, FieldInput};
use crate::description::Description;
use async_trait::async_trait;
use kumihimo_core::{Callable, EngineError, Value};
use std::sync::Arc;

/// Value of one argument.
#[derive(Debug, Clone)]
pub enum Argument {
    Literal(Value),
    /// Resolved against the step scope when the step runs.
    Lazy(Callable),
}

#[derive(Debug, Clone)]
pub struct Arguments {
    entries: Vec<(String, Argument)>,
}

impl Arguments {
    pub fn new(entries: Vec<(String, Argument)>) -> Self {
        Self { entries }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    let path = input.path;
    let items = match input.value {
        Description::List(items) => items,
        Description::Map(map) if is_single(&map) => vec![Description::Map(map)],
        Description::Map(map) => map
            .into_iter()
            .map(|(name, value)| Description::map([("name", Description::from(name)), ("value", value)]))
            .collect(),
        other => {
            return Err(EngineError::malformed(
                path,
                format!("expected a map or a list, found {}", other.type_name()),
            ))
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        let at = format!("{path}[{i}]");
        let mut item = expect_map(item, &at, &["name", "value"])?;
        let name = item
            .shift_remove("name")
            .and_then(|n| n.as_str().map(str::to_string))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::malformed(&at, "expected a non-empty string 'name'"))?;
        let value = item.shift_remove("value").unwrap_or(Description::Value(Value::Null));
        entries.push((name, argument(value, &format!("{at}.value"))?));
    }
    Ok(Arc::new(Arguments::new(entries)))
}

fn is_single(map: &indexmap::IndexMap<String, Description>) -> bool {
    map.len() == 2 && map.contains_key("name") && map.contains_key("value")
}

fn argument(value: Description, path: &str) -> Result<Argument, EngineError> {
    if let Description::Callable(_) = value {
        return expect_callable(&value, path).map(Argument::Lazy);
    }
    value
        .to_value()
        .map(Argument::Literal)
        .ok_or_else(|| EngineError::malformed(path, "callables may only appear as the whole value"))
}

#[async_trait]
impl Middleware for Arguments {
    fn field(&self) -> Field {
        Field::Arguments
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        for (name, argument) in &self.entries {
            let value = match argument {
                Argument::Literal(value) => value.clone(),
                Argument::Lazy(callable) => ctx.call(callable).await?,
            };
            ctx.scope().insert(name.as_str(), value);
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::Composer;
    use crate::middleware::testing;
    use kumihimo_core::{Scope, Signature};
    use serde_json::json;

    fn built(value: Description) -> Result<Arc<dyn Middleware>, EngineError> {
        let composer = Composer::standard();
        build(FieldInput {
            step: &"s".into(),
            value,
            path: "root.arguments".into(),
            composer: &composer,
        })
    }

    #[tokio::test]
    async fn test_map_shorthand_in_order() {
        let double = Callable::sync("double", Signature::new().positional("base"), |args| {
            Ok(json!(args.get("base").and_then(Value::as_i64).unwrap_or_default() * 2))
        });
        let arguments = built(Description::map([
            ("base", Description::from(21_i64)),
            ("doubled", double.into()),
            ("config", json!({"retries": 2}).into()),
        ]))
        .unwrap();

        let mut ctx = testing::context(Scope::new());
        arguments.apply(&mut ctx, Next::end()).await.unwrap();
        assert_eq!(ctx.scope().get("doubled"), Some(json!(42)));
        assert_eq!(ctx.scope().get("config"), Some(json!({"retries": 2})));
    }

    #[tokio::test]
    async fn test_single_and_list_forms() {
        let single = built(json!({"name": "x", "value": 1}).into()).unwrap();
        let mut ctx = testing::context(Scope::new());
        single.apply(&mut ctx, Next::end()).await.unwrap();
        assert_eq!(ctx.scope().local_entries().len(), 1);
        assert_eq!(ctx.scope().get("x"), Some(json!(1)));

        let list = built(json!([{"name": "a", "value": "A"}, {"name": "b", "value": null}]).into())
            .unwrap();
        let mut ctx = testing::context(Scope::new());
        list.apply(&mut ctx, Next::end()).await.unwrap();
        assert_eq!(ctx.scope().get("b"), Some(Value::Null));
    }

    #[test]
    fn test_malformed_entries() {
        let error = built(json!([{"value": 1}]).into()).unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed("root.arguments[0]", "expected a non-empty string 'name'")
        );

        let nested = Description::map([(
            "wrapped",
            Description::list([Callable::constant("c", json!(1))]),
        )]);
        assert!(built(nested).is_err());
    }
}
