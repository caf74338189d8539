//! `substeps`: nested steps, scheduled and executed inside this one.

use super::{expect_map, Middleware, Next, StepContext};
use crate::composer::{Composer, Field, FieldInput};
use crate::description::Description;
use crate::engine::drive;
use crate::pipeline::Pipeline;
use crate::schedule::Schedule;
use crate::scheduler::{Concurrency, Scheduler, Scheduling};
use async_trait::async_trait;
use kumihimo_core::{Callable, EngineError, Value};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Where the nested steps come from.
#[derive(Debug, Clone)]
pub enum Steps {
    Composed(Vec<Arc<Pipeline>>),
    /// A callable returning a list of step descriptions, composed each time
    /// the parent runs.
    Computed { callable: Callable, composer: Composer },
}

/// A bound on active groups, fixed or computed when the parent runs.
#[derive(Debug, Clone)]
pub enum Limit {
    Fixed(Concurrency),
    Computed(Callable),
}

/// A sibling named in `requires`, by step name or position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRef {
    Name(String),
    Index(usize),
}

/// `(dependent, prerequisite)`: the first cannot start before the second completes.
pub type Requirement = (StepRef, StepRef);

#[derive(Debug, Clone)]
pub enum Arrangement {
    Sequential,
    Parallel(Limit),
    /// An explicit dependency graph; unrelated steps run side by side.
    Requires { pairs: Vec<Requirement>, limit: Limit },
}

#[derive(Debug, Clone)]
pub struct Substeps {
    steps: Steps,
    arrangement: Arrangement,
    path: String,
}

impl Substeps {
    pub fn new(steps: Steps, arrangement: Arrangement, path: impl Into<String>) -> Self {
        Self {
            steps,
            arrangement,
            path: path.into(),
        }
    }

    /// Steps composed up front; empty when they are computed.
    pub fn children(&self) -> &[Arc<Pipeline>] {
        match &self.steps {
            Steps::Composed(children) => children,
            Steps::Computed { .. } => &[],
        }
    }

    pub fn arrangement(&self) -> &Arrangement {
        &self.arrangement
    }

    /// The scheduling policy, when it is known before the parent runs.
    pub fn scheduling(&self) -> Option<Scheduling> {
        match &self.arrangement {
            Arrangement::Sequential => Some(Scheduling::Sequential),
            Arrangement::Parallel(Limit::Fixed(concurrency)) => Some(Scheduling::Parallel(*concurrency)),
            _ => None,
        }
    }

    async fn children_for(&self, ctx: &StepContext) -> Result<Vec<Arc<Pipeline>>, EngineError> {
        let (callable, composer) = match &self.steps {
            Steps::Composed(children) => return Ok(children.clone()),
            Steps::Computed { callable, composer } => (callable, composer),
        };
        let path = format!("{}.steps", self.path);
        let items = match ctx.call(callable).await? {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::malformed(
                    &path,
                    format!(
                        "'{}' must return a list of steps, returned {}",
                        callable.name(),
                        Description::from(other).type_name()
                    ),
                ))
            }
        };
        debug!("Step '{}' computed {} substeps", ctx.step(), items.len());
        items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                composer
                    .compose_at(Description::from(item), &format!("{path}[{i}]"))
                    .map(Arc::new)
            })
            .collect()
    }

    async fn concurrency(&self, limit: &Limit, ctx: &StepContext) -> Result<Concurrency, EngineError> {
        match limit {
            Limit::Fixed(concurrency) => Ok(*concurrency),
            Limit::Computed(callable) => {
                let value = ctx.call(callable).await?;
                parse_concurrency(Some(value.into()), &format!("{}.concurrency", self.path))
            }
        }
    }

    async fn schedule(
        &self,
        ctx: &StepContext,
        children: Vec<Arc<Pipeline>>,
    ) -> Result<Schedule<Arc<Pipeline>>, EngineError> {
        match &self.arrangement {
            Arrangement::Sequential => Ok(Scheduler::new(Scheduling::Sequential).schedule(children)),
            Arrangement::Parallel(limit) => {
                let concurrency = self.concurrency(limit, ctx).await?;
                Ok(Scheduler::new(Scheduling::Parallel(concurrency)).schedule(children))
            }
            Arrangement::Requires { pairs, limit } => {
                let positions = resolve(pairs, &children, &self.path)?;
                let concurrency = self.concurrency(limit, ctx).await?;
                Scheduler::new(Scheduling::Parallel(concurrency))
                    .schedule_dependencies(children, &positions)
                    .ok_or_else(|| cyclic(&self.path))
            }
        }
    }
}

pub(crate) fn build(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
    Ok(Arc::new(parse(input)?))
}

fn parse(input: FieldInput<'_>) -> Result<Substeps, EngineError> {
    let path = input.path;
    let canonical = match input.value {
        steps @ (Description::List(_) | Description::Callable(_)) => Description::map([
            ("steps", steps),
            ("scheduling", Description::from("sequential")),
        ]),
        Description::Map(mut map) if map.contains_key("parallel") => {
            let steps = map.shift_remove("parallel").unwrap_or_default();
            map.insert("steps".into(), steps);
            map.insert("scheduling".into(), Description::from("parallel"));
            Description::Map(map)
        }
        other => other,
    };
    let mut map = expect_map(canonical, &path, &["steps", "scheduling", "concurrency", "requires"])?;

    let steps = match map.shift_remove("steps") {
        Some(Description::List(steps)) => Steps::Composed(
            steps
                .into_iter()
                .enumerate()
                .map(|(i, step)| {
                    input
                        .composer
                        .compose_at(step, &format!("{path}[{i}]"))
                        .map(Arc::new)
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(Description::Callable(callable)) => Steps::Computed {
            callable,
            composer: input.composer.clone(),
        },
        Some(other) => {
            return Err(EngineError::malformed(
                format!("{path}.steps"),
                format!("expected a list of steps or a callable, found {}", other.type_name()),
            ))
        }
        None => return Err(EngineError::malformed(&path, "missing 'steps'")),
    };

    let concurrency = parse_limit(map.shift_remove("concurrency"), &format!("{path}.concurrency"))?;
    let requires = map
        .shift_remove("requires")
        .map(|value| parse_requires(value, &format!("{path}.requires")))
        .transpose()?;
    let scheduling = map.shift_remove("scheduling");

    let arrangement = match (scheduling.as_ref().map(Description::as_str), requires) {
        (None | Some(Some("sequential")), None) if concurrency.is_none() => Arrangement::Sequential,
        (None | Some(Some("sequential")), None) => {
            return Err(EngineError::malformed(
                format!("{path}.concurrency"),
                "concurrency only applies to parallel substeps",
            ))
        }
        (Some(Some("sequential")), Some(_)) if concurrency.is_some() => {
            return Err(EngineError::malformed(
                format!("{path}.concurrency"),
                "concurrency only applies to parallel substeps",
            ))
        }
        (Some(Some("sequential")), Some(pairs)) => Arrangement::Requires {
            pairs,
            limit: Limit::Fixed(Concurrency::Bounded(NonZeroUsize::MIN)),
        },
        (None | Some(Some("parallel")), Some(pairs)) => Arrangement::Requires {
            pairs,
            limit: concurrency.unwrap_or(Limit::Fixed(Concurrency::Unbounded)),
        },
        (Some(Some("parallel")), None) => {
            Arrangement::Parallel(concurrency.unwrap_or(Limit::Fixed(Concurrency::Unbounded)))
        }
        (Some(Some(other)), _) => {
            return Err(EngineError::malformed(
                format!("{path}.scheduling"),
                format!("unknown scheduling '{other}'"),
            ))
        }
        (Some(None), _) => {
            return Err(EngineError::malformed(
                format!("{path}.scheduling"),
                "expected \"sequential\" or \"parallel\"",
            ))
        }
    };

    if let (Steps::Composed(children), Arrangement::Requires { pairs, .. }) = (&steps, &arrangement) {
        let positions = resolve(pairs, children, &path)?;
        let placeholders = vec![(); children.len()];
        if Scheduler::new(Scheduling::unbounded())
            .schedule_dependencies(placeholders, &positions)
            .is_none()
        {
            return Err(cyclic(&path));
        }
    }

    Ok(Substeps::new(steps, arrangement, path))
}

fn parse_limit(value: Option<Description>, path: &str) -> Result<Option<Limit>, EngineError> {
    match value {
        None => Ok(None),
        Some(Description::Callable(callable)) => Ok(Some(Limit::Computed(callable))),
        Some(value) => parse_concurrency(Some(value), path).map(|c| Some(Limit::Fixed(c))),
    }
}

fn parse_concurrency(value: Option<Description>, path: &str) -> Result<Concurrency, EngineError> {
    match value {
        None => Ok(Concurrency::Unbounded),
        Some(Description::Value(Value::String(s))) if s == "unbounded" => Ok(Concurrency::Unbounded),
        Some(Description::Value(Value::Number(n))) => match n.as_i64() {
            Some(limit) => Concurrency::bounded(limit),
            None => Err(EngineError::malformed(path, format!("expected an integer, found {n}"))),
        },
        Some(other) => Err(EngineError::malformed(
            path,
            format!("expected an integer or \"unbounded\", found {}", other.type_name()),
        )),
    }
}

fn parse_requires(value: Description, path: &str) -> Result<Vec<Requirement>, EngineError> {
    let items = match value {
        Description::List(items) => items,
        other => {
            return Err(EngineError::malformed(
                path,
                format!("expected a list of [dependent, prerequisite] pairs, found {}", other.type_name()),
            ))
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let at = format!("{path}[{i}]");
            let pair = match item {
                Description::List(pair) => pair,
                other => {
                    return Err(EngineError::malformed(
                        &at,
                        format!("expected a [dependent, prerequisite] pair, found {}", other.type_name()),
                    ))
                }
            };
            match <[Description; 2]>::try_from(pair) {
                Ok([dependent, prerequisite]) => Ok((
                    parse_step_ref(dependent, &format!("{at}[0]"))?,
                    parse_step_ref(prerequisite, &format!("{at}[1]"))?,
                )),
                Err(pair) => Err(EngineError::malformed(
                    &at,
                    format!("expected 2 entries, found {}", pair.len()),
                )),
            }
        })
        .collect()
}

fn parse_step_ref(value: Description, path: &str) -> Result<StepRef, EngineError> {
    match value {
        Description::Value(Value::String(name)) => Ok(StepRef::Name(name)),
        Description::Value(Value::Number(n)) => n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .map(StepRef::Index)
            .ok_or_else(|| EngineError::malformed(path, format!("expected a step position, found {n}"))),
        other => Err(EngineError::malformed(
            path,
            format!("expected a step name or position, found {}", other.type_name()),
        )),
    }
}

/// Turns requirements into positions among `children`.
fn resolve(
    pairs: &[Requirement],
    children: &[Arc<Pipeline>],
    path: &str,
) -> Result<Vec<(usize, usize)>, EngineError> {
    let position = |step: &StepRef, at: String| -> Result<usize, EngineError> {
        match step {
            StepRef::Index(index) if *index < children.len() => Ok(*index),
            StepRef::Index(index) => Err(EngineError::malformed(
                at,
                format!("no substep at position {index} ({} substeps)", children.len()),
            )),
            StepRef::Name(name) => {
                let mut matches = children
                    .iter()
                    .enumerate()
                    .filter(|(_, child)| child.name().as_str() == name)
                    .map(|(i, _)| i);
                match (matches.next(), matches.next()) {
                    (Some(index), None) => Ok(index),
                    (None, _) => Err(EngineError::malformed(at, format!("no substep named '{name}'"))),
                    (Some(_), Some(_)) => {
                        Err(EngineError::malformed(at, format!("more than one substep is named '{name}'")))
                    }
                }
            }
        }
    };
    pairs
        .iter()
        .enumerate()
        .map(|(i, (dependent, prerequisite))| {
            Ok((
                position(dependent, format!("{path}.requires[{i}][0]"))?,
                position(prerequisite, format!("{path}.requires[{i}][1]"))?,
            ))
        })
        .collect()
}

fn cyclic(path: &str) -> EngineError {
    EngineError::malformed(format!("{path}.requires"), "requirements form a cycle")
}

#[async_trait]
impl Middleware for Substeps {
    fn field(&self) -> Field {
        Field::Substeps
    }

    async fn apply(&self, ctx: &mut StepContext, next: Next<'_>) -> Result<(), EngineError> {
        let children = self.children_for(ctx).await?;
        let schedule = self.schedule(ctx, children).await?;
        if let Err(failure) = drive(schedule, ctx.scope(), ctx.runtime()).await {
            ctx.set_failed_step(failure.step);
            return Err(failure.error);
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing;
    use kumihimo_core::{Scope, Signature};
    use serde_json::json;

    fn parsed(value: Description) -> Result<Substeps, EngineError> {
        let composer = Composer::standard();
        parse(FieldInput {
            step: &"parent".into(),
            value,
            path: "root.substeps".into(),
            composer: &composer,
        })
    }

    fn leaf(name: &str) -> Description {
        Description::map([
            ("name", Description::from(name)),
            ("action", Callable::constant(name, json!(1)).into()),
        ])
    }

    #[test]
    fn test_list_is_sequential() {
        let substeps = parsed(Description::list([leaf("a"), leaf("b")])).unwrap();
        assert_eq!(substeps.scheduling(), Some(Scheduling::Sequential));
        assert_eq!(substeps.children().len(), 2);
        assert_eq!(substeps.children()[1].name().as_str(), "b");
    }

    #[test]
    fn test_parallel_shorthand() {
        let substeps = parsed(Description::map([
            ("parallel", Description::list([leaf("a"), leaf("b"), leaf("c")])),
            ("concurrency", Description::from(2_i64)),
        ]))
        .unwrap();
        assert_eq!(substeps.scheduling(), Some(Scheduling::parallel(2).unwrap()));

        let substeps = parsed(Description::map([("parallel", Description::list([leaf("a")]))])).unwrap();
        assert_eq!(substeps.scheduling(), Some(Scheduling::unbounded()));
    }

    #[test]
    fn test_canonical_form() {
        let substeps = parsed(Description::map([
            ("steps", Description::list([leaf("a")])),
            ("scheduling", Description::from("parallel")),
            ("concurrency", Description::from("unbounded")),
        ]))
        .unwrap();
        assert_eq!(substeps.scheduling(), Some(Scheduling::unbounded()));
    }

    #[test]
    fn test_invalid_concurrency() {
        for limit in [0_i64, -1] {
            let error = parsed(Description::map([
                ("parallel", Description::list([leaf("a")])),
                ("concurrency", Description::from(limit)),
            ]))
            .unwrap_err();
            assert_eq!(error, EngineError::InvalidConcurrency(limit));
        }
    }

    #[test]
    fn test_malformed_forms() {
        let error = parsed(Description::map([
            ("steps", Description::list([leaf("a")])),
            ("concurrency", Description::from(2_i64)),
        ]))
        .unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed(
                "root.substeps.concurrency",
                "concurrency only applies to parallel substeps"
            )
        );

        let error = parsed(Description::map([
            ("steps", Description::list([leaf("a")])),
            ("scheduling", Description::from("random")),
        ]))
        .unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed("root.substeps.scheduling", "unknown scheduling 'random'")
        );

        let error = parsed(json!("not steps").into()).unwrap_err();
        assert_eq!(error.kind(), kumihimo_core::ErrorKind::MalformedStepDescription);
    }

    #[test]
    fn test_requires_by_name_and_position() {
        let substeps = parsed(Description::map([
            ("steps", Description::list([leaf("fetch"), leaf("parse"), leaf("audit")])),
            ("requires", json!([["parse", "fetch"], [2, 1]]).into()),
            ("concurrency", Description::from(2_i64)),
        ]))
        .unwrap();
        assert_eq!(substeps.scheduling(), None);
        let Arrangement::Requires { pairs, limit } = substeps.arrangement() else {
            panic!("expected a dependency arrangement");
        };
        assert_eq!(
            pairs,
            &vec![
                (StepRef::Name("parse".into()), StepRef::Name("fetch".into())),
                (StepRef::Index(2), StepRef::Index(1)),
            ]
        );
        assert!(matches!(limit, Limit::Fixed(c) if c.limit().map(NonZeroUsize::get) == Some(2)));
        assert_eq!(
            resolve(pairs, substeps.children(), "p").unwrap(),
            vec![(1, 0), (2, 1)]
        );
    }

    #[test]
    fn test_requires_is_checked_when_composing() {
        let steps = || Description::list([leaf("a"), leaf("b")]);

        let error = parsed(Description::map([
            ("steps", steps()),
            ("requires", json!([["a", "missing"]]).into()),
        ]))
        .unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed("root.substeps.requires[0][1]", "no substep named 'missing'")
        );

        let error = parsed(Description::map([
            ("steps", steps()),
            ("requires", json!([["a", "b"], ["b", "a"]]).into()),
        ]))
        .unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed("root.substeps.requires", "requirements form a cycle")
        );

        let error = parsed(Description::map([
            ("steps", steps()),
            ("requires", json!([["a"]]).into()),
        ]))
        .unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed("root.substeps.requires[0]", "expected 2 entries, found 1")
        );

        let error = parsed(Description::map([
            ("steps", steps()),
            ("requires", json!([[0, 5]]).into()),
        ]))
        .unwrap_err();
        assert_eq!(error.kind(), kumihimo_core::ErrorKind::MalformedStepDescription);
    }

    #[tokio::test]
    async fn test_requires_orders_dependents_after_prerequisites() {
        let double = Callable::sync("double", Signature::new().positional("base"), |args| {
            Ok(json!(args.get("base").and_then(Value::as_i64).unwrap_or_default() * 2))
        });
        let substeps = parsed(Description::map([
            (
                "steps",
                Description::list([
                    Description::map([
                        ("name", Description::from("double")),
                        ("action", double.into()),
                    ]),
                    leaf("base"),
                ]),
            ),
            ("requires", json!([["double", "base"]]).into()),
        ]))
        .unwrap();

        let scope = Scope::new();
        let mut ctx = testing::context(scope.clone());
        substeps.apply(&mut ctx, Next::end()).await.unwrap();
        assert_eq!(scope.get("base"), Some(json!(1)));
        assert_eq!(scope.get("double"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_computed_steps() {
        let plan = Callable::sync("plan", Signature::new().positional("regions"), |args| {
            let regions = args.get("regions").and_then(Value::as_array).cloned().unwrap_or_default();
            Ok(Value::Array(
                regions
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|r| json!({"name": format!("sync-{r}"), "arguments": {r: true}}))
                    .collect(),
            ))
        });
        let substeps = parsed(Description::map([
            ("steps", plan.into()),
            ("scheduling", Description::from("parallel")),
        ]))
        .unwrap();
        assert!(substeps.children().is_empty());

        let scope = Scope::from_entries([("regions", json!(["eu", "us"]))]);
        let mut ctx = testing::context(scope.clone());
        substeps.apply(&mut ctx, Next::end()).await.unwrap();
        assert_eq!(scope.get("eu"), Some(json!(true)));
        assert_eq!(scope.get("us"), Some(json!(true)));

        let journal = ctx.runtime().journal().records();
        assert_eq!(journal.len(), 2);
    }

    #[tokio::test]
    async fn test_computed_steps_must_be_a_list() {
        let substeps = parsed(Callable::constant("plan", json!("oops")).into()).unwrap();
        let mut ctx = testing::context(Scope::new());
        let error = substeps.apply(&mut ctx, Next::end()).await.unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed(
                "root.substeps.steps",
                "'plan' must return a list of steps, returned string"
            )
        );
    }

    #[tokio::test]
    async fn test_computed_concurrency() {
        let substeps = parsed(Description::map([
            ("parallel", Description::list([leaf("a"), leaf("b"), leaf("c")])),
            ("concurrency", Callable::constant("width", json!(2)).into()),
        ]))
        .unwrap();
        assert_eq!(substeps.scheduling(), None);

        let ctx = testing::context(Scope::new());
        let schedule = substeps.schedule(&ctx, substeps.children().to_vec()).await.unwrap();
        assert_eq!(schedule.group_limit().map(NonZeroUsize::get), Some(2));

        let invalid = parsed(Description::map([
            ("parallel", Description::list([leaf("a")])),
            ("concurrency", Callable::constant("width", json!(0)).into()),
        ]))
        .unwrap();
        let mut ctx = testing::context(Scope::new());
        let error = invalid.apply(&mut ctx, Next::end()).await.unwrap_err();
        assert_eq!(error, EngineError::InvalidConcurrency(0));
    }
}
