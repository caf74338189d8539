//! Step descriptions: the declarative input of the composer.
//!
//! A [`Description`] is a dynamic tree of values, callables, maps and lists.
//! [`normalize`] rewrites the accepted shorthands into the canonical shape
//! and [`verify`] checks that shape before any middleware is built.

use crate::composer::Field;
use indexmap::IndexMap;
use kumihimo_core::{Callable, EngineError, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// A node of a step description tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Description {
    /// The void action: the step does nothing of its own.
    #[default]
    Void,
    /// A scalar literal (objects and arrays are lifted into `Map`/`List`).
    Value(Value),
    Callable(Callable),
    List(Vec<Description>),
    Map(IndexMap<String, Description>),
}

impl Description {
    /// Builds a map node from key/value pairs.
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Description>,
    {
        Description::Map(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Builds a list node.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Description>,
    {
        Description::List(items.into_iter().map(Into::into).collect())
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Description>> {
        match self {
            Description::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Description::Callable(callable) => Some(callable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Description::Value(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Description::Value(Value::Null))
    }

    /// Looks up a key of a map node.
    pub fn get(&self, key: &str) -> Option<&Description> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Step name of a canonical description.
    pub fn name(&self) -> Option<&str> {
        self.get("name").and_then(Description::as_str)
    }

    /// Converts a callable-free tree back into a plain value.
    ///
    /// Returns `None` if the tree contains a callable or `Void`.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Description::Void | Description::Callable(_) => None,
            Description::Value(value) => Some(value.clone()),
            Description::List(items) => items
                .iter()
                .map(Description::to_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Description::Map(map) => map
                .iter()
                .map(|(k, v)| v.to_value().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Value::Object),
        }
    }

    /// Short label of the node type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Description::Void => "void",
            Description::Value(Value::Null) => "null",
            Description::Value(Value::Bool(_)) => "boolean",
            Description::Value(Value::Number(_)) => "number",
            Description::Value(Value::String(_)) => "string",
            Description::Value(_) => "value",
            Description::Callable(_) => "callable",
            Description::List(_) => "list",
            Description::Map(_) => "map",
        }
    }

    /// Loads a description from JSON, looking callables up in `registry`.
    ///
    /// In positions where a string can only mean a callable (`action`,
    /// `setup`, `cleanup`, validator predicates, skip `value`, the skip
    /// action and computed substeps) a string names a registered callable,
    /// `@` optional. Booleans stay literal there. In positions that accept
    /// either a literal or a callable (log `message`, argument values,
    /// substep `concurrency`) only strings prefixed with `@` do.
    pub fn from_json(value: Value, registry: &Registry) -> Result<Self, EngineError> {
        Loader { registry }.step(value, "root")
    }

    /// Loads a description from a YAML document.
    ///
    /// ```
    /// use kumihimo::{Callable, Description, Registry};
    /// use serde_json::json;
    ///
    /// let mut registry = Registry::new();
    /// registry.register(Callable::constant("fetch", json!([1, 2, 3])));
    ///
    /// let yaml = "
    /// name: ingest
    /// action: fetch
    /// log: loaded rows
    /// ";
    /// let description = Description::from_yaml_str(yaml, &registry)?;
    /// assert_eq!(description.name(), Some("ingest"));
    /// assert!(description.get("action").and_then(|a| a.as_callable()).is_some());
    /// # Ok::<(), kumihimo::EngineError>(())
    /// ```
    pub fn from_yaml_str(text: &str, registry: &Registry) -> Result<Self, EngineError> {
        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| EngineError::malformed("root", format!("invalid YAML: {e}")))?;
        Self::from_json(value, registry)
    }
}

impl From<Value> for Description {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Description::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                Description::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            scalar => Description::Value(scalar),
        }
    }
}

impl From<Callable> for Description {
    fn from(callable: Callable) -> Self {
        Description::Callable(callable)
    }
}

impl From<&str> for Description {
    fn from(s: &str) -> Self {
        Description::Value(Value::String(s.to_string()))
    }
}

impl From<String> for Description {
    fn from(s: String) -> Self {
        Description::Value(Value::String(s))
    }
}

impl From<bool> for Description {
    fn from(b: bool) -> Self {
        Description::Value(Value::Bool(b))
    }
}

impl From<i64> for Description {
    fn from(n: i64) -> Self {
        Description::Value(Value::from(n))
    }
}

impl From<Vec<Description>> for Description {
    fn from(items: Vec<Description>) -> Self {
        Description::List(items)
    }
}

impl From<IndexMap<String, Description>> for Description {
    fn from(map: IndexMap<String, Description>) -> Self {
        Description::Map(map)
    }
}

/// Named callables available to descriptions loaded from data.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    callables: HashMap<String, Callable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callable` under its own name, replacing any previous entry.
    pub fn register(&mut self, callable: Callable) -> &mut Self {
        self.callables.insert(callable.name().to_string(), callable);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }

    pub fn len(&self) -> usize {
        self.callables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }
}

impl FromIterator<Callable> for Registry {
    fn from_iter<I: IntoIterator<Item = Callable>>(iter: I) -> Self {
        let mut registry = Registry::new();
        for callable in iter {
            registry.register(callable);
        }
        registry
    }
}

struct Loader<'r> {
    registry: &'r Registry,
}

impl Loader<'_> {
    fn step(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        let map = match value {
            Value::String(name) => return self.callable(&name, path),
            Value::Object(map) => map,
            other => return Ok(other.into()),
        };

        let mut step = IndexMap::with_capacity(map.len());
        for (key, value) in map {
            let at = format!("{path}.{key}");
            let node = match Field::from_key(&key) {
                Some(Field::Action) if value.is_null() => Description::Value(Value::Null),
                Some(Field::Action) => self.callable_value(value, &at)?,
                Some(Field::Setup | Field::Cleanup) => self.callables(value, &at)?,
                Some(Field::Skip) => self.skip(value, &at)?,
                Some(Field::Validator) => self.validator(value, &at)?,
                Some(Field::Log) => self.log(value, &at)?,
                Some(Field::Arguments) => self.arguments(value, &at)?,
                Some(Field::Substeps) => self.substeps(value, &at)?,
                Some(Field::Name | Field::Suppress) | None => value.into(),
            };
            step.insert(key, node);
        }
        Ok(Description::Map(step))
    }

    fn callable(&self, name: &str, path: &str) -> Result<Description, EngineError> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.registry
            .get(name)
            .cloned()
            .map(Description::Callable)
            .ok_or_else(|| EngineError::malformed(path, format!("unknown callable '{name}'")))
    }

    fn callable_value(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::String(name) => self.callable(&name, path),
            other => Ok(other.into()),
        }
    }

    /// A string is a literal unless prefixed with `@`.
    fn literal_or_callable(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::String(s) if s.starts_with('@') => self.callable(&s, path),
            other => Ok(other.into()),
        }
    }

    fn callables(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| self.callable_value(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Description::List),
            other => self.callable_value(other, path),
        }
    }

    fn skip(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::Object(map) => {
                let mut skip = IndexMap::new();
                for (key, value) in map {
                    let at = format!("{path}.{key}");
                    let node = match key.as_str() {
                        "value" => self.callable_value(value, &at)?,
                        "action" => self.callable_value(value, &at)?,
                        _ => value.into(),
                    };
                    skip.insert(key, node);
                }
                Ok(Description::Map(skip))
            }
            other => self.callable_value(other, path),
        }
    }

    fn validator(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::Object(map) => {
                let mut validator = IndexMap::new();
                for (key, value) in map {
                    let at = format!("{path}.{key}");
                    let node = match key.as_str() {
                        "predicate" => self.callable_value(value, &at)?,
                        "before" | "after" => self.validator(value, &at)?,
                        _ => value.into(),
                    };
                    validator.insert(key, node);
                }
                Ok(Description::Map(validator))
            }
            other => self.callable_value(other, path),
        }
    }

    fn log(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::Object(mut map) => {
                let message = map.remove("message");
                let mut log: IndexMap<String, Description> =
                    map.into_iter().map(|(k, v)| (k, v.into())).collect();
                if let Some(message) = message {
                    let at = format!("{path}.message");
                    log.insert("message".into(), self.literal_or_callable(message, &at)?);
                }
                Ok(Description::Map(log))
            }
            other => self.literal_or_callable(other, path),
        }
    }

    fn arguments(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::Object(map) => {
                let mut arguments = IndexMap::new();
                for (key, value) in map {
                    let at = format!("{path}.{key}");
                    arguments.insert(key, self.literal_or_callable(value, &at)?);
                }
                Ok(Description::Map(arguments))
            }
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| self.arguments(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Description::List),
            other => Ok(other.into()),
        }
    }

    fn substeps(&self, value: Value, path: &str) -> Result<Description, EngineError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| self.step(item, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Description::List),
            Value::Object(map) => {
                let mut substeps = IndexMap::new();
                for (key, value) in map {
                    let at = format!("{path}.{key}");
                    let node = match key.as_str() {
                        "steps" | "parallel" => self.substeps(value, &at)?,
                        "concurrency" => self.literal_or_callable(value, &at)?,
                        _ => value.into(),
                    };
                    substeps.insert(key, node);
                }
                Ok(Description::Map(substeps))
            }
            // A callable producing the steps when the parent runs.
            other => self.callable_value(other, path),
        }
    }
}

/// One shorthand rewrite.
struct Simplification {
    applies: fn(&Description) -> bool,
    rewrite: fn(Description) -> Description,
}

const SIMPLIFICATIONS: &[Simplification] = &[
    Simplification {
        applies: is_bare_callable,
        rewrite: wrap_as_action,
    },
    Simplification {
        applies: lacks_action,
        rewrite: add_void_action,
    },
    Simplification {
        applies: lacks_name,
        rewrite: add_generated_name,
    },
];

fn is_bare_callable(description: &Description) -> bool {
    matches!(description, Description::Callable(_))
}

// A bare callable is the action of an otherwise empty step.
fn wrap_as_action(description: Description) -> Description {
    Description::map([("action", description)])
}

fn lacks_action(description: &Description) -> bool {
    description
        .as_map()
        .is_some_and(|m| m.get("action").map_or(true, Description::is_null))
}

fn add_void_action(description: Description) -> Description {
    with_entry(description, "action", Description::Void)
}

fn lacks_name(description: &Description) -> bool {
    description.as_map().is_some_and(|m| !m.contains_key("name"))
}

fn add_generated_name(description: Description) -> Description {
    with_entry(description, "name", Description::from(generated_name()))
}

/// Upper bound on rewrites; every rule removes one shorthand so this is never
/// reached by accepted input.
const MAX_REWRITES: usize = 16;

fn with_entry(description: Description, key: &str, value: Description) -> Description {
    match description {
        Description::Map(mut map) => {
            map.insert(key.to_string(), value);
            Description::Map(map)
        }
        other => other,
    }
}

fn generated_name() -> String {
    format!("step-{}", Uuid::new_v4())
}

/// Rewrites the top-level shorthands until none applies.
///
/// Normalizing an already canonical description returns it unchanged.
///
/// ```
/// use kumihimo::{normalize, Callable, Description};
/// use serde_json::json;
///
/// let fetch = Callable::constant("fetch", json!(1));
/// let step = normalize(fetch.clone().into(), "root")?;
///
/// assert_eq!(step.get("action"), Some(&Description::Callable(fetch)));
/// assert!(step.name().is_some_and(|n| n.starts_with("step-")));
/// assert_eq!(normalize(step.clone(), "root")?, step);
/// # Ok::<(), kumihimo::EngineError>(())
/// ```
pub fn normalize(description: Description, path: &str) -> Result<Description, EngineError> {
    let mut description = description;
    for _ in 0..MAX_REWRITES {
        match SIMPLIFICATIONS.iter().find(|s| (s.applies)(&description)) {
            Some(simplification) => description = (simplification.rewrite)(description),
            None => return Ok(description),
        }
    }
    Err(EngineError::malformed(path, "description does not normalize"))
}

/// Checks a normalized description is in canonical shape.
pub fn verify(description: &Description, path: &str) -> Result<(), EngineError> {
    let Description::Map(map) = description else {
        return Err(EngineError::malformed(
            path,
            format!("expected a step map or a callable, found {}", description.type_name()),
        ));
    };

    if let Some(key) = map.keys().find(|k| Field::from_key(k).is_none()) {
        return Err(EngineError::malformed(path, format!("unknown field '{key}'")));
    }

    match map.get("name") {
        Some(Description::Value(Value::String(name))) if !name.is_empty() => {}
        Some(other) => {
            return Err(EngineError::malformed(
                format!("{path}.name"),
                format!("expected a non-empty string, found {}", other.type_name()),
            ))
        }
        None => return Err(EngineError::malformed(path, "missing 'name'")),
    }

    match map.get("action") {
        Some(Description::Callable(_) | Description::Void) => Ok(()),
        Some(other) => Err(EngineError::malformed(
            format!("{path}.action"),
            format!("expected a callable, found {}", other.type_name()),
        )),
        None => Err(EngineError::malformed(path, "missing 'action'")),
    }
}
