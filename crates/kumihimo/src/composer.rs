//! The step composer: descriptions in, pipelines out.

use crate::description::{normalize, verify, Description};
use crate::middleware::{self, Middleware, Noop};
use crate::pipeline::Pipeline;
use kumihimo_core::{EngineError, StepName};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A recognized field of a step description.
///
/// The declaration order is the order middleware are applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Skip,
    Suppress,
    Arguments,
    Setup,
    Validator,
    Substeps,
    Action,
    Log,
    Cleanup,
}

impl Field {
    /// Every field, outermost first.
    pub const ORDER: [Field; 10] = [
        Field::Name,
        Field::Skip,
        Field::Suppress,
        Field::Arguments,
        Field::Setup,
        Field::Validator,
        Field::Substeps,
        Field::Action,
        Field::Log,
        Field::Cleanup,
    ];

    /// Key of this field in a description map.
    pub fn key(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Skip => "skip",
            Field::Suppress => "suppress",
            Field::Arguments => "arguments",
            Field::Setup => "setup",
            Field::Validator => "validator",
            Field::Substeps => "substeps",
            Field::Action => "action",
            Field::Log => "log",
            Field::Cleanup => "cleanup",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ORDER.into_iter().find(|field| field.key() == key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// What a middleware factory gets to build from.
pub struct FieldInput<'a> {
    /// Name of the step being composed.
    pub step: &'a StepName,
    /// The field's value from the canonical description.
    pub value: Description,
    /// Location of the value, for error messages.
    pub path: String,
    /// The composer itself, for fields that compose nested steps.
    pub composer: &'a Composer,
}

/// Builds the middleware for one field.
pub type Factory = fn(FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError>;

/// Turns step descriptions into pipelines.
///
/// Holds one factory per field, in application order. The composer is
/// plain data: build it once and share it.
///
/// # Examples
///
/// ```
/// use kumihimo::{Callable, Composer, Description, Field};
/// use serde_json::json;
///
/// let composer = Composer::standard();
/// let pipeline = composer.compose(Description::map([
///     ("name", Description::from("greet")),
///     ("action", Callable::constant("hello", json!("hi")).into()),
/// ]))?;
///
/// assert_eq!(pipeline.name().as_str(), "greet");
/// assert_eq!(pipeline.fields(), Field::ORDER.to_vec());
/// # Ok::<(), kumihimo::EngineError>(())
/// ```
#[derive(Clone)]
pub struct Composer {
    factories: Vec<(Field, Factory)>,
}

impl fmt::Debug for Composer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer")
            .field("fields", &self.factories.iter().map(|(field, _)| field).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Composer {
    fn default() -> Self {
        Self::standard()
    }
}

impl Composer {
    /// The standard composer with the built-in middleware for every field.
    pub fn standard() -> Self {
        Self {
            factories: vec![
                (Field::Name, middleware::name::build as Factory),
                (Field::Skip, middleware::skip::build as Factory),
                (Field::Suppress, middleware::suppress::build as Factory),
                (Field::Arguments, middleware::arguments::build as Factory),
                (Field::Setup, middleware::setup::build as Factory),
                (Field::Validator, middleware::validator::build as Factory),
                (Field::Substeps, middleware::substeps::build as Factory),
                (Field::Action, middleware::action::build as Factory),
                (Field::Log, middleware::log::build as Factory),
                (Field::Cleanup, middleware::cleanup::build as Factory),
            ],
        }
    }

    /// Replaces the factory of one field, keeping its position.
    pub fn with_factory(mut self, field: Field, factory: Factory) -> Self {
        if let Some(entry) = self.factories.iter_mut().find(|(f, _)| *f == field) {
            entry.1 = factory;
        }
        self
    }

    /// Fields in application order.
    pub fn fields(&self) -> Vec<Field> {
        self.factories.iter().map(|(field, _)| *field).collect()
    }

    /// Normalizes, verifies and composes a description.
    pub fn compose(&self, description: impl Into<Description>) -> Result<Pipeline, EngineError> {
        self.compose_at(description.into(), "root")
    }

    pub(crate) fn compose_at(
        &self,
        description: Description,
        path: &str,
    ) -> Result<Pipeline, EngineError> {
        let description = normalize(description, path)?;
        verify(&description, path)?;

        let Description::Map(mut fields) = description else {
            return Err(EngineError::malformed(path, "expected a step map"));
        };
        let name = fields
            .get(Field::Name.key())
            .and_then(Description::as_str)
            .map(StepName::new)
            .ok_or_else(|| EngineError::malformed(path, "missing 'name'"))?;

        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::with_capacity(self.factories.len());
        for (field, factory) in &self.factories {
            let middleware = match fields.shift_remove(field.key()) {
                Some(value) => factory(FieldInput {
                    step: &name,
                    value,
                    path: format!("{path}.{field}"),
                    composer: self,
                })?,
                None => Arc::new(Noop::new(*field)),
            };
            middlewares.push(middleware);
        }

        debug!("Composed step '{}' at {}", name, path);
        Ok(Pipeline::new(name, middlewares))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kumihimo_core::{Callable, Signature};
    use serde_json::json;

    #[test]
    fn test_field_keys_round_trip() {
        for field in Field::ORDER {
            assert_eq!(Field::from_key(field.key()), Some(field));
        }
        assert_eq!(Field::from_key("colour"), None);
        assert_eq!(Field::Substeps.to_string(), "substeps");
    }

    #[test]
    fn test_minimal_step_is_all_noops_but_name() {
        let pipeline = Composer::standard()
            .compose(Description::map([("name", "empty")]))
            .unwrap();

        assert_eq!(pipeline.fields(), Field::ORDER.to_vec());
        assert_eq!(pipeline.active_fields(), vec![Field::Name]);
    }

    #[test]
    fn test_bare_callable_composes() {
        let pipeline = Composer::standard()
            .compose(Callable::constant("only", json!(1)))
            .unwrap();
        assert!(pipeline.name().as_str().starts_with("step-"));
        assert_eq!(pipeline.active_fields(), vec![Field::Name, Field::Action]);
    }

    #[test]
    fn test_malformed_signature_is_rejected() {
        let broken = Callable::sync(
            "broken",
            Signature::new().keyword_only("k").positional("a"),
            |_| Ok(json!(null)),
        );
        let error = Composer::standard().compose(broken).unwrap_err();
        assert!(matches!(
            error,
            EngineError::MalformedStepDescription { ref path, .. } if path == "root.action"
        ));
    }

    #[test]
    fn test_errors_point_at_nested_steps() {
        let description = Description::from(json!({
            "name": "outer",
            "substeps": [{"name": "inner", "typo": true}]
        }));
        let error = Composer::standard().compose(description).unwrap_err();
        assert_eq!(
            error,
            EngineError::malformed("root.substeps[0]", "unknown field 'typo'")
        );
    }

    #[test]
    fn test_with_factory_keeps_position() {
        fn quiet(input: FieldInput<'_>) -> Result<Arc<dyn Middleware>, EngineError> {
            let _ = input;
            Ok(Arc::new(Noop::new(Field::Log)))
        }
        let composer = Composer::standard().with_factory(Field::Log, quiet);
        assert_eq!(composer.fields(), Field::ORDER.to_vec());

        let pipeline = composer
            .compose(Description::map([("name", "n"), ("log", "ignored")]))
            .unwrap();
        assert_eq!(pipeline.active_fields(), vec![Field::Name]);
    }
}
