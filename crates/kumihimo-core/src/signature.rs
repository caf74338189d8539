//! Explicit callable signatures.
//!
//! A [`Signature`] is the ordered parameter list of a callable, described
//! once when the callable is registered. The resolver consumes it instead of
//! inspecting the callable at run time.

use crate::value::Value;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// How a parameter is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// Filled positionally, in declaration order, from the scope entry of the same name.
    Positional,
    /// Captures the remaining positionals from a scope array of the same name.
    VarPositional,
    /// Filled by name, never positionally.
    KeywordOnly,
    /// Captures extra keywords from a scope object of the same name.
    VarKeyword,
}

impl ParameterKind {
    fn rank(self) -> u8 {
        match self {
            ParameterKind::Positional => 0,
            ParameterKind::VarPositional => 1,
            ParameterKind::KeywordOnly => 2,
            ParameterKind::VarKeyword => 3,
        }
    }

    /// Returns `true` for the two capturing kinds.
    pub fn is_variadic(self) -> bool {
        matches!(self, ParameterKind::VarPositional | ParameterKind::VarKeyword)
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParameterKind::Positional => "positional",
            ParameterKind::VarPositional => "variadic positional",
            ParameterKind::KeywordOnly => "keyword-only",
            ParameterKind::VarKeyword => "variadic keyword",
        };
        f.write_str(s)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: String,
    kind: ParameterKind,
    default: Option<Value>,
}

impl Parameter {
    /// Creates a parameter without a default.
    pub fn new(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    /// Attaches a default value.
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// A non-variadic parameter without a default must come from scope.
    pub fn is_required(&self) -> bool {
        !self.kind.is_variadic() && self.default.is_none()
    }
}

/// Reasons a [`Signature`] is not well formed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("parameter '{0}' is declared twice")]
    Duplicate(String),

    #[error("{kind} parameter '{name}' is out of order")]
    OutOfOrder { name: String, kind: ParameterKind },

    #[error("required parameter '{0}' follows a parameter with a default")]
    RequiredAfterDefault(String),

    #[error("variadic parameter '{0}' cannot have a default")]
    DefaultOnVariadic(String),
}

/// Ordered parameter descriptor of a callable.
///
/// Parameters must be declared in the order
/// positional, variadic positional, keyword-only, variadic keyword.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{ParameterKind, Signature};
/// use serde_json::json;
///
/// let signature = Signature::new()
///     .positional("source")
///     .positional_or("limit", json!(10))
///     .var_positional("extra")
///     .keyword_only("mode")
///     .var_keyword("options");
///
/// assert!(signature.check().is_ok());
/// assert_eq!(signature.len(), 5);
/// assert_eq!(signature.parameters()[2].kind(), ParameterKind::VarPositional);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    parameters: Vec<Parameter>,
}

impl Signature {
    /// Creates an empty signature (a callable taking no arguments).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an arbitrary parameter.
    pub fn push(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Appends a required positional parameter.
    pub fn positional(self, name: impl Into<String>) -> Self {
        self.push(Parameter::new(name, ParameterKind::Positional))
    }

    /// Appends a positional parameter with a default.
    pub fn positional_or(self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.push(Parameter::new(name, ParameterKind::Positional).with_default(default))
    }

    /// Appends the variadic positional capture.
    pub fn var_positional(self, name: impl Into<String>) -> Self {
        self.push(Parameter::new(name, ParameterKind::VarPositional))
    }

    /// Appends a required keyword-only parameter.
    pub fn keyword_only(self, name: impl Into<String>) -> Self {
        self.push(Parameter::new(name, ParameterKind::KeywordOnly))
    }

    /// Appends a keyword-only parameter with a default.
    pub fn keyword_only_or(self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.push(Parameter::new(name, ParameterKind::KeywordOnly).with_default(default))
    }

    /// Appends the variadic keyword capture.
    pub fn var_keyword(self, name: impl Into<String>) -> Self {
        self.push(Parameter::new(name, ParameterKind::VarKeyword))
    }

    /// Declared parameters, in order.
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Verifies the signature is well formed.
    pub fn check(&self) -> Result<(), SignatureError> {
        let mut seen = HashSet::new();
        let mut last_rank = 0;
        let mut positional_default_seen = false;

        for parameter in &self.parameters {
            if !seen.insert(parameter.name()) {
                return Err(SignatureError::Duplicate(parameter.name.clone()));
            }

            let rank = parameter.kind.rank();
            let repeated_variadic = parameter.kind.is_variadic() && rank == last_rank;
            if rank < last_rank || repeated_variadic {
                return Err(SignatureError::OutOfOrder {
                    name: parameter.name.clone(),
                    kind: parameter.kind,
                });
            }
            last_rank = rank;

            if parameter.kind.is_variadic() && parameter.default.is_some() {
                return Err(SignatureError::DefaultOnVariadic(parameter.name.clone()));
            }

            if parameter.kind == ParameterKind::Positional {
                if parameter.default.is_some() {
                    positional_default_seen = true;
                } else if positional_default_seen {
                    return Err(SignatureError::RequiredAfterDefault(parameter.name.clone()));
                }
            }
        }
        Ok(())
    }
}
