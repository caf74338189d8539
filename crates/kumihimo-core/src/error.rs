//! Engine error types.

use crate::step::StepName;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The kind of an [`EngineError`].
///
/// Kinds are what a step's `suppress` list names. Only the run-time kinds
/// can be suppressed; the composition-time kinds always mean the workflow
/// definition itself has to be fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The step description could not be normalized or verified.
    MalformedStepDescription,
    /// A required parameter was not found in scope.
    UnresolvedDependency,
    /// A validator predicate returned a falsy value.
    ValidationFailed,
    /// A callable supplied by the application returned an error.
    ActionError,
    /// A scheduler was configured with a non-positive concurrency.
    InvalidConcurrency,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::MalformedStepDescription,
        ErrorKind::UnresolvedDependency,
        ErrorKind::ValidationFailed,
        ErrorKind::ActionError,
        ErrorKind::InvalidConcurrency,
    ];

    /// Returns the kind's name as it appears in `suppress` lists.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedStepDescription => "MalformedStepDescription",
            ErrorKind::UnresolvedDependency => "UnresolvedDependency",
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::ActionError => "ActionError",
            ErrorKind::InvalidConcurrency => "InvalidConcurrency",
        }
    }

    /// Returns `true` for kinds that a `suppress` middleware may catch.
    pub fn is_suppressible(&self) -> bool {
        matches!(
            self,
            ErrorKind::UnresolvedDependency | ErrorKind::ValidationFailed | ErrorKind::ActionError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

/// Error returned by an application callable.
///
/// The optional tag lets a step suppress one family of action failures
/// (for example `"timeout"`) without swallowing every [`ErrorKind::ActionError`].
///
/// # Examples
///
/// ```
/// use kumihimo_core::ActionError;
///
/// let error = ActionError::tagged("io", "disk full");
/// assert_eq!(error.tag(), Some("io"));
/// assert_eq!(error.to_string(), "[io] disk full");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    tag: Option<String>,
    message: String,
}

impl ActionError {
    /// Creates an untagged action error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            tag: None,
            message: message.into(),
        }
    }

    /// Creates an action error tagged with a custom kind.
    pub fn tagged(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            message: message.into(),
        }
    }

    /// Returns the custom kind, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "[{}] {}", tag, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Errors that can occur while composing or running steps.
///
/// # Non-Exhaustive
///
/// Always include a wildcard arm when matching:
///
/// ```
/// use kumihimo_core::{EngineError, ErrorKind};
///
/// fn describe(error: &EngineError) -> &'static str {
///     match error {
///         EngineError::UnresolvedDependency { .. } => "missing input",
///         EngineError::ValidationFailed { .. } => "rejected",
///         _ => "other",
///     }
/// }
///
/// let error = EngineError::InvalidConcurrency(0);
/// assert_eq!(error.kind(), ErrorKind::InvalidConcurrency);
/// assert_eq!(describe(&error), "other");
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EngineError {
    /// The step description is not in a shape the composer accepts.
    #[error("Malformed step description at '{path}': {reason}")]
    MalformedStepDescription {
        /// Location of the offending value, e.g. `root.substeps[1].action`.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A callable parameter could not be bound from scope.
    #[error("Unresolved dependency: parameter '{parameter}' of '{callable}' {reason}")]
    UnresolvedDependency {
        /// Name of the callable being bound.
        callable: String,
        /// Name of the parameter that could not be bound.
        parameter: String,
        /// Why binding failed.
        reason: String,
    },

    /// A validator predicate rejected the step.
    #[error("Validation failed in step '{step_name}': {message}")]
    ValidationFailed {
        /// The step whose validator failed.
        step_name: StepName,
        /// Validator message.
        message: String,
    },

    /// An application callable failed.
    #[error("Action failed in step '{step_name}': {source}")]
    Action {
        /// The step whose callable failed.
        step_name: StepName,
        /// The error returned by the callable.
        #[source]
        source: ActionError,
    },

    /// A scheduler was configured with a non-positive concurrency.
    #[error("Invalid concurrency: {0} (must be a positive integer)")]
    InvalidConcurrency(i64),
}

impl EngineError {
    /// Shorthand for a [`EngineError::MalformedStepDescription`].
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::MalformedStepDescription {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedStepDescription { .. } => ErrorKind::MalformedStepDescription,
            EngineError::UnresolvedDependency { .. } => ErrorKind::UnresolvedDependency,
            EngineError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            EngineError::Action { .. } => ErrorKind::ActionError,
            EngineError::InvalidConcurrency(_) => ErrorKind::InvalidConcurrency,
        }
    }

    /// Returns the custom tag of an action error.
    pub fn action_tag(&self) -> Option<&str> {
        match self {
            EngineError::Action { source, .. } => source.tag(),
            _ => None,
        }
    }

    /// Returns `true` if a `suppress` middleware may catch this error.
    pub fn is_suppressible(&self) -> bool {
        self.kind().is_suppressible()
    }
}
