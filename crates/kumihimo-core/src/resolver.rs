//! Dependency resolution: binding a signature against a scope.

use crate::callable::BoundArguments;
use crate::error::EngineError;
use crate::scope::Scope;
use crate::signature::{Parameter, ParameterKind, Signature};
use crate::value::Value;

/// Binds every parameter of `signature` from `scope`.
///
/// - positional and keyword-only parameters take the scope entry of the same
///   name, else their default, else fail with
///   [`EngineError::UnresolvedDependency`];
/// - the variadic positional takes a scope array of the same name (empty if
///   absent);
/// - the variadic keyword takes a scope object of the same name (empty if
///   absent) and merges it into the keywords. Keywords bound explicitly take
///   precedence over captured ones.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{resolve, EngineError, Scope, Signature};
/// use serde_json::json;
///
/// let signature = Signature::new().positional("path").positional_or("retries", json!(3));
/// let scope = Scope::from_entries([("path", json!("/tmp/in"))]);
///
/// let bound = resolve("load", &signature, &scope)?;
/// assert_eq!(bound.args(), &[json!("/tmp/in"), json!(3)]);
///
/// let error = resolve("load", &signature, &Scope::new()).unwrap_err();
/// assert!(matches!(error, EngineError::UnresolvedDependency { ref parameter, .. } if parameter == "path"));
/// # Ok::<(), EngineError>(())
/// ```
pub fn resolve(
    callable: &str,
    signature: &Signature,
    scope: &Scope,
) -> Result<BoundArguments, EngineError> {
    let mut bound = BoundArguments::new();
    let mut captured_keywords = None;

    for parameter in signature.parameters() {
        match parameter.kind() {
            ParameterKind::Positional => {
                let value = lookup(callable, parameter, scope)?;
                bound.push_positional(parameter.name(), value);
            }
            ParameterKind::VarPositional => match scope.get(parameter.name()) {
                None => {}
                Some(Value::Array(items)) => bound.extend_positional(items),
                Some(_) => return Err(unresolved(callable, parameter, "must be an array in scope")),
            },
            ParameterKind::KeywordOnly => {
                let value = lookup(callable, parameter, scope)?;
                bound.insert_keyword(parameter.name(), value);
            }
            ParameterKind::VarKeyword => match scope.get(parameter.name()) {
                None => {}
                Some(Value::Object(map)) => captured_keywords = Some(map),
                Some(_) => return Err(unresolved(callable, parameter, "must be an object in scope")),
            },
        }
    }

    for (name, value) in captured_keywords.into_iter().flatten() {
        if !bound.has_keyword(&name) {
            bound.insert_keyword(name, value);
        }
    }
    Ok(bound)
}

fn lookup(callable: &str, parameter: &Parameter, scope: &Scope) -> Result<Value, EngineError> {
    scope
        .get(parameter.name())
        .or_else(|| parameter.default().cloned())
        .ok_or_else(|| unresolved(callable, parameter, "is not in scope and has no default"))
}

fn unresolved(callable: &str, parameter: &Parameter, reason: &str) -> EngineError {
    EngineError::UnresolvedDependency {
        callable: callable.to_string(),
        parameter: parameter.name().to_string(),
        reason: reason.to_string(),
    }
}
