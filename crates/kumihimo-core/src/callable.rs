//! Application callables and their bound invocations.

use crate::error::{ActionError, EngineError};
use crate::resolver::resolve;
use crate::scope::Scope;
use crate::signature::Signature;
use crate::value::Value;
use futures_util::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Result of invoking a callable.
pub type ActionResult = Result<Value, ActionError>;

type CallableFn = dyn Fn(BoundArguments) -> BoxFuture<'static, ActionResult> + Send + Sync;

/// The arguments of one call, fully resolved.
///
/// `args` holds the declared positionals in order followed by the variadic
/// positional capture; `kwargs` holds keyword-only parameters followed by the
/// variadic keyword capture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundArguments {
    args: Vec<Value>,
    positional_names: Vec<String>,
    kwargs: IndexMap<String, Value>,
}

impl BoundArguments {
    /// Creates an empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_positional(&mut self, name: &str, value: Value) {
        self.positional_names.push(name.to_string());
        self.args.push(value);
    }

    pub(crate) fn extend_positional(&mut self, values: impl IntoIterator<Item = Value>) {
        self.args.extend(values);
    }

    pub(crate) fn insert_keyword(&mut self, name: impl Into<String>, value: Value) {
        self.kwargs.insert(name.into(), value);
    }

    pub(crate) fn has_keyword(&self, name: &str) -> bool {
        self.kwargs.contains_key(name)
    }

    /// All positional values.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Positional value at `index`.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Positionals captured by the variadic parameter.
    pub fn var_args(&self) -> &[Value] {
        &self.args[self.positional_names.len()..]
    }

    /// All keyword values.
    pub fn kwargs(&self) -> &IndexMap<String, Value> {
        &self.kwargs
    }

    /// Looks an argument up by parameter name (declared positional) or keyword.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.positional_names
            .iter()
            .position(|n| n == name)
            .and_then(|index| self.args.get(index))
            .or_else(|| self.kwargs.get(name))
    }

    /// Splits into positional and keyword parts.
    pub fn into_parts(self) -> (Vec<Value>, IndexMap<String, Value>) {
        (self.args, self.kwargs)
    }
}

/// A function supplied by the application, together with its signature.
///
/// Two callables are equal when they share the same function object, so a
/// clone equals its original.
///
/// # Examples
///
/// ```
/// use kumihimo_core::{Callable, Scope, Signature};
/// use serde_json::json;
///
/// let add = Callable::sync("add", Signature::new().positional("a").positional("b"), |args| {
///     let a = args.get("a").and_then(|v| v.as_i64()).unwrap_or_default();
///     let b = args.get("b").and_then(|v| v.as_i64()).unwrap_or_default();
///     Ok(json!(a + b))
/// });
///
/// let scope = Scope::from_entries([("a", json!(2)), ("b", json!(3))]);
/// let call = add.bind(&scope)?;
/// # tokio_test::block_on(async {
/// assert_eq!(call.invoke().await, Ok(json!(5)));
/// # });
/// # Ok::<(), kumihimo_core::EngineError>(())
/// ```
#[derive(Clone)]
pub struct Callable {
    name: Arc<str>,
    signature: Arc<Signature>,
    func: Arc<CallableFn>,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Callable {
    /// Wraps an async function.
    pub fn new<F, Fut>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(BoundArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            signature: Arc::new(signature),
            func: Arc::new(move |args| f(args).boxed()),
        }
    }

    /// Wraps a blocking-free synchronous function.
    pub fn sync<F>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(BoundArguments) -> ActionResult + Send + Sync + 'static,
    {
        Self::new(name, signature, move |args| future::ready(f(args)))
    }

    /// A zero-argument callable that always returns `value`.
    pub fn constant(name: impl Into<String>, value: Value) -> Self {
        Self::sync(name, Signature::new(), move |_| Ok(value.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Returns `true` if both handles wrap the same function object.
    pub fn same_as(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }

    /// Resolves the signature against `scope`, producing a zero-argument call.
    pub fn bind(&self, scope: &Scope) -> Result<BoundCall, EngineError> {
        let arguments = resolve(&self.name, &self.signature, scope)?;
        Ok(BoundCall {
            callable: self.clone(),
            arguments,
        })
    }

    /// Calls the function with explicitly supplied arguments.
    pub async fn call(&self, arguments: BoundArguments) -> ActionResult {
        (self.func)(arguments).await
    }
}

/// A callable with its arguments already resolved.
#[derive(Debug, Clone)]
pub struct BoundCall {
    callable: Callable,
    arguments: BoundArguments,
}

impl BoundCall {
    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    pub fn arguments(&self) -> &BoundArguments {
        &self.arguments
    }

    /// Runs the call.
    pub async fn invoke(self) -> ActionResult {
        self.callable.call(self.arguments).await
    }
}
