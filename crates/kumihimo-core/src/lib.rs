//! Core types for the kumihimo step engine.
//!
//! This crate holds the runtime-free layer: values, layered scopes, callable
//! signatures and the dependency resolver that binds one to the other.
//! Applications that only register callables can depend on this crate alone.
//!
//! # Core Types
//!
//! - [`Scope`] - Layered name-to-value storage shared between steps
//! - [`Signature`] - Explicit parameter descriptor of a callable
//! - [`Callable`] - An application function plus its signature
//! - [`BoundArguments`] - Arguments resolved from a scope
//! - [`EngineError`] / [`ErrorKind`] - Error taxonomy of the engine

mod callable;
mod error;
mod resolver;
mod scope;
mod signature;
mod step;
mod value;

pub use callable::{ActionResult, BoundArguments, BoundCall, Callable};
pub use error::{ActionError, EngineError, ErrorKind};
pub use resolver::resolve;
pub use scope::Scope;
pub use signature::{Parameter, ParameterKind, Signature, SignatureError};
pub use step::StepName;
pub use value::{is_truthy, Value};
