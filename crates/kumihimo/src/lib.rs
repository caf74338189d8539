//! A declarative step-execution engine for Rust.
//!
//! A workflow is described as data: nested step descriptions naming
//! callables, arguments, hooks, validators and substeps. The [`Composer`]
//! turns each description into a [`Pipeline`] of middleware, callables get
//! their arguments from a layered [`Scope`], and the [`Scheduler`] arranges
//! sibling steps sequentially or in bounded parallel groups.
//!
//! # Example
//!
//! ```rust
//! use kumihimo::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let load = Callable::sync("load", Signature::new().positional("path"), |args| {
//!         let path = args.get("path").and_then(|p| p.as_str()).unwrap_or_default();
//!         Ok(json!([format!("{path}:1"), format!("{path}:2")]))
//!     });
//!     let count = Callable::sync("count", Signature::new().positional("load"), |args| {
//!         Ok(json!(args.get("load").and_then(|rows| rows.as_array()).map_or(0, Vec::len)))
//!     });
//!
//!     let engine = Engine::default();
//!     let pipeline = engine
//!         .compose(step! {
//!             name: "ingest",
//!             arguments: json!({"path": "/data/in"}),
//!             substeps: vec![
//!                 step! { name: "load", action: load },
//!                 step! { name: "count", action: count },
//!             ],
//!         })
//!         .expect("valid description");
//!
//!     let report = engine.run(&pipeline, Scope::new()).await.expect("run failed");
//!     assert_eq!(report.scope.get("count"), Some(json!(2)));
//! }
//! ```

pub mod composer;
pub mod config;
pub mod description;
pub mod engine;
pub mod journal;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod schedule;
pub mod scheduler;

// Re-export core types
pub use kumihimo_core::*;

pub use composer::{Composer, Factory, Field, FieldInput};
pub use config::{ConfigError, EngineConfig};
pub use description::{normalize, verify, Description, Registry};
pub use engine::{Engine, Outcome, RunFailure, RunReport, Work};
pub use journal::{Journal, StepRecord, StepStatus};
pub use middleware::{Flow, Middleware, Next, Noop, Phase, StepContext, SuppressPolicy};
pub use pipeline::{Pipeline, Runtime, StepFailure, StepOutcome};
pub use schedule::{Schedule, Unit, UnitId};
pub use scheduler::{Concurrency, Scheduler, Scheduling};

/// Builds a step [`Description`] map from `field: value` pairs.
///
/// Each value goes through `Description::from`, so callables, JSON values,
/// strings, booleans and lists of nested steps can be mixed freely.
///
/// ```
/// use kumihimo::{step, Callable, Description};
/// use serde_json::json;
///
/// let description = step! {
///     name: "notify",
///     skip: false,
///     action: Callable::constant("send", json!("sent")),
/// };
/// assert_eq!(description.name(), Some("notify"));
/// ```
#[macro_export]
macro_rules! step {
    ($($field:ident : $value:expr),+ $(,)?) => {
        $crate::Description::map([
            $((stringify!($field), $crate::Description::from($value))),+
        ])
    };
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        step, ActionError, BoundArguments, Callable, Composer, Description, Engine, EngineConfig,
        EngineError, ErrorKind, Outcome, Pipeline, Registry, RunFailure, RunReport, Scheduling,
        Scope, Signature, StepName, StepStatus, SuppressPolicy, Value,
    };
}
