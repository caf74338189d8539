//! Loads a bounded parallel workflow from YAML and runs it.

use kumihimo::logging::init_logging;
use kumihimo::prelude::*;
use serde_json::json;
use std::time::Duration;

const WORKFLOW: &str = r#"
name: health-check
substeps:
  parallel:
    - name: api
      action: probe
      arguments: {target: "api.internal"}
    - name: db
      action: probe
      arguments: {target: "db.internal"}
    - name: cache
      action: probe
      arguments: {target: "cache.internal"}
      suppress: ActionError
    - name: queue
      action: probe
      arguments: {target: "queue.internal"}
  concurrency: 2
cleanup: close
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(None)?;

    let mut registry = Registry::new();
    registry
        .register(Callable::new("probe", Signature::new().positional("target"), |args| async move {
            let target = args.get("target").and_then(Value::as_str).unwrap_or_default().to_string();
            tokio::time::sleep(Duration::from_millis(50)).await;
            if target.starts_with("cache") {
                return Err(ActionError::tagged("unreachable", format!("{target} did not answer")));
            }
            Ok(json!({"target": target, "healthy": true}))
        }))
        .register(Callable::sync("close", Signature::new(), |_| {
            println!("Closing probe connections");
            Ok(Value::Null)
        }));

    let engine = Engine::default();
    let pipeline = engine.compose(Description::from_yaml_str(WORKFLOW, &registry)?)?;
    let report = engine.run(&pipeline, Scope::new()).await?;

    for record in &report.journal {
        println!("{}: {}", record.name, record.status);
    }
    println!("Scope: {}", json!(report.scope.flatten()));
    Ok(())
}
