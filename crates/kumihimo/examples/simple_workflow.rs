//! Simple sequential workflow example.

use kumihimo::logging::init_logging;
use kumihimo::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(None)?;

    let load = Callable::sync("load", Signature::new().positional("source"), |args| {
        let source = args.get("source").and_then(Value::as_str).unwrap_or("memory");
        println!("Loading data from {source}...");
        Ok(json!(["alpha", "beta", "gamma"]))
    });
    let count = Callable::sync("count", Signature::new().positional("load"), |args| {
        Ok(json!(args.get("load").and_then(Value::as_array).map_or(0, Vec::len)))
    });
    let is_empty = Callable::sync("is_empty", Signature::new().positional("count"), |args| {
        Ok(json!(args.get("count").and_then(Value::as_u64) == Some(0)))
    });

    let engine = Engine::new(EngineConfig::from_env()?);
    let pipeline = engine.compose(step! {
        name: "ingest",
        arguments: json!({"source": "sample.csv"}),
        substeps: vec![
            step! { name: "load", action: load },
            step! { name: "count", action: count, log: "rows counted" },
            step! {
                name: "report",
                skip: is_empty,
                action: Callable::constant("report", json!("non-empty")),
            },
        ],
    })?;

    match engine.run(&pipeline, Scope::new()).await {
        Ok(report) => {
            println!("Workflow completed successfully");
            if let Some(count) = report.scope.get("count") {
                println!("Rows: {count}");
            }
            for record in &report.journal {
                println!("  {} {} ({:?})", record.name, record.status, record.elapsed);
            }
        }
        Err(failure) => {
            eprintln!("Workflow failed in '{}': {}", failure.step, failure.error);
        }
    }

    Ok(())
}
