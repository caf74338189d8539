use kumihimo::prelude::*;
use kumihimo::{Scheduler, StepRecord};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn raising(name: &str) -> Callable {
    let message = format!("{name} failed");
    Callable::sync(name, Signature::new(), move |_| {
        Err(ActionError::new(message.clone()))
    })
}

fn counting(name: &str, runs: &Arc<AtomicUsize>) -> Callable {
    let runs = Arc::clone(runs);
    Callable::sync(name, Signature::new(), move |_| {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    })
}

fn record<'a>(journal: &'a [StepRecord], name: &str) -> &'a StepRecord {
    journal
        .iter()
        .find(|r| r.name.as_str() == name)
        .unwrap_or_else(|| panic!("no journal record for '{name}'"))
}

#[tokio::test]
async fn test_suppressed_step_does_not_stop_its_siblings() {
    let engine = Engine::default();
    let double = Callable::sync("double", Signature::new().positional("a"), |args| {
        Ok(json!(args.get("a").and_then(Value::as_i64).unwrap_or_default() * 2))
    });

    let pipeline = engine
        .compose(step! {
            name: "workflow",
            substeps: vec![
                step! { name: "A", arguments: json!({"a": 1}) },
                step! {
                    name: "B",
                    suppress: "ActionError",
                    arguments: json!({"b": 1}),
                    action: raising("explode"),
                },
                step! { name: "C", action: double },
            ],
        })
        .unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.scope.get("a"), Some(json!(1)));
    assert_eq!(report.scope.get("C"), Some(json!(2)));
    assert!(!report.scope.contains("b"), "writes of the suppressed step are discarded");

    assert_eq!(record(&report.journal, "A").status, StepStatus::Succeeded);
    assert!(matches!(
        record(&report.journal, "B").status,
        StepStatus::Suppressed { kind: ErrorKind::ActionError, .. }
    ));
    assert_eq!(record(&report.journal, "C").status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_keep_policy_merges_suppressed_writes() {
    let engine = Engine::new(EngineConfig::new().with_suppress_policy(SuppressPolicy::Keep));
    let pipeline = engine
        .compose(step! {
            name: "B",
            suppress: "ActionError",
            arguments: json!({"b": 1}),
            action: raising("explode"),
        })
        .unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    assert_eq!(
        report.outcome,
        Outcome::Suppressed {
            step: StepName::new("B"),
            kind: ErrorKind::ActionError,
        }
    );
    assert_eq!(report.scope.get("b"), Some(json!(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_groups_respect_concurrency() {
    let schedule = Scheduler::new(Scheduling::parallel(2).unwrap()).schedule(vec![1, 2, 3, 4, 5]);
    let sizes: Vec<usize> = schedule.groups().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let probe = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        Callable::new("probe", Signature::new(), move |_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(true))
            }
        })
    };

    let engine = Engine::default();
    let units: Vec<Description> = (0..5)
        .map(|i| step! { name: format!("unit-{i}"), action: probe.clone() })
        .collect();
    let pipeline = engine
        .compose(step! {
            name: "fan-out",
            substeps: Description::map([
                ("parallel", Description::from(units)),
                ("concurrency", Description::from(2_i64)),
            ]),
        })
        .unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    assert!(peak.load(Ordering::SeqCst) <= 2);
    for i in 0..5 {
        assert_eq!(report.scope.get(&format!("unit-{i}")), Some(json!(true)));
    }
}

#[tokio::test]
async fn test_sequential_steps_run_in_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let visit = |label: &'static str| {
        let order = Arc::clone(&order);
        Callable::new(label, Signature::new(), move |_| {
            let order = Arc::clone(&order);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(label);
                Ok(Value::Null)
            }
        })
    };

    let engine = Engine::default();
    let pipelines: Vec<Pipeline> = ["first", "second", "third"]
        .into_iter()
        .map(|label| engine.compose(step! { name: label, action: visit(label) }).unwrap())
        .collect();

    let report = engine
        .run_all(pipelines, Scheduling::Sequential, Scope::new())
        .await
        .unwrap();
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_bare_callable_is_a_complete_step() {
    let engine = Engine::default();
    let fetch = Callable::constant("fetch", json!([1, 2]));
    let pipeline = engine.compose(fetch).unwrap();

    assert!(pipeline.name().as_str().starts_with("step-"));
    assert_eq!(pipeline.active_fields(), vec![kumihimo::Field::Name, kumihimo::Field::Action]);

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    assert_eq!(report.scope.get(pipeline.name().as_str()), Some(json!([1, 2])));
}

#[tokio::test]
async fn test_normalizing_twice_changes_nothing() {
    let shorthands: Vec<Description> = vec![
        Callable::constant("fetch", json!(1)).into(),
        step! { name: "named" },
        step! { name: "void", action: Value::Null },
        step! { skip: true, action: Callable::constant("noop", Value::Null) },
    ];
    for shorthand in shorthands {
        let once = kumihimo::normalize(shorthand, "root").unwrap();
        let twice = kumihimo::normalize(once.clone(), "root").unwrap();
        assert_eq!(once, twice);
        kumihimo::verify(&once, "root").unwrap();
    }
}

#[tokio::test]
async fn test_cleanup_runs_once_on_every_path() {
    let engine = Engine::default();
    let runs = Arc::new(AtomicUsize::new(0));

    let skipped = step! { name: "skipped", skip: true, cleanup: counting("tidy", &runs) };
    let suppressed = step! {
        name: "suppressed",
        suppress: "ActionError",
        action: raising("explode"),
        cleanup: counting("tidy", &runs),
    };
    let failed = step! { name: "failed", action: raising("explode"), cleanup: counting("tidy", &runs) };

    for (expected, description) in [(1, skipped), (2, suppressed), (3, failed)] {
        let pipeline = engine.compose(description).unwrap();
        let _ = engine.run(&pipeline, Scope::new()).await;
        assert_eq!(runs.load(Ordering::SeqCst), expected);
    }
}

#[tokio::test]
async fn test_unresolved_dependency_fails_the_run() {
    let engine = Engine::default();
    let needs_token = Callable::sync("authorize", Signature::new().positional("token"), |_| {
        Ok(json!("authorized"))
    });
    let pipeline = engine
        .compose(step! { name: "auth", action: needs_token })
        .unwrap();

    let failure = engine.run(&pipeline, Scope::new()).await.unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::UnresolvedDependency);
    assert!(matches!(
        &failure.error,
        EngineError::UnresolvedDependency { parameter, .. } if parameter == "token"
    ));
}

#[tokio::test]
async fn test_invalid_concurrency_is_rejected_when_composing() {
    let error = Engine::default()
        .compose(json!({
            "name": "fan-out",
            "substeps": {"parallel": [{"name": "a"}], "concurrency": 0}
        }))
        .unwrap_err();
    assert_eq!(error, EngineError::InvalidConcurrency(0));
}

#[tokio::test]
async fn test_failure_reports_step_and_last_merged_scope() {
    let engine = Engine::default();
    let pipeline = engine
        .compose(step! {
            name: "nightly",
            substeps: vec![
                step! { name: "extract", arguments: json!({"rows": 3}) },
                step! { name: "load", validator: Callable::constant("never", json!(false)) },
            ],
        })
        .unwrap();

    let failure = engine.run(&pipeline, Scope::new()).await.unwrap_err();
    assert_eq!(failure.step.as_str(), "load");
    assert_eq!(failure.kind(), ErrorKind::ValidationFailed);
    assert_eq!(failure.scope.get("rows"), None, "the failed parent never merged");
    assert!(record(&failure.journal, "extract").status == StepStatus::Succeeded);
    assert!(record(&failure.journal, "load").status.is_failure());
    assert!(record(&failure.journal, "nightly").status.is_failure());
}

#[tokio::test]
async fn test_sibling_failure_keeps_earlier_merges() {
    let engine = Engine::default();
    let pipelines = vec![
        engine.compose(step! { name: "extract", arguments: json!({"rows": 3}) }).unwrap(),
        engine.compose(step! { name: "load", action: raising("insert") }).unwrap(),
    ];

    let failure = engine
        .run_all(pipelines, Scheduling::Sequential, Scope::new())
        .await
        .unwrap_err();
    assert_eq!(failure.step.as_str(), "load");
    assert_eq!(failure.kind(), ErrorKind::ActionError);
    assert_eq!(failure.scope.get("rows"), Some(json!(3)));
}

#[tokio::test]
async fn test_workflow_loaded_from_yaml() {
    let mut registry = Registry::new();
    registry
        .register(Callable::sync("fetch", Signature::new().positional("limit"), |args| {
            let limit = args.get("limit").and_then(Value::as_u64).unwrap_or_default();
            Ok(json!((1..=limit).collect::<Vec<_>>()))
        }))
        .register(Callable::sync("total", Signature::new().positional("fetch"), |args| {
            let rows = args.get("fetch").and_then(Value::as_array).cloned().unwrap_or_default();
            Ok(json!(rows.iter().filter_map(Value::as_u64).sum::<u64>()))
        }));

    let yaml = r#"
name: report
arguments:
  limit: 4
substeps:
  - name: fetch
    action: fetch
  - name: total
    action: total
    log:
      message: totals computed
      level: debug
"#;
    let description = Description::from_yaml_str(yaml, &registry).unwrap();
    let engine = Engine::default();
    let pipeline = engine.compose(description).unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    assert_eq!(report.scope.get("total"), Some(json!(10)));
    assert_eq!(report.scope.get("limit"), Some(json!(4)));
}

#[tokio::test]
async fn test_action_timeout() {
    let engine = Engine::new(EngineConfig::new().with_action_timeout(Some(Duration::from_millis(20))));
    let slow = Callable::new("slow", Signature::new(), |_| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    });
    let pipeline = engine.compose(step! { name: "slow", action: slow }).unwrap();

    let failure = engine.run(&pipeline, Scope::new()).await.unwrap_err();
    assert_eq!(failure.error.action_tag(), Some("timeout"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requires_runs_a_dependency_graph() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let visit = |label: &'static str, millis: u64| {
        let order = Arc::clone(&order);
        Callable::new(label, Signature::new(), move |_| {
            let order = Arc::clone(&order);
            async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                order.lock().unwrap().push(label);
                Ok(json!(label))
            }
        })
    };

    let mut registry = Registry::new();
    registry
        .register(visit("extract", 30))
        .register(visit("transform", 5))
        .register(visit("load", 5))
        .register(visit("report", 5));

    let yaml = r#"
name: etl
substeps:
  parallel:
    - {name: load, action: load}
    - {name: transform, action: transform}
    - {name: extract, action: extract}
    - {name: report, action: report}
  requires:
    - [transform, extract]
    - [load, transform]
    - [3, 0]
  concurrency: 2
"#;
    let engine = Engine::default();
    let pipeline = engine.compose(Description::from_yaml_str(yaml, &registry).unwrap()).unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["extract", "transform", "load", "report"]);
    assert_eq!(report.scope.get("report"), Some(json!("report")));
}

#[tokio::test]
async fn test_failed_prerequisite_stops_its_dependents() {
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = Engine::default();
    let pipeline = engine
        .compose(step! {
            name: "deploy",
            substeps: Description::map([
                (
                    "steps",
                    Description::from(vec![
                        step! { name: "build", action: raising("compile") },
                        step! { name: "ship", action: counting("ship", &runs) },
                        step! { name: "lint", arguments: json!({"linted": true}) },
                    ]),
                ),
                ("requires", json!([["ship", "build"]]).into()),
            ]),
        })
        .unwrap();

    let failure = engine.run(&pipeline, Scope::new()).await.unwrap_err();
    assert_eq!(failure.step.as_str(), "build");
    assert_eq!(runs.load(Ordering::SeqCst), 0, "ship never started");
    assert_eq!(record(&failure.journal, "lint").status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_cyclic_requires_are_rejected_when_composing() {
    let error = Engine::default()
        .compose(json!({
            "name": "loop",
            "substeps": {
                "steps": [{"name": "a"}, {"name": "b"}],
                "requires": [["a", "b"], ["b", "a"]]
            }
        }))
        .unwrap_err();
    assert_eq!(error, EngineError::malformed("root.substeps.requires", "requirements form a cycle"));
}

#[tokio::test]
async fn test_substeps_computed_at_run_time() {
    let mut registry = Registry::new();
    registry
        .register(Callable::sync("shards", Signature::new().positional("count"), |args| {
            let count = args.get("count").and_then(Value::as_u64).unwrap_or_default();
            Ok(Value::Array(
                (0..count)
                    .map(|i| json!({"name": format!("shard-{i}"), "arguments": {format!("shard_{i}"): i}}))
                    .collect(),
            ))
        }))
        .register(Callable::sync("width", Signature::new().positional("count"), |args| {
            Ok(json!(args.get("count").and_then(Value::as_u64).unwrap_or(1).div_ceil(2)))
        }));

    let description = Description::from_json(
        json!({
            "name": "reindex",
            "arguments": {"count": 3},
            "substeps": {"parallel": "shards", "concurrency": "@width"}
        }),
        &registry,
    )
    .unwrap();
    let engine = Engine::default();
    let pipeline = engine.compose(description).unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    for i in 0..3 {
        assert_eq!(report.scope.get(&format!("shard_{i}")), Some(json!(i)));
        assert_eq!(record(&report.journal, &format!("shard-{i}")).status, StepStatus::Succeeded);
    }
}

#[tokio::test]
async fn test_run_reports_a_panicking_action_and_cleans_up() {
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = Engine::default();
    let pipeline = engine
        .compose(step! {
            name: "fragile",
            action: Callable::sync("explode", Signature::new(), |_| panic!("corrupt state")),
            cleanup: counting("tidy", &runs),
        })
        .unwrap();

    let failure = engine.run(&pipeline, Scope::new()).await.unwrap_err();
    assert_eq!(failure.step.as_str(), "fragile");
    assert_eq!(failure.error.action_tag(), Some("panic"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_suppress_covers_cleanup_errors() {
    let engine = Engine::default();
    let pipeline = engine
        .compose(step! {
            name: "release",
            suppress: "ActionError",
            cleanup: raising("unlock"),
        })
        .unwrap();

    let report = engine.run(&pipeline, Scope::new()).await.unwrap();
    assert_eq!(
        report.outcome,
        Outcome::Suppressed {
            step: StepName::new("release"),
            kind: ErrorKind::ActionError,
        }
    );
}
