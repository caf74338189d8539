//! Execution engine: composes pipelines and drives schedules to completion.

use crate::composer::Composer;
use crate::config::EngineConfig;
use crate::description::Description;
use crate::journal::{Journal, StepRecord};
use crate::pipeline::{panicked, Pipeline, Runtime, StepFailure, StepOutcome};
use crate::schedule::{Schedule, UnitId};
use crate::scheduler::{Scheduler, Scheduling};
use async_trait::async_trait;
use futures_util::FutureExt;
use kumihimo_core::{ActionError, EngineError, ErrorKind, Scope, StepName};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn, Instrument, Span};

/// Anything a schedule can run.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    fn label(&self) -> &StepName;

    async fn perform(&self, scope: &Scope, runtime: &Runtime) -> Result<(), StepFailure>;
}

#[async_trait]
impl<T: Work + ?Sized> Work for Arc<T> {
    fn label(&self) -> &StepName {
        (**self).label()
    }

    async fn perform(&self, scope: &Scope, runtime: &Runtime) -> Result<(), StepFailure> {
        (**self).perform(scope, runtime).await
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The top-level step failed and its own `suppress` caught it.
    Suppressed { step: StepName, kind: ErrorKind },
}

/// Result of a run that did not fail.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The seed scope with every merged write.
    pub scope: Scope,
    pub outcome: Outcome,
    pub journal: Vec<StepRecord>,
}

/// A failed run.
#[derive(Error, Debug, Clone)]
#[error("step '{step}' failed: {error}")]
pub struct RunFailure {
    /// The innermost step the error came from.
    pub step: StepName,
    #[source]
    pub error: EngineError,
    /// The seed scope as of the last successful merge.
    pub scope: Scope,
    pub journal: Vec<StepRecord>,
}

impl RunFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Composes step descriptions and runs them.
///
/// # Examples
///
/// ```
/// use kumihimo::{Callable, Description, Engine, Scope, Signature};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let engine = Engine::default();
/// let greet = Callable::sync("greet", Signature::new().positional("who"), |args| {
///     Ok(json!(format!("hello {}", args.get("who").and_then(|w| w.as_str()).unwrap_or("?"))))
/// });
/// let pipeline = engine
///     .compose(Description::map([
///         ("name", Description::from("greeting")),
///         ("action", greet.into()),
///     ]))
///     .unwrap();
///
/// let report = engine
///     .run(&pipeline, Scope::from_entries([("who", json!("kumi"))]))
///     .await
///     .unwrap();
/// assert_eq!(report.scope.get("greeting"), Some(json!("hello kumi")));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
    composer: Composer,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            composer: Composer::standard(),
        }
    }

    /// Uses a custom composer.
    pub fn with_composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn compose(&self, description: impl Into<Description>) -> Result<Pipeline, EngineError> {
        self.composer.compose(description)
    }

    fn runtime(&self) -> Runtime {
        Runtime::new(self.config.clone(), Journal::new())
    }

    /// Runs one pipeline against `seed`.
    pub async fn run(&self, pipeline: &Pipeline, seed: Scope) -> Result<RunReport, RunFailure> {
        let runtime = self.runtime();
        info!("Running '{}'", pipeline.name());
        match pipeline.invoke(&seed, &runtime).await {
            Ok(StepOutcome::Suppressed { kind }) => Ok(RunReport {
                scope: seed,
                outcome: Outcome::Suppressed {
                    step: pipeline.name().clone(),
                    kind,
                },
                journal: runtime.journal().records(),
            }),
            Ok(_) => Ok(RunReport {
                scope: seed,
                outcome: Outcome::Completed,
                journal: runtime.journal().records(),
            }),
            Err(failure) => Err(RunFailure {
                step: failure.step,
                error: failure.error,
                scope: seed,
                journal: runtime.journal().records(),
            }),
        }
    }

    /// Schedules sibling pipelines with `scheduling` and runs them against `seed`.
    pub async fn run_all(
        &self,
        pipelines: Vec<Pipeline>,
        scheduling: Scheduling,
        seed: Scope,
    ) -> Result<RunReport, RunFailure> {
        let runtime = self.runtime();
        let schedule = Scheduler::new(scheduling).schedule(pipelines);
        match drive(schedule, &seed, &runtime).await {
            Ok(()) => Ok(RunReport {
                scope: seed,
                outcome: Outcome::Completed,
                journal: runtime.journal().records(),
            }),
            Err(failure) => Err(RunFailure {
                step: failure.step,
                error: failure.error,
                scope: seed,
                journal: runtime.journal().records(),
            }),
        }
    }

    /// Drives an already built schedule against `scope`.
    pub async fn execute<W: Work>(
        &self,
        schedule: Schedule<W>,
        scope: &Scope,
    ) -> Result<(), StepFailure> {
        drive(schedule, scope, &self.runtime()).await
    }
}

struct Group {
    scope: Scope,
    remaining: usize,
    permit: Option<OwnedSemaphorePermit>,
    halted: bool,
}

/// Runs every unit of `schedule` whose prerequisites complete.
///
/// A unit starts the moment its last prerequisite completes and its group
/// holds (or obtains) a permit. A failed unit halts the rest of its group
/// only; the first failure is returned once nothing else can run.
pub(crate) async fn drive<W: Work>(
    mut schedule: Schedule<W>,
    scope: &Scope,
    runtime: &Runtime,
) -> Result<(), StepFailure> {
    let semaphore = schedule
        .group_limit()
        .map(|limit| Arc::new(Semaphore::new(limit.get())));
    let isolate = schedule.isolates_groups();

    let mut groups: HashMap<usize, Group> = HashMap::new();
    for (index, members) in schedule.groups().into_iter().enumerate() {
        let group = schedule
            .unit(members[0])
            .and_then(|u| u.group())
            .unwrap_or(index);
        groups.insert(
            group,
            Group {
                scope: if isolate { scope.child() } else { scope.clone() },
                remaining: members.len(),
                permit: None,
                halted: false,
            },
        );
    }

    let mut works: HashMap<UnitId, Arc<W>> = HashMap::new();
    let ids: Vec<UnitId> = schedule.units().map(|u| u.id()).collect();
    for id in ids {
        if let Some(work) = schedule.unit_mut(id).and_then(|u| u.take_work()) {
            works.insert(id, Arc::new(work));
        }
    }

    let mut waiting: VecDeque<UnitId> = VecDeque::new();
    let mut running: JoinSet<(UnitId, Result<(), StepFailure>)> = JoinSet::new();
    let mut tasks: HashMap<task::Id, (UnitId, StepName)> = HashMap::new();
    let mut failures: Vec<StepFailure> = Vec::new();
    let mut sink_reached = false;

    release_dependents(&schedule, Schedule::<W>::SOURCE, &mut waiting, &mut sink_reached);

    loop {
        // Start every waiting unit whose group can be active.
        let mut blocked = VecDeque::new();
        while let Some(id) = waiting.pop_front() {
            let Some(group_id) = schedule.unit(id).and_then(|u| u.group()) else {
                continue;
            };
            let Some(group) = groups.get_mut(&group_id) else {
                continue;
            };
            if group.permit.is_none() {
                if let Some(semaphore) = &semaphore {
                    match Arc::clone(semaphore).try_acquire_owned() {
                        Ok(permit) => group.permit = Some(permit),
                        Err(_) => {
                            blocked.push_back(id);
                            continue;
                        }
                    }
                }
            }
            let Some(work) = works.remove(&id) else {
                continue;
            };
            debug!("Starting '{}' ({}, group {})", work.label(), id, group_id);
            let label = work.label().clone();
            let group_scope = group.scope.clone();
            let runtime = runtime.clone();
            let task = running.spawn(
                async move {
                    let result = AssertUnwindSafe(work.perform(&group_scope, &runtime))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| {
                            Err(StepFailure {
                                step: work.label().clone(),
                                error: panicked(work.label(), payload.as_ref()),
                            })
                        });
                    (id, result)
                }
                .instrument(Span::current()),
            );
            tasks.insert(task.id(), (id, label));
        }
        waiting = blocked;

        let Some(joined) = running.join_next().await else {
            break;
        };
        let (id, result) = match joined {
            Ok((id, result)) => {
                tasks.retain(|_, (unit, _)| *unit != id);
                (id, result)
            }
            Err(e) => {
                let Some((id, label)) = tasks.remove(&e.id()) else {
                    warn!("Unknown unit task ended abnormally: {}", e);
                    continue;
                };
                warn!("Task of '{}' ended abnormally: {}", label, e);
                let tag = if e.is_panic() { "panic" } else { "aborted" };
                let error = EngineError::Action {
                    step_name: label.clone(),
                    source: ActionError::tagged(tag, e.to_string()),
                };
                (id, Err(StepFailure { step: label, error }))
            }
        };
        let Some(group_id) = schedule.unit(id).and_then(|u| u.group()) else {
            continue;
        };
        let Some(group) = groups.get_mut(&group_id) else {
            continue;
        };

        match result {
            Ok(()) => {
                group.remaining -= 1;
                if group.remaining == 0 {
                    if isolate {
                        group.scope.merge_into_parent();
                    }
                    group.permit = None;
                    debug!("Group {} finished", group_id);
                }
                release_dependents(&schedule, id, &mut waiting, &mut sink_reached);
            }
            Err(failure) => {
                warn!("Group {} halted by '{}': {}", group_id, failure.step, failure.error);
                group.halted = true;
                group.permit = None;
                failures.push(failure);
            }
        }
    }

    let halted = groups.values().filter(|g| g.halted).count();
    match failures.into_iter().next() {
        Some(first) => {
            debug!("Schedule stopped with {} halted groups", halted);
            Err(first)
        }
        None => {
            debug!("Schedule complete (sink reached: {})", sink_reached);
            Ok(())
        }
    }
}

fn release_dependents<W>(
    schedule: &Schedule<W>,
    id: UnitId,
    waiting: &mut VecDeque<UnitId>,
    sink_reached: &mut bool,
) {
    for &dependent in schedule.dependents_of(id) {
        let ready = schedule.unit(dependent).is_some_and(|u| u.release());
        if !ready {
            continue;
        }
        if dependent == Schedule::<W>::SINK {
            *sink_reached = true;
        } else {
            waiting.push_back(dependent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::StepStatus;
    use kumihimo_core::{Callable, Signature};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Probe {
        name: StepName,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Work for Probe {
        fn label(&self) -> &StepName {
            &self.name
        }

        async fn perform(&self, scope: &Scope, _runtime: &Runtime) -> Result<(), StepFailure> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(StepFailure {
                    step: self.name.clone(),
                    error: EngineError::Action {
                        step_name: self.name.clone(),
                        source: ActionError::new("probe failed"),
                    },
                });
            }
            scope.insert(self.name.as_str(), json!(true));
            Ok(())
        }
    }

    fn probes(count: usize, failing: &[usize]) -> (Vec<Probe>, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let probes = (0..count)
            .map(|i| Probe {
                name: StepName::new(format!("p{i}")),
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
                fail: failing.contains(&i),
            })
            .collect();
        (probes, peak)
    }

    #[tokio::test]
    async fn test_sequential_never_overlaps() {
        let (probes, peak) = probes(4, &[]);
        let schedule = Scheduler::new(Scheduling::Sequential).schedule(probes);
        let scope = Scope::new();

        Engine::default().execute(schedule, &scope).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(scope.local_len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_respects_group_limit() {
        let (probes, peak) = probes(5, &[]);
        let schedule = Scheduler::new(Scheduling::parallel(2).unwrap()).schedule(probes);
        let scope = Scope::new();

        Engine::default().execute(schedule, &scope).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scope.local_len(), 5, "every group merged upward");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_halts_only_its_group() {
        // groups: [p0, p1] [p2, p3] [p4]; p0 fails
        let (probes, _) = probes(5, &[0]);
        let schedule = Scheduler::new(Scheduling::parallel(2).unwrap()).schedule(probes);
        let scope = Scope::new();

        let failure = Engine::default().execute(schedule, &scope).await.unwrap_err();
        assert_eq!(failure.step.as_str(), "p0");
        assert!(!scope.contains("p1"), "rest of the failed group never ran");
        assert!(scope.contains("p2") && scope.contains("p3") && scope.contains("p4"));
    }

    #[tokio::test]
    async fn test_sequential_failure_keeps_earlier_merges() {
        let (probes, _) = probes(3, &[1]);
        let schedule = Scheduler::new(Scheduling::Sequential).schedule(probes);
        let scope = Scope::new();

        let failure = Engine::default().execute(schedule, &scope).await.unwrap_err();
        assert_eq!(failure.step.as_str(), "p1");
        assert!(scope.contains("p0"));
        assert!(!scope.contains("p2"));
    }

    #[tokio::test]
    async fn test_empty_schedule_completes() {
        let schedule: Schedule<Probe> = Schedule::new();
        assert!(Engine::default().execute(schedule, &Scope::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_step_is_a_failure() {
        let engine = Engine::default();
        let pipeline = engine
            .compose(Callable::sync("panics", Signature::new(), |_| {
                panic!("unexpected");
            }))
            .unwrap();

        let failure = engine
            .run_all(vec![pipeline], Scheduling::Sequential, Scope::new())
            .await
            .unwrap_err();
        assert_eq!(failure.error.action_tag(), Some("panic"));
    }

    /// Completes its work, then panics when the task releases it.
    struct PanicsOnRelease(StepName);

    #[async_trait]
    impl Work for PanicsOnRelease {
        fn label(&self) -> &StepName {
            &self.0
        }

        async fn perform(&self, _scope: &Scope, _runtime: &Runtime) -> Result<(), StepFailure> {
            Ok(())
        }
    }

    impl Drop for PanicsOnRelease {
        fn drop(&mut self) {
            panic!("released");
        }
    }

    #[tokio::test]
    async fn test_abnormal_task_end_is_a_failure() {
        let schedule =
            Scheduler::new(Scheduling::Sequential).schedule(vec![PanicsOnRelease(StepName::new("fragile"))]);

        let failure = Engine::default().execute(schedule, &Scope::new()).await.unwrap_err();
        assert_eq!(failure.step.as_str(), "fragile");
        assert_eq!(failure.error.action_tag(), Some("panic"));
    }

    #[tokio::test]
    async fn test_run_catches_a_panicking_step() {
        let engine = Engine::default();
        let pipeline = engine
            .compose(Callable::sync("panics", Signature::new(), |_| {
                panic!("unexpected");
            }))
            .unwrap();

        let failure = engine.run(&pipeline, Scope::new()).await.unwrap_err();
        assert_eq!(failure.step, *pipeline.name());
        assert_eq!(failure.error.action_tag(), Some("panic"));
        assert!(failure.error.to_string().contains("unexpected"));
    }

    #[tokio::test]
    async fn test_run_reports_journal() {
        let engine = Engine::default();
        let pipeline = engine
            .compose(json!({
                "name": "outer",
                "substeps": [{"name": "inner", "arguments": {"v": 1}}]
            }))
            .unwrap();

        let report = engine.run(&pipeline, Scope::new()).await.unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.scope.get("v"), Some(json!(1)));
        let names: Vec<&str> = report.journal.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer"]);
        assert!(report.journal.iter().all(|r| r.status == StepStatus::Succeeded));
    }
}
