//! Scheduling policies: turning an ordered list of work into a [`Schedule`].

use crate::schedule::{Schedule, UnitId};
use kumihimo_core::EngineError;
use std::fmt;
use std::num::NonZeroUsize;
use tracing::debug;

/// Upper bound on concurrently active groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concurrency {
    Bounded(NonZeroUsize),
    Unbounded,
}

impl Concurrency {
    /// Validates a user-supplied bound.
    pub fn bounded(limit: i64) -> Result<Self, EngineError> {
        usize::try_from(limit)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Concurrency::Bounded)
            .ok_or(EngineError::InvalidConcurrency(limit))
    }

    pub fn limit(&self) -> Option<NonZeroUsize> {
        match self {
            Concurrency::Bounded(limit) => Some(*limit),
            Concurrency::Unbounded => None,
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Bounded(limit) => write!(f, "{limit}"),
            Concurrency::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// How sibling units are arranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheduling {
    /// Strictly one after another; a failure halts the rest.
    #[default]
    Sequential,
    /// Contiguous groups, each a sequential chain, groups running side by side.
    Parallel(Concurrency),
}

impl Scheduling {
    /// Parallel with at most `limit` groups active at once.
    ///
    /// ```
    /// use kumihimo::{EngineError, Scheduling};
    ///
    /// assert!(Scheduling::parallel(4).is_ok());
    /// assert_eq!(Scheduling::parallel(0), Err(EngineError::InvalidConcurrency(0)));
    /// ```
    pub fn parallel(limit: i64) -> Result<Self, EngineError> {
        Concurrency::bounded(limit).map(Scheduling::Parallel)
    }

    /// Full fan-out: every unit in its own group.
    pub fn unbounded() -> Self {
        Scheduling::Parallel(Concurrency::Unbounded)
    }
}

impl fmt::Display for Scheduling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheduling::Sequential => f.write_str("sequential"),
            Scheduling::Parallel(concurrency) => write!(f, "parallel({concurrency})"),
        }
    }
}

/// Builds schedules according to one [`Scheduling`] policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    scheduling: Scheduling,
}

impl Scheduler {
    pub fn new(scheduling: Scheduling) -> Self {
        Self { scheduling }
    }

    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    /// Places `works` onto a fresh schedule.
    ///
    /// # Examples
    ///
    /// ```
    /// use kumihimo::{Scheduler, Scheduling};
    ///
    /// let scheduler = Scheduler::new(Scheduling::parallel(2)?);
    /// let schedule = scheduler.schedule(vec!["a", "b", "c", "d", "e"]);
    ///
    /// let sizes: Vec<usize> = schedule.groups().iter().map(Vec::len).collect();
    /// assert_eq!(sizes, vec![2, 2, 1]);
    /// # Ok::<(), kumihimo::EngineError>(())
    /// ```
    pub fn schedule<W>(&self, works: Vec<W>) -> Schedule<W> {
        let mut schedule = Schedule::new();
        let total = works.len();

        match self.scheduling {
            Scheduling::Sequential => {
                chain(&mut schedule, works, 0);
            }
            Scheduling::Parallel(concurrency) => {
                let size = group_size(total, concurrency);
                let mut works = works.into_iter().peekable();
                let mut group = 0;
                while works.peek().is_some() {
                    let members: Vec<W> = works.by_ref().take(size).collect();
                    chain(&mut schedule, members, group);
                    group += 1;
                }
                schedule.set_group_limit(concurrency.limit());
                schedule.set_isolate_groups(true);
            }
        }

        debug!(
            "Scheduled {} units ({}) into {} groups",
            total,
            self.scheduling,
            schedule.groups().len()
        );
        schedule
    }

    /// Places `works` onto a schedule wired by explicit
    /// `(dependent, prerequisite)` pairs of positions in `works`.
    ///
    /// Every unit is its own isolated group, so a unit's writes are merged
    /// before its dependents start. Under `Parallel(k)` at most `k` units run
    /// at once; `Sequential` runs one at a time. Returns `None` when a
    /// position is out of range or the pairs form a cycle.
    ///
    /// ```
    /// use kumihimo::{Scheduler, Scheduling};
    ///
    /// let scheduler = Scheduler::new(Scheduling::unbounded());
    /// let schedule = scheduler
    ///     .schedule_dependencies(vec!["fetch", "parse", "audit"], &[(1, 0)])
    ///     .expect("acyclic");
    /// assert_eq!(schedule.topological_order().map(|o| o.len()), Some(5));
    ///
    /// assert!(scheduler.schedule_dependencies(vec!["a", "b"], &[(0, 1), (1, 0)]).is_none());
    /// ```
    pub fn schedule_dependencies<W>(
        &self,
        works: Vec<W>,
        pairs: &[(usize, usize)],
    ) -> Option<Schedule<W>> {
        let total = works.len();
        if pairs.iter().any(|&(dependent, prerequisite)| dependent >= total || prerequisite >= total) {
            return None;
        }

        let mut schedule = Schedule::new();
        let mut ids = Vec::with_capacity(total);
        for (index, work) in works.into_iter().enumerate() {
            let has_prerequisites = pairs.iter().any(|&(dependent, _)| dependent == index);
            let has_dependents = pairs.iter().any(|&(_, prerequisite)| prerequisite == index);
            ids.push(schedule.push(work, index, has_prerequisites, has_dependents));
        }
        for &(dependent, prerequisite) in pairs {
            schedule.require(ids[dependent], ids[prerequisite]);
        }

        let limit = match self.scheduling {
            Scheduling::Sequential => NonZeroUsize::new(1),
            Scheduling::Parallel(concurrency) => concurrency.limit(),
        };
        schedule.set_group_limit(limit);
        schedule.set_isolate_groups(true);

        if !schedule.is_well_formed() {
            return None;
        }
        debug!("Scheduled {} units with {} dependencies", total, pairs.len());
        Some(schedule)
    }
}

/// Members per group: `ceil(total / ceil(total / k))`. This yields
/// `ceil(total / k)` groups whose sizes differ by at most one member; the
/// group limit, not the group count, bounds how many run at once.
fn group_size(total: usize, concurrency: Concurrency) -> usize {
    match concurrency {
        Concurrency::Unbounded => 1,
        Concurrency::Bounded(limit) => {
            let limit = limit.get();
            if total == 0 {
                return 1;
            }
            let groups = total.div_ceil(limit);
            total.div_ceil(groups)
        }
    }
}

fn chain<W>(schedule: &mut Schedule<W>, works: Vec<W>, group: usize) {
    let last = works.len().saturating_sub(1);
    let mut previous: Option<UnitId> = None;
    for (index, work) in works.into_iter().enumerate() {
        let id = schedule.push(work, group, index > 0, index < last);
        if let Some(previous) = previous {
            schedule.require(id, previous);
        }
        previous = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes<W>(schedule: &Schedule<W>) -> Vec<usize> {
        schedule.groups().iter().map(Vec::len).collect()
    }

    #[test]
    fn test_sequential_is_one_chain() {
        let schedule = Scheduler::new(Scheduling::Sequential).schedule(vec!["a", "b", "c"]);
        let ids: Vec<UnitId> = schedule.units().map(|u| u.id()).collect();

        assert_eq!(schedule.prerequisites_of(ids[0]), &[Schedule::<&str>::SOURCE]);
        assert_eq!(schedule.prerequisites_of(ids[1]), &[ids[0]]);
        assert_eq!(schedule.prerequisites_of(ids[2]), &[ids[1]]);
        assert_eq!(schedule.dependents_of(ids[2]), &[Schedule::<&str>::SINK]);
        assert_eq!(sizes(&schedule), vec![3]);
        assert_eq!(schedule.group_limit(), None);
        assert!(!schedule.isolates_groups());
        assert!(schedule.is_well_formed());
    }

    #[test]
    fn test_parallel_five_by_two() {
        let scheduling = Scheduling::parallel(2).unwrap();
        let schedule = Scheduler::new(scheduling).schedule(vec![1, 2, 3, 4, 5]);

        assert_eq!(sizes(&schedule), vec![2, 2, 1]);
        assert_eq!(schedule.group_limit().map(NonZeroUsize::get), Some(2));
        let heads = schedule
            .dependents_of(Schedule::<i32>::SOURCE)
            .iter()
            .filter(|id| **id != Schedule::<i32>::SINK)
            .count();
        assert_eq!(heads, 3, "every group hangs off SOURCE");
        assert!(schedule.is_well_formed());
    }

    #[test]
    fn test_parallel_groups_cover_every_unit_once() {
        for total in 0..12 {
            for limit in 1..6 {
                let scheduling = Scheduling::parallel(limit).unwrap();
                let schedule = Scheduler::new(scheduling).schedule((0..total).collect());
                let groups = schedule.groups();
                let covered: usize = groups.iter().map(Vec::len).sum();

                assert_eq!(covered, total, "total={total} limit={limit}");
                assert_eq!(groups.len(), total.div_ceil(limit as usize), "total={total} limit={limit}");
                assert!(schedule.is_well_formed());
            }
        }
    }

    #[test]
    fn test_unbounded_fans_out() {
        let schedule = Scheduler::new(Scheduling::unbounded()).schedule(vec!["a", "b", "c"]);
        assert_eq!(sizes(&schedule), vec![1, 1, 1]);
        assert_eq!(schedule.group_limit(), None);
    }

    #[test]
    fn test_empty_input() {
        let schedule = Scheduler::new(Scheduling::parallel(3).unwrap()).schedule(Vec::<()>::new());
        assert!(schedule.is_empty());
        assert!(schedule.is_well_formed());
    }

    #[test]
    fn test_dependencies_form_a_dag() {
        // audit requires fetch and parse; parse requires fetch
        let schedule = Scheduler::new(Scheduling::parallel(2).unwrap())
            .schedule_dependencies(vec!["fetch", "parse", "audit", "notify"], &[(2, 0), (2, 1), (1, 0)])
            .unwrap();
        let ids: Vec<UnitId> = schedule.units().map(|u| u.id()).collect();

        assert_eq!(schedule.prerequisites_of(ids[0]), &[Schedule::<&str>::SOURCE]);
        assert_eq!(schedule.prerequisites_of(ids[1]), &[ids[0]]);
        assert_eq!(schedule.prerequisites_of(ids[2]), &[ids[0], ids[1]]);
        assert_eq!(schedule.prerequisites_of(ids[3]), &[Schedule::<&str>::SOURCE]);
        assert_eq!(schedule.dependents_of(ids[2]), &[Schedule::<&str>::SINK]);
        assert_eq!(sizes(&schedule), vec![1, 1, 1, 1]);
        assert_eq!(schedule.group_limit().map(NonZeroUsize::get), Some(2));
        assert!(schedule.isolates_groups());

        let sequential = Scheduler::new(Scheduling::Sequential)
            .schedule_dependencies(vec!["a", "b"], &[])
            .unwrap();
        assert_eq!(sequential.group_limit().map(NonZeroUsize::get), Some(1));
    }

    #[test]
    fn test_dependencies_reject_cycles_and_unknown_positions() {
        let scheduler = Scheduler::new(Scheduling::unbounded());
        assert!(scheduler.schedule_dependencies(vec!["a"], &[(0, 0)]).is_none());
        assert!(scheduler
            .schedule_dependencies(vec!["a", "b", "c"], &[(0, 1), (1, 2), (2, 0)])
            .is_none());
        assert!(scheduler.schedule_dependencies(vec!["a"], &[(0, 3)]).is_none());
    }

    #[test]
    fn test_invalid_concurrency() {
        assert_eq!(Scheduling::parallel(0), Err(EngineError::InvalidConcurrency(0)));
        assert_eq!(Scheduling::parallel(-3), Err(EngineError::InvalidConcurrency(-3)));
        assert_eq!(Scheduling::unbounded().to_string(), "parallel(unbounded)");
    }
}
