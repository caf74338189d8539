//! Graph primitives: units and the schedule that wires them.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Index of a unit inside its [`Schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(usize);

impl UnitId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Schedule::<()>::SOURCE => f.write_str("SOURCE"),
            Schedule::<()>::SINK => f.write_str("SINK"),
            UnitId(index) => write!(f, "unit#{index}"),
        }
    }
}

/// One schedulable node.
///
/// A unit counts its outstanding prerequisites; it becomes eligible to run
/// the moment that count reaches zero. `SOURCE` and `SINK` carry no work.
pub struct Unit<W> {
    id: UnitId,
    work: Option<W>,
    group: Option<usize>,
    prerequisites: Vec<UnitId>,
    dependents: Vec<UnitId>,
    pending: AtomicUsize,
}

impl<W> fmt::Debug for Unit<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("prerequisites", &self.prerequisites)
            .field("dependents", &self.dependents)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<W> Unit<W> {
    fn new(id: UnitId, work: Option<W>, group: Option<usize>) -> Self {
        Self {
            id,
            work,
            group,
            prerequisites: Vec::new(),
            dependents: Vec::new(),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn work(&self) -> Option<&W> {
        self.work.as_ref()
    }

    pub(crate) fn take_work(&mut self) -> Option<W> {
        self.work.take()
    }

    /// Group this unit belongs to (`None` for `SOURCE` and `SINK`).
    pub fn group(&self) -> Option<usize> {
        self.group
    }

    pub fn prerequisites(&self) -> &[UnitId] {
        &self.prerequisites
    }

    pub fn dependents(&self) -> &[UnitId] {
        &self.dependents
    }

    /// Prerequisites not yet satisfied.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Marks one prerequisite as satisfied.
    ///
    /// Returns `true` for exactly one caller: the one whose decrement brought
    /// the count to zero. That caller is responsible for starting the unit.
    pub fn release(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_or(false, |previous| previous == 1)
    }
}

/// A DAG of units between an implicit `SOURCE` and `SINK`.
///
/// Built once, driven to completion once.
///
/// # Examples
///
/// ```
/// use kumihimo::Schedule;
///
/// let mut schedule = Schedule::new();
/// let first = schedule.push("fetch", 0, false, true);
/// let second = schedule.push("store", 0, true, false);
/// schedule.require(second, first);
///
/// assert_eq!(schedule.len(), 2);
/// assert!(schedule.is_well_formed());
/// assert_eq!(schedule.prerequisites_of(second), &[first]);
/// ```
pub struct Schedule<W> {
    units: Vec<Unit<W>>,
    group_limit: Option<NonZeroUsize>,
    isolate_groups: bool,
}

impl<W> fmt::Debug for Schedule<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("units", &self.units)
            .field("group_limit", &self.group_limit)
            .field("isolate_groups", &self.isolate_groups)
            .finish()
    }
}

impl<W> Default for Schedule<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Schedule<W> {
    pub const SOURCE: UnitId = UnitId(0);
    pub const SINK: UnitId = UnitId(1);

    /// Creates a schedule holding only `SOURCE` wired to `SINK`.
    pub fn new() -> Self {
        let mut schedule = Self {
            units: vec![
                Unit::new(Self::SOURCE, None, None),
                Unit::new(Self::SINK, None, None),
            ],
            group_limit: None,
            isolate_groups: false,
        };
        schedule.require(Self::SINK, Self::SOURCE);
        schedule
    }

    /// Adds a unit of work.
    ///
    /// Unless told it will get explicit prerequisites, the unit requires
    /// `SOURCE`; unless told it will get explicit dependents, `SINK`
    /// requires it.
    pub fn push(
        &mut self,
        work: W,
        group: usize,
        has_prerequisites: bool,
        has_dependents: bool,
    ) -> UnitId {
        let id = UnitId(self.units.len());
        self.units.push(Unit::new(id, Some(work), Some(group)));

        if !has_prerequisites {
            self.require(id, Self::SOURCE);
        }
        if !has_dependents {
            self.require(Self::SINK, id);
        }
        id
    }

    /// Records that `dependent` cannot start before `prerequisite` completes.
    pub fn require(&mut self, dependent: UnitId, prerequisite: UnitId) {
        if dependent.0 >= self.units.len() || prerequisite.0 >= self.units.len() {
            return;
        }
        if self.units[dependent.0].prerequisites.contains(&prerequisite) {
            return;
        }
        self.units[dependent.0].prerequisites.push(prerequisite);
        self.units[dependent.0].pending.fetch_add(1, Ordering::AcqRel);
        self.units[prerequisite.0].dependents.push(dependent);
    }

    pub fn unit(&self, id: UnitId) -> Option<&Unit<W>> {
        self.units.get(id.0)
    }

    pub(crate) fn unit_mut(&mut self, id: UnitId) -> Option<&mut Unit<W>> {
        self.units.get_mut(id.0)
    }

    /// Work units, excluding `SOURCE` and `SINK`, in push order.
    pub fn units(&self) -> impl Iterator<Item = &Unit<W>> {
        self.units.iter().skip(2)
    }

    /// Number of work units.
    pub fn len(&self) -> usize {
        self.units.len() - 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prerequisites_of(&self, id: UnitId) -> &[UnitId] {
        self.unit(id).map_or(&[], |u| u.prerequisites())
    }

    pub fn dependents_of(&self, id: UnitId) -> &[UnitId] {
        self.unit(id).map_or(&[], |u| u.dependents())
    }

    /// Work units grouped by group index, each group in push order.
    pub fn groups(&self) -> Vec<Vec<UnitId>> {
        let mut groups: Vec<Vec<UnitId>> = Vec::new();
        for unit in self.units() {
            let Some(group) = unit.group else { continue };
            if groups.len() <= group {
                groups.resize_with(group + 1, Vec::new);
            }
            groups[group].push(unit.id);
        }
        groups.retain(|g| !g.is_empty());
        groups
    }

    /// Maximum number of groups allowed to be active at once.
    pub fn group_limit(&self) -> Option<NonZeroUsize> {
        self.group_limit
    }

    pub(crate) fn set_group_limit(&mut self, limit: Option<NonZeroUsize>) {
        self.group_limit = limit;
    }

    /// Whether each group runs in its own child scope.
    pub fn isolates_groups(&self) -> bool {
        self.isolate_groups
    }

    pub(crate) fn set_isolate_groups(&mut self, isolate: bool) {
        self.isolate_groups = isolate;
    }

    /// Units in a dependency-respecting order, or `None` if there is a cycle.
    pub fn topological_order(&self) -> Option<Vec<UnitId>> {
        let mut indegree: Vec<usize> = self.units.iter().map(|u| u.prerequisites.len()).collect();
        let mut ready: VecDeque<UnitId> = self
            .units
            .iter()
            .filter(|u| u.prerequisites.is_empty())
            .map(|u| u.id)
            .collect();
        let mut order = Vec::with_capacity(self.units.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dependent in self.dependents_of(id) {
                indegree[dependent.0] -= 1;
                if indegree[dependent.0] == 0 {
                    ready.push_back(*dependent);
                }
            }
        }

        (order.len() == self.units.len()).then_some(order)
    }

    /// Acyclic, every unit reachable from `SOURCE`, `SINK` reachable from every unit.
    pub fn is_well_formed(&self) -> bool {
        let Some(order) = self.topological_order() else {
            return false;
        };
        order.first() == Some(&Self::SOURCE)
            && order.last() == Some(&Self::SINK)
            && self.units.iter().all(|u| {
                (u.id == Self::SOURCE || !u.prerequisites.is_empty())
                    && (u.id == Self::SINK || !u.dependents.is_empty())
            })
    }
}
