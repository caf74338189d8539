//! Per-run record of how every step ended.

use kumihimo_core::{ErrorKind, StepName};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// How one step invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Suppressed { kind: ErrorKind, message: String },
    Failed { kind: ErrorKind, message: String },
}

impl StepStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed { .. })
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => f.write_str("succeeded"),
            StepStatus::Skipped => f.write_str("skipped"),
            StepStatus::Suppressed { kind, .. } => write!(f, "suppressed ({kind})"),
            StepStatus::Failed { kind, .. } => write!(f, "failed ({kind})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: StepName,
    pub status: StepStatus,
    pub elapsed: Duration,
}

/// Shared, append-only list of step records in completion order.
///
/// Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    records: Arc<Mutex<Vec<StepRecord>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: StepRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<StepRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status of the most recent record for `name`.
    pub fn status_of(&self, name: &str) -> Option<StepStatus> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| r.status.clone())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
