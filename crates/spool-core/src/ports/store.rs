//! Store port.
//!
//! The only network-facing boundary of the engine. The contract is kept
//! minimal on purpose: point read, filtered range query, insert, idempotent
//! delete, and a conditional update keyed on the record's version token. No
//! subscriptions or changefeeds; the listener compensates by polling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{TaskId, TaskRecord, TaskType};
use crate::error::SpoolError;

/// Adapter-translatable query predicate.
///
/// An enum rather than a closure so a real document-store adapter can turn
/// it into a server-side filter instead of scanning client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFilter {
    All,
    /// The claim predicate evaluated at the given instant: due Active work,
    /// or Running work whose lease has expired.
    ClaimableAt(DateTime<Utc>),
}

impl TaskFilter {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::ClaimableAt(now) => record.is_claimable(*now),
        }
    }
}

/// Store port (interface). Implementations guard `conditional_update` with
/// the version token; that single primitive is what the whole lease protocol
/// rests on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new record. Fails with `Conflict` when the id already
    /// exists in the task-type partition.
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, SpoolError>;

    /// Point read. Fails with `NotFound`.
    async fn get(&self, task_type: &TaskType, id: &TaskId) -> Result<TaskRecord, SpoolError>;

    /// Unordered range query over one task-type partition.
    async fn query(
        &self,
        task_type: &TaskType,
        filter: TaskFilter,
    ) -> Result<Vec<TaskRecord>, SpoolError>;

    /// Write `record` iff the stored version equals `expected_version`;
    /// the stored version becomes `expected_version + 1`. Fails with
    /// `VersionConflict` on a mismatch and `NotFound` when the record is
    /// gone.
    async fn conditional_update(
        &self,
        record: TaskRecord,
        expected_version: u64,
    ) -> Result<TaskRecord, SpoolError>;

    /// Idempotent removal.
    async fn delete(&self, task_type: &TaskType, id: &TaskId) -> Result<(), SpoolError>;
}
