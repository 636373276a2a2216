use thiserror::Error;

use crate::domain::{TaskId, TaskType};

/// Error taxonomy for the queue coordinator.
///
/// `VersionConflict` is the store-level CAS miss. Inside the lease engine it
/// is absorbed into `ClaimOutcome::LostRace` or converted to `LeaseLost`;
/// callers of the client surface only see it when their own conditional
/// write lost repeatedly.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("task not found: type={task_type} id={id}")]
    NotFound { task_type: TaskType, id: TaskId },

    #[error("task already exists: type={task_type} id={id}")]
    Conflict { task_type: TaskType, id: TaskId },

    #[error("version conflict on task {id}: expected v{expected}")]
    VersionConflict { id: TaskId, expected: u64 },

    #[error("lease lost on task {id}")]
    LeaseLost { id: TaskId },

    #[error("invalid recurrence expression: {0}")]
    InvalidExpression(String),

    #[error("recurrence expression never fires within the search horizon")]
    UnsatisfiableSchedule,

    #[error("invalid projection path: {0}")]
    InvalidPath(String),

    #[error("task handle already resolved by a terminal action")]
    HandleResolved,

    #[error("store error: {0}")]
    Store(String),
}
