//! Task record: the persisted unit of work.
//!
//! Design:
//! - The stored record is the single source of truth. In-memory copies held
//!   by listeners are caches and must reconcile through conditional writes.
//! - All state transitions are methods here; callers pass the instant so
//!   tests can drive time through a manual clock.
//! - `version` is the optimistic-concurrency token. It is only ever bumped
//!   by the store on a successful conditional write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OwnerId, TaskId, TaskType};

/// Task status in the store.
///
/// Transitions:
/// - Active -> Running (claim)
/// - Running -> Active (recurring complete) | Completed (one-shot complete)
/// - Running with an expired lease is reclaimable by any listener
/// - any -> Disabled (external cooperative-stop signal; the lease survives)
///
/// Disabled is a sink state: the record stays ineligible for claims until it
/// is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Eligible for claiming once `next_run_at` has passed.
    Active,
    /// Currently leased by a listener.
    Running,
    /// Signalled to stop cooperatively. Never claimable again.
    Disabled,
    /// Terminal state for one-shot tasks.
    Completed,
}

/// The persisted shape of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,

    /// Arbitrary structured value, opaque to the engine. The owning handler
    /// may mutate it before the terminal write persists it.
    pub payload: serde_json::Value,

    pub status: TaskStatus,

    /// Cron expression; presence marks the task as recurring. Validated at
    /// creation time, so stored values always parse.
    pub recurrence: Option<String>,

    /// The task is not claimable before this instant.
    pub next_run_at: DateTime<Utc>,

    /// Listener instance currently holding the lease.
    pub lease_owner: Option<OwnerId>,

    /// Instant after which a stale lease is reclaimable by any listener.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Optimistic-concurrency token; every successful write increments it.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        recurrence: Option<String>,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload,
            status: TaskStatus::Active,
            recurrence,
            next_run_at,
            lease_owner: None,
            lease_expires_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// The claim predicate: due Active work, or a Running record whose lease
    /// has expired (crash recovery).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Active => self.next_run_at <= now,
            TaskStatus::Running => self
                .lease_expires_at
                .map(|expires| expires <= now)
                .unwrap_or(false),
            TaskStatus::Disabled | TaskStatus::Completed => false,
        }
    }

    /// Take the lease: Running, owned, time-bounded.
    pub fn begin_lease(&mut self, owner: OwnerId, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.lease_owner = Some(owner);
        self.lease_expires_at = Some(expires_at);
        self.updated_at = now;
    }

    /// Push the lease deadline out; status and owner are untouched.
    pub fn extend_lease(&mut self, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.lease_expires_at = Some(expires_at);
        self.updated_at = now;
    }

    /// Drop the lease fields without changing status.
    pub fn clear_lease(&mut self, now: DateTime<Utc>) {
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    /// Return a recurring task to the claimable pool at its next fire time.
    pub fn rearm(&mut self, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Active;
        self.next_run_at = next_run_at;
        self.clear_lease(now);
    }

    /// Terminal transition for a one-shot task.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.clear_lease(now);
    }

    /// Cooperative-stop flip. Deliberately leaves the lease alone: a running
    /// handler keeps exclusive access until it releases or finishes.
    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Disabled;
        self.updated_at = now;
    }
}
