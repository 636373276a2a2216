//! Lease engine: converts candidate records into exclusively-owned,
//! time-bounded leases, and walks them to their terminal writes.
//!
//! Every mutation is "read current version, write conditioned on it". A
//! lost claim race is an expected outcome (`ClaimOutcome::LostRace`), never
//! an error. Renew/release/finish retry the conditional write at most once,
//! after refetching, and only when the refetched record still names this
//! owner: a version that moved under a matching owner means an external
//! actor touched the record (e.g. a concurrent disable), which the retry
//! absorbs. An owner mismatch is always a hard `LeaseLost`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::{OwnerId, TaskRecord, TaskStatus};
use crate::error::SpoolError;
use crate::ports::{Clock, TaskStore};
use crate::schedule::CronExpression;

/// Result of a claim attempt. Losing the race is not an error.
#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(TaskRecord),
    LostRace,
}

/// Terminal write chosen by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Complete,
    Delete,
}

pub struct LeaseManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    owner: OwnerId,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, owner: OwnerId) -> Self {
        Self {
            store,
            clock,
            owner,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Try to take the lease on a candidate record. `LostRace` when another
    /// listener's conditional write landed first.
    pub async fn claim(
        &self,
        record: &TaskRecord,
        lease_duration: Duration,
    ) -> Result<ClaimOutcome, SpoolError> {
        let now = self.clock.now();
        let mut claimed = record.clone();
        claimed.begin_lease(self.owner.clone(), now + lease_duration, now);
        match self.store.conditional_update(claimed, record.version).await {
            Ok(stored) => Ok(ClaimOutcome::Claimed(stored)),
            Err(SpoolError::VersionConflict { .. }) | Err(SpoolError::NotFound { .. }) => {
                Ok(ClaimOutcome::LostRace)
            }
            Err(err) => Err(err),
        }
    }

    /// Push the lease deadline out so in-progress work is not reclaimed.
    pub async fn renew(
        &self,
        record: &TaskRecord,
        lease_duration: Duration,
    ) -> Result<TaskRecord, SpoolError> {
        self.guarded_update(record, |rec, now| {
            rec.extend_lease(now + lease_duration, now);
            Ok(())
        })
        .await
    }

    /// Drop the lease without touching status. The cooperative abandon path
    /// for a handler that observed disablement.
    pub async fn release(&self, record: &TaskRecord) -> Result<TaskRecord, SpoolError> {
        self.guarded_update(record, |rec, now| {
            rec.clear_lease(now);
            Ok(())
        })
        .await
    }

    /// Terminal write. `Complete` re-arms a recurring task (unless it was
    /// disabled mid-flight, which is a sink) and terminates a one-shot;
    /// `Delete` removes the record after verifying ownership.
    pub async fn finish(
        &self,
        record: &TaskRecord,
        outcome: FinishOutcome,
    ) -> Result<Option<TaskRecord>, SpoolError> {
        match outcome {
            FinishOutcome::Complete => {
                let stored = self
                    .guarded_update(record, |rec, now| {
                        match rec.recurrence.clone() {
                            Some(_) if rec.status == TaskStatus::Disabled => {
                                rec.clear_lease(now);
                            }
                            Some(expr) => {
                                let next = CronExpression::parse(&expr)?.next_after(now)?;
                                rec.rearm(next, now);
                            }
                            None => rec.complete(now),
                        }
                        Ok(())
                    })
                    .await?;
                Ok(Some(stored))
            }
            FinishOutcome::Delete => {
                self.delete_owned(record).await?;
                Ok(None)
            }
        }
    }

    async fn delete_owned(&self, record: &TaskRecord) -> Result<(), SpoolError> {
        match self.store.get(&record.task_type, &record.id).await {
            Ok(fresh) => {
                if fresh.lease_owner.as_ref() != Some(&self.owner) {
                    return Err(SpoolError::LeaseLost {
                        id: record.id.clone(),
                    });
                }
                self.store.delete(&record.task_type, &record.id).await
            }
            // Already gone; deletion is idempotent.
            Err(SpoolError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Apply `mutate` to the caller's cached record and write it guarded by
    /// the cached version. On a version conflict: refetch, require the
    /// owner to still match, re-apply, and retry exactly once.
    async fn guarded_update<F>(
        &self,
        record: &TaskRecord,
        mutate: F,
    ) -> Result<TaskRecord, SpoolError>
    where
        F: Fn(&mut TaskRecord, DateTime<Utc>) -> Result<(), SpoolError>,
    {
        let lease_lost = || SpoolError::LeaseLost {
            id: record.id.clone(),
        };

        if record.lease_owner.as_ref() != Some(&self.owner) {
            return Err(lease_lost());
        }

        let mut attempt = record.clone();
        mutate(&mut attempt, self.clock.now())?;
        match self.store.conditional_update(attempt, record.version).await {
            Ok(stored) => return Ok(stored),
            Err(SpoolError::VersionConflict { .. }) => {}
            Err(SpoolError::NotFound { .. }) => return Err(lease_lost()),
            Err(err) => return Err(err),
        }

        // The version moved underneath us. Refetch: if we still own the
        // lease the bump came from an external actor (disable, or our own
        // concurrent renew) and one retry on the fresh state absorbs it.
        let fresh = match self.store.get(&record.task_type, &record.id).await {
            Ok(fresh) => fresh,
            Err(SpoolError::NotFound { .. }) => return Err(lease_lost()),
            Err(err) => return Err(err),
        };
        if fresh.lease_owner.as_ref() != Some(&self.owner) {
            return Err(lease_lost());
        }
        debug!(
            id = %record.id,
            from_version = record.version,
            to_version = fresh.version,
            "retrying conditional write on refetched record"
        );

        let mut attempt = fresh.clone();
        // Handler payload mutations live on the cached record; carry them
        // onto the fresh state rather than reverting to the stored payload.
        attempt.payload = record.payload.clone();
        mutate(&mut attempt, self.clock.now())?;
        match self.store.conditional_update(attempt, fresh.version).await {
            Ok(stored) => Ok(stored),
            Err(SpoolError::VersionConflict { .. }) | Err(SpoolError::NotFound { .. }) => {
                Err(lease_lost())
            }
            Err(err) => Err(err),
        }
    }
}
