//! In-memory store implementation.
//!
//! Development and test double for the store port. Honors the same
//! contract a remote document store would: the conditional update is the
//! only mutation that can lose a race, and it is atomic under the state
//! lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{TaskId, TaskRecord, TaskType};
use crate::error::SpoolError;
use crate::ports::{TaskFilter, TaskStore};

type Partition = HashMap<TaskId, TaskRecord>;

/// In-memory store: one partition map per task type.
#[derive(Default)]
pub struct InMemoryStore {
    partitions: Arc<Mutex<HashMap<TaskType, Partition>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, SpoolError> {
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(record.task_type.clone()).or_default();
        if partition.contains_key(&record.id) {
            return Err(SpoolError::Conflict {
                task_type: record.task_type.clone(),
                id: record.id.clone(),
            });
        }
        partition.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, task_type: &TaskType, id: &TaskId) -> Result<TaskRecord, SpoolError> {
        let partitions = self.partitions.lock().await;
        partitions
            .get(task_type)
            .and_then(|partition| partition.get(id))
            .cloned()
            .ok_or_else(|| SpoolError::NotFound {
                task_type: task_type.clone(),
                id: id.clone(),
            })
    }

    async fn query(
        &self,
        task_type: &TaskType,
        filter: TaskFilter,
    ) -> Result<Vec<TaskRecord>, SpoolError> {
        let partitions = self.partitions.lock().await;
        let records = partitions
            .get(task_type)
            .map(|partition| {
                partition
                    .values()
                    .filter(|record| filter.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    async fn conditional_update(
        &self,
        record: TaskRecord,
        expected_version: u64,
    ) -> Result<TaskRecord, SpoolError> {
        let mut partitions = self.partitions.lock().await;
        let stored = partitions
            .get_mut(&record.task_type)
            .and_then(|partition| partition.get_mut(&record.id))
            .ok_or_else(|| SpoolError::NotFound {
                task_type: record.task_type.clone(),
                id: record.id.clone(),
            })?;

        if stored.version != expected_version {
            return Err(SpoolError::VersionConflict {
                id: record.id.clone(),
                expected: expected_version,
            });
        }

        let mut updated = record;
        updated.version = expected_version + 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, task_type: &TaskType, id: &TaskId) -> Result<(), SpoolError> {
        let mut partitions = self.partitions.lock().await;
        if let Some(partition) = partitions.get_mut(task_type) {
            partition.remove(id);
        }
        Ok(())
    }
}
