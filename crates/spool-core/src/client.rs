//! TaskClient: the facade over store, schedule, projection, and listener
//! construction.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::{TaskId, TaskRecord, TaskType};
use crate::error::SpoolError;
use crate::listener::{ListenOptions, Listener, TaskHandler};
use crate::observability::StatusCounts;
use crate::ports::{Clock, SystemClock, TaskFilter, TaskStore};
use crate::projection::{FieldPath, summarize};
use crate::schedule::CronExpression;

/// A hot record being disabled can lose the CAS to claim/renew traffic a
/// few times; past this we give up and surface the conflict.
const DISABLE_CAS_ATTEMPTS: u32 = 8;

/// Options for `create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Caller-chosen id; generated when omitted.
    pub id: Option<TaskId>,
    /// Cron expression; presence makes the task recurring.
    pub recurrence: Option<String>,
}

impl CreateOptions {
    pub fn recurring(expression: impl Into<String>) -> Self {
        Self {
            id: None,
            recurrence: Some(expression.into()),
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Client facade. Cheap to clone; all clones share the store and clock.
#[derive(Clone)]
pub struct TaskClient {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskClient {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create an Active task. A recurrence expression is parsed up front:
    /// a malformed or unsatisfiable schedule fails here and nothing is
    /// persisted. One-shot tasks are due immediately; recurring tasks are
    /// due at their first future fire.
    pub async fn create(
        &self,
        task_type: &TaskType,
        payload: Value,
        options: CreateOptions,
    ) -> Result<TaskRecord, SpoolError> {
        let now = self.clock.now();
        let (recurrence, next_run_at) = match &options.recurrence {
            Some(expression) => {
                let cron = CronExpression::parse(expression)?;
                (Some(cron.source().to_string()), cron.next_after(now)?)
            }
            None => (None, now),
        };
        let record = TaskRecord::new(
            options.id.unwrap_or_else(TaskId::generate),
            task_type.clone(),
            payload,
            recurrence,
            next_run_at,
            now,
        );
        self.store.insert(record).await
    }

    pub async fn get(&self, task_type: &TaskType, id: &TaskId) -> Result<TaskRecord, SpoolError> {
        self.store.get(task_type, id).await
    }

    /// Full records of one task type.
    pub async fn list(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, SpoolError> {
        self.store.query(task_type, TaskFilter::All).await
    }

    /// Summary views of one task type: metadata, plus any projected payload
    /// subtrees. With no paths the payload is omitted entirely.
    pub async fn list_summary(
        &self,
        task_type: &TaskType,
        project: &[FieldPath],
    ) -> Result<Vec<Value>, SpoolError> {
        let records = self.store.query(task_type, TaskFilter::All).await?;
        Ok(records
            .iter()
            .map(|record| summarize(record, project))
            .collect())
    }

    /// Delete one record, or every record of the type when `id` is omitted.
    pub async fn delete(
        &self,
        task_type: &TaskType,
        id: Option<&TaskId>,
    ) -> Result<(), SpoolError> {
        match id {
            Some(id) => self.store.delete(task_type, id).await,
            None => {
                let records = self.store.query(task_type, TaskFilter::All).await?;
                for record in records {
                    self.store.delete(task_type, &record.id).await?;
                }
                Ok(())
            }
        }
    }

    /// Unconditional cooperative-stop flip, independent of any lease. The
    /// owning listener relays it to the handler within one watch cycle.
    pub async fn disable(
        &self,
        task_type: &TaskType,
        id: &TaskId,
    ) -> Result<TaskRecord, SpoolError> {
        let mut last_conflict = None;
        for _ in 0..DISABLE_CAS_ATTEMPTS {
            let current = self.store.get(task_type, id).await?;
            let mut flipped = current.clone();
            flipped.disable(self.clock.now());
            match self
                .store
                .conditional_update(flipped, current.version)
                .await
            {
                Ok(stored) => return Ok(stored),
                Err(err @ SpoolError::VersionConflict { .. }) => last_conflict = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| SpoolError::Store("disable retries exhausted".to_string())))
    }

    /// Construct and start a listener for the type. The returned handle
    /// stops it.
    pub fn listen(
        &self,
        task_type: &TaskType,
        handler: Arc<dyn TaskHandler>,
        options: ListenOptions,
    ) -> Listener {
        Listener::spawn(
            self.store.clone(),
            self.clock.clone(),
            task_type.clone(),
            handler,
            options,
        )
    }

    /// Counts by status for the type.
    pub async fn counts(&self, task_type: &TaskType) -> Result<StatusCounts, SpoolError> {
        let records = self.store.query(task_type, TaskFilter::All).await?;
        let mut counts = StatusCounts::default();
        for record in &records {
            counts.observe(record.status);
        }
        Ok(counts)
    }

    /// Convenience facade pre-bound to one task type. Pure ergonomics.
    pub fn scoped(&self, task_type: impl Into<TaskType>) -> ScopedClient {
        ScopedClient {
            client: self.clone(),
            task_type: task_type.into(),
        }
    }
}

/// `TaskClient` bound to a single task type.
#[derive(Clone)]
pub struct ScopedClient {
    client: TaskClient,
    task_type: TaskType,
}

impl ScopedClient {
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub async fn create(
        &self,
        payload: Value,
        options: CreateOptions,
    ) -> Result<TaskRecord, SpoolError> {
        self.client.create(&self.task_type, payload, options).await
    }

    pub async fn get(&self, id: &TaskId) -> Result<TaskRecord, SpoolError> {
        self.client.get(&self.task_type, id).await
    }

    pub async fn list(&self) -> Result<Vec<TaskRecord>, SpoolError> {
        self.client.list(&self.task_type).await
    }

    pub async fn list_summary(&self, project: &[FieldPath]) -> Result<Vec<Value>, SpoolError> {
        self.client.list_summary(&self.task_type, project).await
    }

    pub async fn delete(&self, id: Option<&TaskId>) -> Result<(), SpoolError> {
        self.client.delete(&self.task_type, id).await
    }

    pub async fn disable(&self, id: &TaskId) -> Result<TaskRecord, SpoolError> {
        self.client.disable(&self.task_type, id).await
    }

    pub fn listen(&self, handler: Arc<dyn TaskHandler>, options: ListenOptions) -> Listener {
        self.client.listen(&self.task_type, handler, options)
    }

    pub async fn counts(&self) -> Result<StatusCounts, SpoolError> {
        self.client.counts(&self.task_type).await
    }
}
