use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Counts by status for one task-type partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub active: usize,
    pub running: usize,
    pub disabled: usize,
    pub completed: usize,
}

impl StatusCounts {
    pub fn observe(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Active => self.active += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Disabled => self.disabled += 1,
            TaskStatus::Completed => self.completed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.active + self.running + self.disabled + self.completed
    }
}
