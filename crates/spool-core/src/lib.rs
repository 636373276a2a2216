//! spool-core
//!
//! Client-side coordinator for a distributed, poll-based task queue layered
//! on a shared document store. Many processes create tasks; any number of
//! listener processes compete to claim and run them under optimistic,
//! time-bounded leases, with cron recurrence, cooperative disable, and
//! lease-expiry crash recovery.
//!
//! Module map:
//! - **domain**: the persisted task model (ids, task types, records)
//! - **ports**: abstraction seams (`TaskStore`, `Clock`)
//! - **impls**: in-memory store for development and tests
//! - **schedule**: cron recurrence expressions and next-fire computation
//! - **projection**: payload field projection for summary queries
//! - **lease**: the optimistic lease engine (claim/renew/release/finish)
//! - **listener**: dual polling loops driving user handlers
//! - **client**: the `TaskClient` facade
//! - **observability**: status count views

pub mod client;
pub mod domain;
pub mod error;
pub mod impls;
pub mod lease;
pub mod listener;
pub mod observability;
pub mod ports;
pub mod projection;
pub mod schedule;

pub use client::{CreateOptions, ScopedClient, TaskClient};
pub use domain::{OwnerId, TaskId, TaskRecord, TaskStatus, TaskType};
pub use error::SpoolError;
pub use impls::InMemoryStore;
pub use lease::{ClaimOutcome, FinishOutcome, LeaseManager};
pub use listener::{ListenOptions, Listener, TaskHandle, TaskHandler};
pub use observability::StatusCounts;
pub use ports::{Clock, ManualClock, SystemClock, TaskFilter, TaskStore};
pub use projection::FieldPath;
pub use schedule::CronExpression;
