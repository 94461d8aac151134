//! Persistence for job definitions and their execution history.
//!
//! Two SQLite tables back the scheduler: `scheduler_task_list` holds what
//! should be scheduled, `scheduler_task_record` is an append-only log of
//! every run attempt.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use db::init_db;
pub use error::{Result, StoreError};
pub use store::{JobRecordStore, SqliteJobStore};
pub use types::{
    ExecutionRecord, JobDefinition, JobPatch, NewExecutionRecord, NewJobDefinition, Page,
    RecordFilter, TaskFilter,
};
