//! `kairos-scheduler`: in-process job scheduling with durable timer state.
//!
//! # Overview
//!
//! The [`SchedulerEngine`] keeps live jobs in a priority queue ordered by
//! next fire time and mirrors them into the `scheduler_task_jobs` table so a
//! restarted process picks up where it left off. Each fire resolves its
//! handler through the [`HandlerRegistry`], runs it on its own Tokio task and
//! hands the outcome to the [`ExecutionListener`], which appends a row to
//! `scheduler_task_record`.
//!
//! [`TaskService`] sits on top and keeps each definition's `is_active` flag
//! in step with the engine.
//!
//! # Trigger expressions
//!
//! | Kind       | Expression                                          |
//! |------------|-----------------------------------------------------|
//! | `interval` | `seconds minutes hours days weeks`, `*` = 0         |
//! | `cron`     | `second minute hour day month day_of_week [year]`   |
//! | `date`     | RFC 3339 or `YYYY-MM-DD HH:MM:SS` in the job's zone |
//! | `once`     | none; fires immediately                             |

pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod jobstore;
pub mod listener;
pub mod service;
pub mod trigger;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use handler::{HandlerRegistry, TaskContext, TaskHandler};
pub use listener::ExecutionListener;
pub use service::{RestoreReport, TaskService, TaskTransition};
pub use trigger::{
    parse_cron_expression, parse_date_expression, parse_interval_expression, CronFields,
    IntervalFields, Trigger, TriggerOptions, TriggerSpec,
};
pub use types::{AddTaskRequest, EngineState, ExecutionEvent, ScheduledJob};
