use chrono::{DateTime, Utc};
use kairos_core::TriggerKind;
use kairos_store::JobDefinition;
use serde::{Deserialize, Serialize};

use crate::trigger::TriggerSpec;

/// Separator between a job id and the suffix of an immediate-run copy.
pub const TEMP_JOB_MARKER: &str = "-temp-";

/// Strip the immediate-run suffix, yielding the durable job id.
pub fn durable_job_id(engine_id: &str) -> &str {
    engine_id
        .split_once(TEMP_JOB_MARKER)
        .map_or(engine_id, |(id, _)| id)
}

/// Input for [`crate::SchedulerEngine::add_job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub group: Option<String>,
    pub handler_ref: String,
    #[serde(default)]
    pub handler_params: String,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub start_datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_datetime: Option<DateTime<Utc>>,
}

impl From<&JobDefinition> for AddTaskRequest {
    fn from(def: &JobDefinition) -> Self {
        Self {
            task_id: def.id.clone(),
            group: def.group.clone(),
            handler_ref: def.handler_ref.clone(),
            handler_params: def.handler_params.clone(),
            trigger_kind: def.trigger_kind,
            expression: def.expression.clone(),
            remark: def.remark.clone(),
            start_datetime: def.start_datetime,
            end_datetime: def.end_datetime,
        }
    }
}

/// A job as the engine holds it in memory (and in `scheduler_task_jobs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub handler_ref: String,
    pub handler_params: String,
    pub trigger: TriggerSpec,
    /// `None` once the trigger is exhausted.
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Outcome of one fire, handed to the execution listener.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    /// Engine job id, possibly carrying the immediate-run suffix.
    pub job_id: String,
    pub scheduled_run_time: DateTime<Utc>,
    pub retval: Option<String>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    /// The job left the engine with this fire: its trigger is exhausted or
    /// its handler could not be resolved.
    pub unscheduled: bool,
}

/// Lifecycle of a [`crate::SchedulerEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Constructed, not yet started.
    Stopped,
    Running,
    /// Terminal; a new engine must be built to schedule again.
    ShutDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Running => "running",
            EngineState::ShutDown => "shut_down",
        };
        write!(f, "{s}")
    }
}
