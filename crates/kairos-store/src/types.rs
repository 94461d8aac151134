use chrono::{DateTime, FixedOffset, Utc};
use kairos_core::TriggerKind;
use serde::{Deserialize, Serialize};

/// A persisted job definition, one row of `scheduler_task_list`.
///
/// This is the application-level source of truth for what *should* be
/// scheduled. `is_active == true` means the engine currently holds a job
/// registered under `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Opaque primary key; UUIDv7 unless the caller supplied one.
    pub id: String,
    /// Human-readable label, not unique.
    pub name: String,
    pub group: Option<String>,
    /// Registry key of the handler, e.g. `reports.DailyDigest`.
    pub handler_ref: String,
    /// JSON object handed to the handler factory.
    pub handler_params: String,
    pub trigger_kind: TriggerKind,
    /// Trigger-kind specific expression; `None` for `once`.
    pub expression: Option<String>,
    pub is_active: bool,
    pub start_datetime: Option<DateTime<Utc>>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub last_run_datetime: Option<DateTime<Utc>>,
    pub create_datetime: DateTime<Utc>,
    pub update_datetime: DateTime<Utc>,
}

/// Input for [`crate::JobRecordStore::create_task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJobDefinition {
    /// Caller-chosen id. A UUIDv7 is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub handler_ref: String,
    #[serde(default = "empty_params")]
    pub handler_params: String,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub start_datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remark: Option<String>,
}

fn empty_params() -> String {
    "{}".to_string()
}

/// Partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub group: Option<String>,
    pub handler_ref: Option<String>,
    pub handler_params: Option<String>,
    pub trigger_kind: Option<TriggerKind>,
    pub expression: Option<String>,
    pub is_active: Option<bool>,
    pub start_datetime: Option<DateTime<Utc>>,
    pub end_datetime: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub last_run_datetime: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn active(is_active: bool) -> Self {
        Self {
            is_active: Some(is_active),
            ..Self::default()
        }
    }

    pub fn last_run(at: DateTime<Utc>) -> Self {
        Self {
            last_run_datetime: Some(at),
            ..Self::default()
        }
    }
}

/// One completed (or failed) run attempt, one row of `scheduler_task_record`.
///
/// Job metadata is copied in at write time so history stays readable after
/// the definition changes or disappears. Records are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    /// Soft reference to [`JobDefinition::id`].
    pub job_id: String,
    /// Scheduled fire time, in the configured zone.
    pub start_datetime: DateTime<FixedOffset>,
    pub end_datetime: DateTime<FixedOffset>,
    /// Seconds between scheduled fire time and completion.
    pub process_time: f64,
    pub retval: Option<String>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub name: Option<String>,
    pub group: Option<String>,
    pub handler_ref: Option<String>,
    pub handler_params: Option<String>,
    pub trigger_kind: Option<TriggerKind>,
    pub expression: Option<String>,
    pub create_datetime: DateTime<Utc>,
}

/// Input for [`crate::JobRecordStore::create_record`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecutionRecord {
    pub job_id: String,
    pub start_datetime: DateTime<FixedOffset>,
    pub end_datetime: DateTime<FixedOffset>,
    pub process_time: f64,
    pub retval: Option<String>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    pub name: Option<String>,
    pub group: Option<String>,
    pub handler_ref: Option<String>,
    pub handler_params: Option<String>,
    pub trigger_kind: Option<TriggerKind>,
    pub expression: Option<String>,
}

impl NewExecutionRecord {
    /// Copy the descriptive fields of `def` into this record.
    pub fn with_snapshot(mut self, def: &JobDefinition) -> Self {
        self.name = Some(def.name.clone());
        self.group = def.group.clone();
        self.handler_ref = Some(def.handler_ref.clone());
        self.handler_params = Some(def.handler_params.clone());
        self.trigger_kind = Some(def.trigger_kind);
        self.expression = def.expression.clone();
        self
    }
}

/// Filter for listing job definitions. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Substring match on `name`.
    pub name: Option<String>,
    pub group: Option<String>,
    pub trigger_kind: Option<TriggerKind>,
    pub is_active: Option<bool>,
}

/// Filter for listing execution records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub job_id: Option<String>,
    /// Substring match on the snapshotted `name`.
    pub name: Option<String>,
}

/// 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit,
        }
    }

    /// A single page large enough to hold every row.
    pub fn all() -> Self {
        Self {
            page: 1,
            limit: u32::MAX,
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.limit as i64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 10 }
    }
}
