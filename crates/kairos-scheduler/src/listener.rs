use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use kairos_store::{JobPatch, JobRecordStore, NewExecutionRecord};
use tracing::{error, info, warn};

use crate::types::{durable_job_id, ExecutionEvent};

/// Post-execution hook: turns every fire into an execution record.
///
/// Nothing here returns an error. Store failures are logged; lookup failures
/// are folded into the record so history is never dropped.
pub struct ExecutionListener {
    store: Arc<dyn JobRecordStore>,
    tz: Tz,
}

impl ExecutionListener {
    pub fn new(store: Arc<dyn JobRecordStore>, tz: Tz) -> Self {
        Self { store, tz }
    }

    fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.tz).fixed_offset()
    }

    /// Record one completed fire.
    pub async fn job_executed(&self, event: ExecutionEvent) {
        let end = Utc::now();
        let process_time =
            ((end - event.scheduled_run_time).num_microseconds().unwrap_or(0) as f64 / 1e6).max(0.0);
        let job_id = durable_job_id(&event.job_id).to_string();
        let immediate_run = job_id != event.job_id;

        let mut record = NewExecutionRecord {
            job_id: job_id.clone(),
            start_datetime: self.local(event.scheduled_run_time),
            end_datetime: self.local(end),
            process_time,
            retval: event.retval,
            exception: event.exception,
            traceback: event.traceback,
            name: None,
            group: None,
            handler_ref: None,
            handler_params: None,
            trigger_kind: None,
            expression: None,
        };

        let mut patch = None;
        match self.store.get_task(&job_id).await {
            Ok(def) => {
                record = record.with_snapshot(&def);
                let mut p = JobPatch::last_run(event.scheduled_run_time);
                // an immediate run never retires the recurring registration
                if event.unscheduled && !immediate_run {
                    p.is_active = Some(false);
                }
                patch = Some(p);
            }
            Err(e) => {
                error!(job_id = %event.job_id, "job definition lookup failed: {e}");
                record.exception = Some(match record.exception.take() {
                    Some(run_error) => format!("{run_error}; {e}"),
                    None => e.to_string(),
                });
            }
        }

        match self.store.create_record(record).await {
            Ok(record_id) => {
                info!(%job_id, %record_id, process_time, "execution recorded");
            }
            Err(e) => error!(%job_id, "failed to write execution record: {e}"),
        }

        if let Some(patch) = patch {
            if let Err(e) = self.store.update_task(&job_id, patch).await {
                warn!(%job_id, "failed to update job definition after run: {e}");
            }
        }
    }

    /// Registration-failure path: deactivate the definition and record why.
    ///
    /// A missing definition is logged and nothing is written.
    pub async fn add_task_error_record(&self, task_id: &str, error: &str) {
        let job_id = durable_job_id(task_id);
        let def = match self.store.get_task(job_id).await {
            Ok(def) => def,
            Err(e) => {
                error!(%job_id, %error, "cannot record registration failure: {e}");
                return;
            }
        };

        if let Err(e) = self.store.update_task(job_id, JobPatch::active(false)).await {
            error!(%job_id, "failed to deactivate job definition: {e}");
        }

        let now = self.local(Utc::now());
        let record = NewExecutionRecord {
            job_id: job_id.to_string(),
            start_datetime: now,
            end_datetime: now,
            process_time: 0.0,
            retval: None,
            exception: Some(error.to_string()),
            traceback: None,
            name: None,
            group: None,
            handler_ref: None,
            handler_params: None,
            trigger_kind: None,
            expression: None,
        }
        .with_snapshot(&def);

        if let Err(e) = self.store.create_record(record).await {
            error!(%job_id, "failed to write registration failure record: {e}");
        }
    }
}
