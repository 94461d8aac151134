use std::sync::Arc;

use kairos_core::TriggerKind;
use kairos_store::{
    ExecutionRecord, JobDefinition, JobPatch, JobRecordStore, NewJobDefinition, Page,
    RecordFilter, TaskFilter,
};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    engine::SchedulerEngine,
    error::{Result, SchedulerError},
    types::{AddTaskRequest, ScheduledJob},
};

/// Result of a start/stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    Started,
    /// The engine already held the job.
    AlreadyRunning,
    /// Registration failed; the failure is recorded and the task is inactive.
    Rejected,
    /// A `once` task was dispatched; it never stays registered.
    RanOnce,
    Stopped,
    AlreadyStopped,
}

/// Outcome of [`TaskService::restore_active_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Already live, usually rehydrated from the timer store.
    pub skipped: usize,
    pub rejected: usize,
}

/// Owns the link between a definition's `is_active` flag and the engine.
///
/// Every flag change and (de)registration goes through here under the
/// engine's lifecycle lock, so callers never observe a stored flag that
/// disagrees with the live schedule they asked for.
pub struct TaskService {
    engine: SchedulerEngine,
    store: Arc<dyn JobRecordStore>,
    lock: Arc<Mutex<()>>,
}

impl TaskService {
    pub fn new(engine: SchedulerEngine, store: Arc<dyn JobRecordStore>) -> Self {
        let lock = engine.lifecycle_lock();
        Self {
            engine,
            store,
            lock,
        }
    }

    pub fn engine(&self) -> &SchedulerEngine {
        &self.engine
    }

    /// Persist a new definition, registering it when it asks to be active.
    ///
    /// The trigger is validated first; nothing is stored if it is malformed,
    /// or if activation is requested while the engine is not running.
    #[instrument(skip(self, def), fields(name = %def.name))]
    pub async fn create_task(&self, mut def: NewJobDefinition) -> Result<String> {
        let probe = AddTaskRequest {
            task_id: def.id.clone().unwrap_or_default(),
            group: def.group.clone(),
            handler_ref: def.handler_ref.clone(),
            handler_params: def.handler_params.clone(),
            trigger_kind: def.trigger_kind,
            expression: def.expression.clone(),
            remark: def.remark.clone(),
            start_datetime: def.start_datetime,
            end_datetime: def.end_datetime,
        };
        self.engine.validate_trigger(&probe)?;

        let _guard = self.lock.lock().await;
        let wants_active = def.is_active;
        if wants_active {
            self.engine.ensure_active()?;
        }
        def.is_active = false;
        let id = self.store.create_task(def).await?;
        info!(task_id = %id, "task created");
        if wants_active {
            self.activate(&id).await?;
        }
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn start_task(&self, id: &str) -> Result<TaskTransition> {
        let _guard = self.lock.lock().await;
        self.activate(id).await
    }

    /// Register `id` with the engine. Caller holds the service lock.
    async fn activate(&self, id: &str) -> Result<TaskTransition> {
        let def = self.store.get_task(id).await?;
        if self.engine.has_job(id)? {
            if !def.is_active {
                self.store.update_task(id, JobPatch::active(true)).await?;
            }
            return Ok(TaskTransition::AlreadyRunning);
        }

        let request = AddTaskRequest::from(&def);
        if def.trigger_kind == TriggerKind::Once {
            return Ok(match self.engine.add_job(&request).await? {
                Some(_) => TaskTransition::RanOnce,
                None => TaskTransition::Rejected,
            });
        }

        // Flag first: the failure path and trigger exhaustion both clear it.
        self.store.update_task(id, JobPatch::active(true)).await?;
        match self.engine.add_job(&request).await {
            Ok(Some(job)) => {
                info!(task_id = %id, next_fire_time = ?job.next_fire_time, "task started");
                Ok(TaskTransition::Started)
            }
            Ok(None) => Ok(TaskTransition::Rejected),
            Err(e) => {
                self.store.update_task(id, JobPatch::active(false)).await?;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn stop_task(&self, id: &str) -> Result<TaskTransition> {
        let _guard = self.lock.lock().await;
        let def = self.store.get_task(id).await?;
        let removed = match self.engine.remove_job(id) {
            Ok(()) => true,
            Err(SchedulerError::JobNotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if def.is_active {
            self.store.update_task(id, JobPatch::active(false)).await?;
        }
        if removed || def.is_active {
            info!(task_id = %id, "task stopped");
            Ok(TaskTransition::Stopped)
        } else {
            Ok(TaskTransition::AlreadyStopped)
        }
    }

    /// Delete a stopped task. Its execution records are kept.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let def = self.store.get_task(id).await?;
        if def.is_active || self.engine.has_job(id)? {
            return Err(SchedulerError::TaskStillActive { id: id.to_string() });
        }
        self.store.delete_task(id).await?;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    /// Fire a stored task once, now, alongside any recurring registration.
    #[instrument(skip(self))]
    pub async fn run_task_once(&self, id: &str) -> Result<ScheduledJob> {
        let def = self.store.get_task(id).await?;
        self.engine
            .run_job(&def.handler_ref, &def.handler_params, Some(&def.id))
    }

    /// Re-register every active definition the engine does not hold yet.
    ///
    /// Definitions that fail to register are deactivated.
    #[instrument(skip(self))]
    pub async fn restore_active_jobs(&self) -> Result<RestoreReport> {
        let _guard = self.lock.lock().await;
        let filter = TaskFilter {
            is_active: Some(true),
            ..TaskFilter::default()
        };
        let (defs, _) = self.store.list_tasks(filter, Page::all()).await?;

        let mut report = RestoreReport::default();
        for def in defs {
            if self.engine.has_job(&def.id)? {
                report.skipped += 1;
                continue;
            }
            if def.trigger_kind == TriggerKind::Once {
                // a finished immediate run has nothing to restore
                self.store.update_task(&def.id, JobPatch::active(false)).await?;
                report.skipped += 1;
                continue;
            }
            match self.engine.add_job(&AddTaskRequest::from(&def)).await {
                Ok(Some(_)) => report.restored += 1,
                Ok(None) => report.rejected += 1,
                Err(e) => {
                    warn!(task_id = %def.id, code = e.code(), "cannot restore task: {e}");
                    self.store.update_task(&def.id, JobPatch::active(false)).await?;
                    report.rejected += 1;
                }
            }
        }
        info!(
            restored = report.restored,
            skipped = report.skipped,
            rejected = report.rejected,
            "active tasks restored"
        );
        Ok(report)
    }

    pub async fn get_task(&self, id: &str) -> Result<JobDefinition> {
        Ok(self.store.get_task(id).await?)
    }

    pub async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<(Vec<JobDefinition>, u64)> {
        Ok(self.store.list_tasks(filter, page).await?)
    }

    pub async fn list_records(
        &self,
        filter: RecordFilter,
        page: Page,
    ) -> Result<(Vec<ExecutionRecord>, u64)> {
        Ok(self.store.list_records(filter, page).await?)
    }
}
