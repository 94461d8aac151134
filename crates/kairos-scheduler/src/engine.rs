use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use kairos_core::{TaskConfig, TriggerKind};
use kairos_store::JobRecordStore;
use rusqlite::Connection;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    handler::{HandlerRegistry, TaskContext},
    jobstore::TimerStore,
    listener::ExecutionListener,
    trigger::{Trigger, TriggerOptions, TriggerSpec},
    types::{
        durable_job_id, AddTaskRequest, EngineState, ExecutionEvent, ScheduledJob,
        TEMP_JOB_MARKER,
    },
};

/// Longest the run loop sleeps when no job is due.
const IDLE_WAIT: std::time::Duration = std::time::Duration::from_secs(60);

struct Entry {
    job: ScheduledJob,
    trigger: Trigger,
    /// Distinguishes this registration from earlier ones under the same id.
    generation: u64,
}

#[derive(Default)]
struct Timers {
    entries: HashMap<String, Entry>,
    /// Min-heap of `(fire time, generation, job id)`. Entries whose
    /// generation no longer matches are skipped when popped.
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    next_generation: u64,
}

impl Timers {
    fn insert(&mut self, job: ScheduledJob, trigger: Trigger) {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(at) = job.next_fire_time {
            self.queue.push(Reverse((at, generation, job.job_id.clone())));
        }
        self.entries.insert(
            job.job_id.clone(),
            Entry {
                job,
                trigger,
                generation,
            },
        );
    }
}

/// One due job, taken off the queue by the run loop.
struct Fire {
    job: ScheduledJob,
    scheduled_at: DateTime<Utc>,
    generation: u64,
    exhausted: bool,
}

struct Inner {
    config: TaskConfig,
    tz: Tz,
    registry: Arc<HandlerRegistry>,
    timer_store: TimerStore,
    listener: Arc<ExecutionListener>,
    state: Mutex<EngineState>,
    timers: Mutex<Timers>,
    wake: Notify,
    shutdown_tx: watch::Sender<bool>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    /// Held while a definition's `is_active` flag changes together with its
    /// registration.
    lifecycle: Arc<AsyncMutex<()>>,
}

/// In-process job scheduler.
///
/// Cheap to clone; every clone drives the same engine. Registered jobs are
/// mirrored into `scheduler_task_jobs` and rebuilt on [`start`](Self::start).
/// Each fire runs as its own Tokio task, so a slow handler never delays the
/// next scheduling decision.
#[derive(Clone)]
pub struct SchedulerEngine {
    inner: Arc<Inner>,
}

impl SchedulerEngine {
    /// Build a stopped engine. `timer_conn` backs the internal timer table;
    /// `store` receives execution records.
    pub fn new(
        config: TaskConfig,
        timer_conn: Connection,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn JobRecordStore>,
    ) -> Result<Self> {
        let tz = config.tz()?;
        let timer_store = TimerStore::new(timer_conn)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                listener: Arc::new(ExecutionListener::new(store, tz)),
                config,
                tz,
                registry,
                timer_store,
                state: Mutex::new(EngineState::Stopped),
                timers: Mutex::new(Timers::default()),
                wake: Notify::new(),
                shutdown_tx,
                run_loop: Mutex::new(None),
                lifecycle: Arc::new(AsyncMutex::new(())),
            }),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock().expect("engine state poisoned")
    }

    /// Lock shared with whoever flips `is_active` next to (de)registering.
    ///
    /// The engine takes it before the listener clears the flag of a job that
    /// left the schedule, so a concurrent re-registration is never undone.
    pub fn lifecycle_lock(&self) -> Arc<AsyncMutex<()>> {
        Arc::clone(&self.inner.lifecycle)
    }

    /// Rebuild timers from `scheduler_task_jobs` and spawn the run loop.
    ///
    /// Jobs whose stored fire time has passed fire once right away; any
    /// further missed fires are folded into that one. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if !self.inner.config.enabled {
            return Err(SchedulerError::EngineNotActive(
                "task subsystem is disabled in configuration".to_string(),
            ));
        }
        let mut state = self.inner.state.lock().expect("engine state poisoned");
        match *state {
            EngineState::Running => {
                warn!("scheduler engine already running");
                return Ok(());
            }
            EngineState::ShutDown => return Err(SchedulerError::EngineShutDown),
            EngineState::Stopped => {}
        }

        let restored = self.rehydrate()?;
        *state = EngineState::Running;
        drop(state);

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_loop(inner, shutdown));
        *self.inner.run_loop.lock().expect("engine run loop poisoned") = Some(handle);

        info!(
            restored,
            listener = self.inner.config.listener,
            timezone = %self.inner.tz,
            "scheduler engine started"
        );
        Ok(())
    }

    fn rehydrate(&self) -> Result<usize> {
        let now = Utc::now();
        let mut timers = self.inner.timers.lock().expect("engine timers poisoned");
        let mut restored = 0;
        for mut job in self.inner.timer_store.load_all()? {
            let trigger = match Trigger::from_spec(&mut job.trigger, now) {
                Ok(t) => t,
                Err(e) => {
                    warn!(job_id = %job.job_id, "dropping stored job with invalid trigger: {e}");
                    self.inner.timer_store.delete(&job.job_id)?;
                    continue;
                }
            };
            if job.next_fire_time.is_none() {
                debug!(job_id = %job.job_id, "dropping exhausted stored job");
                self.inner.timer_store.delete(&job.job_id)?;
                continue;
            }
            if job.next_fire_time.is_some_and(|at| at < now) {
                info!(job_id = %job.job_id, "missed fire will run on start");
            }
            timers.insert(job, trigger);
            restored += 1;
        }
        Ok(restored)
    }

    /// Stop the run loop. A no-op unless the engine is running.
    ///
    /// Handlers already dispatched keep running to completion.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("engine state poisoned");
            let current = *state;
            if current != EngineState::Running {
                debug!(state = %current, "shutdown ignored");
                return;
            }
            *state = EngineState::ShutDown;
        }
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self
            .inner
            .run_loop
            .lock()
            .expect("engine run loop poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("scheduler run loop ended abnormally: {e}");
            }
        }
        info!("scheduler engine shut down");
    }

    /// Guard shared by every public operation; runs before anything else.
    pub fn ensure_active(&self) -> Result<()> {
        if !self.inner.config.enabled {
            return Err(SchedulerError::EngineNotActive(
                "task subsystem is disabled in configuration".to_string(),
            ));
        }
        match self.state() {
            EngineState::Running => Ok(()),
            other => Err(SchedulerError::EngineNotActive(format!("engine is {other}"))),
        }
    }

    fn spec(&self, kind: TriggerKind, expression: Option<&str>, options: TriggerOptions) -> TriggerSpec {
        TriggerSpec {
            kind,
            expression: expression.map(String::from),
            start: options.start,
            end: options.end,
            timezone: options.timezone.unwrap_or(self.inner.tz).name().to_string(),
            jitter: options.jitter,
        }
    }

    fn request_spec(&self, request: &AddTaskRequest) -> TriggerSpec {
        let options = TriggerOptions {
            start: request.start_datetime,
            end: request.end_datetime,
            ..TriggerOptions::default()
        };
        self.spec(request.trigger_kind, request.expression.as_deref(), options)
    }

    /// Check that `request` describes a trigger that parses and fires at
    /// least once. Needs no running engine.
    pub fn validate_trigger(&self, request: &AddTaskRequest) -> Result<()> {
        let mut spec = self.request_spec(request);
        let now = Utc::now();
        let trigger = Trigger::from_spec(&mut spec, now)?;
        match trigger.next_fire_time(None, now) {
            Some(_) => Ok(()),
            None => Err(SchedulerError::TriggerNeverFires {
                id: request.task_id.clone(),
            }),
        }
    }

    /// Fixed-period job, `seconds minutes hours days weeks`.
    pub fn add_interval_job(
        &self,
        handler_ref: &str,
        handler_params: &str,
        expression: &str,
        options: TriggerOptions,
        job_id: Option<&str>,
    ) -> Result<ScheduledJob> {
        self.ensure_active()?;
        let spec = self.spec(TriggerKind::Interval, Some(expression), options);
        self.register(job_id, handler_ref, handler_params, spec)
    }

    /// Cron job, `second minute hour day month day_of_week [year]`.
    pub fn add_cron_job(
        &self,
        handler_ref: &str,
        handler_params: &str,
        expression: &str,
        options: TriggerOptions,
        job_id: Option<&str>,
    ) -> Result<ScheduledJob> {
        self.ensure_active()?;
        let spec = self.spec(TriggerKind::Cron, Some(expression), options);
        self.register(job_id, handler_ref, handler_params, spec)
    }

    /// Single fire at an absolute instant.
    pub fn add_date_job(
        &self,
        handler_ref: &str,
        handler_params: &str,
        expression: &str,
        job_id: Option<&str>,
    ) -> Result<ScheduledJob> {
        self.ensure_active()?;
        let spec = self.spec(TriggerKind::Date, Some(expression), TriggerOptions::default());
        self.register(job_id, handler_ref, handler_params, spec)
    }

    /// Fire once, as soon as the run loop gets to it.
    ///
    /// The job is registered as `<job_id>-temp-<suffix>` so it never clashes
    /// with a recurring registration of the same job.
    pub fn run_job(
        &self,
        handler_ref: &str,
        handler_params: &str,
        job_id: Option<&str>,
    ) -> Result<ScheduledJob> {
        self.ensure_active()?;
        let base = job_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let temp_id = format!("{base}{TEMP_JOB_MARKER}{}", Uuid::new_v4().simple());
        let spec = self.spec(TriggerKind::Once, None, TriggerOptions::default());
        self.register(Some(&temp_id), handler_ref, handler_params, spec)
    }

    /// Register a job described by a stored task.
    ///
    /// Trigger validation errors are returned. A handler that cannot be
    /// resolved or an id that is already registered is written to the
    /// failure path instead (definition deactivated, failure record added)
    /// and `Ok(None)` is returned.
    pub async fn add_job(&self, request: &AddTaskRequest) -> Result<Option<ScheduledJob>> {
        self.ensure_active()?;

        self.validate_trigger(request)?;
        let spec = self.request_spec(request);

        let registered = match self
            .inner
            .registry
            .resolve(&request.handler_ref, &request.handler_params)
        {
            Ok(_) => {
                let job_id = Some(request.task_id.as_str());
                match request.trigger_kind {
                    TriggerKind::Once => {
                        self.run_job(&request.handler_ref, &request.handler_params, job_id)
                    }
                    _ => self.register(job_id, &request.handler_ref, &request.handler_params, spec),
                }
            }
            Err(e) => Err(e),
        };

        match registered {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_resolution() || matches!(e, SchedulerError::JobAlreadyExists { .. }) => {
                error!(task_id = %request.task_id, code = e.code(), "job registration failed: {e}");
                self.inner
                    .listener
                    .add_task_error_record(&request.task_id, &e.to_string())
                    .await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn register(
        &self,
        job_id: Option<&str>,
        handler_ref: &str,
        handler_params: &str,
        mut spec: TriggerSpec,
    ) -> Result<ScheduledJob> {
        let job_id = job_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = Utc::now();
        let trigger = Trigger::from_spec(&mut spec, now)?;
        let next = trigger
            .next_fire_time(None, now)
            .ok_or_else(|| SchedulerError::TriggerNeverFires { id: job_id.clone() })?;

        let job = ScheduledJob {
            job_id: job_id.clone(),
            handler_ref: handler_ref.to_string(),
            handler_params: handler_params.to_string(),
            trigger: spec,
            next_fire_time: Some(next),
        };

        {
            let mut timers = self.inner.timers.lock().expect("engine timers poisoned");
            if timers.entries.contains_key(&job_id) {
                return Err(SchedulerError::JobAlreadyExists { id: job_id });
            }
            self.inner.timer_store.insert(&job)?;
            timers.insert(job.clone(), trigger);
        }
        self.inner.wake.notify_one();

        info!(
            %job_id,
            handler = %handler_ref,
            kind = %job.trigger.kind,
            next_fire_time = %next,
            "job registered"
        );
        Ok(job)
    }

    /// Deregister. Fires already dispatched still complete.
    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        self.ensure_active()?;
        let removed = self
            .inner
            .timers
            .lock()
            .expect("engine timers poisoned")
            .entries
            .remove(job_id);
        if removed.is_none() {
            return Err(SchedulerError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        self.inner.timer_store.delete(job_id)?;
        info!(%job_id, "job removed");
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<ScheduledJob>> {
        self.ensure_active()?;
        let timers = self.inner.timers.lock().expect("engine timers poisoned");
        Ok(timers.entries.get(job_id).map(|e| e.job.clone()))
    }

    pub fn has_job(&self, job_id: &str) -> Result<bool> {
        self.ensure_active()?;
        let timers = self.inner.timers.lock().expect("engine timers poisoned");
        Ok(timers.entries.contains_key(job_id))
    }

    /// Live jobs, soonest first.
    pub fn get_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.ensure_active()?;
        let timers = self.inner.timers.lock().expect("engine timers poisoned");
        let mut jobs: Vec<ScheduledJob> = timers.entries.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(jobs)
    }

    pub fn get_job_ids(&self) -> Result<Vec<String>> {
        Ok(self.get_jobs()?.into_iter().map(|j| j.job_id).collect())
    }
}

impl Inner {
    fn is_registered(&self, job_id: &str) -> bool {
        self.timers
            .lock()
            .expect("engine timers poisoned")
            .entries
            .contains_key(job_id)
    }

    /// Pop every due job, advance its trigger, persist, and dispatch.
    /// Returns how long to wait for the next one.
    fn dispatch_due(self: &Arc<Self>, now: DateTime<Utc>) -> std::time::Duration {
        let mut fires = Vec::new();
        let wait = {
            let mut timers = self.timers.lock().expect("engine timers poisoned");
            while let Some(Reverse((at, generation, job_id))) = timers.queue.peek().cloned() {
                if at > now {
                    break;
                }
                timers.queue.pop();
                let Some(entry) = timers.entries.get_mut(&job_id) else {
                    continue;
                };
                if entry.generation != generation {
                    continue;
                }

                let next = entry.trigger.next_fire_time(Some(at), now);
                entry.job.next_fire_time = next;
                fires.push(Fire {
                    job: entry.job.clone(),
                    scheduled_at: at,
                    generation,
                    exhausted: next.is_none(),
                });
                match next {
                    Some(next) => timers.queue.push(Reverse((next, generation, job_id))),
                    None => {
                        timers.entries.remove(&job_id);
                    }
                }
            }
            timers
                .queue
                .peek()
                .map(|Reverse((at, _, _))| (*at - now).to_std().unwrap_or_default())
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT)
        };

        for fire in fires {
            let persisted = if fire.exhausted {
                self.timer_store.delete(&fire.job.job_id).map(|_| ())
            } else {
                self.timer_store
                    .update_next_run(&fire.job.job_id, fire.job.next_fire_time)
            };
            if let Err(e) = persisted {
                error!(job_id = %fire.job.job_id, "failed to persist timer state: {e}");
            }
            debug!(
                job_id = %fire.job.job_id,
                scheduled_at = %fire.scheduled_at,
                "dispatching job"
            );
            tokio::spawn(execute(Arc::clone(self), fire));
        }
        wait
    }

    /// Drop a registration if it is still the one identified by `generation`.
    fn unschedule(&self, job_id: &str, generation: u64) {
        let removed = {
            let mut timers = self.timers.lock().expect("engine timers poisoned");
            match timers.entries.get(job_id) {
                Some(e) if e.generation == generation => timers.entries.remove(job_id).is_some(),
                _ => false,
            }
        };
        if removed {
            if let Err(e) = self.timer_store.delete(job_id) {
                error!(%job_id, "failed to delete timer state: {e}");
            }
        }
    }
}

async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = inner.dispatch_due(Utc::now());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = inner.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("scheduler run loop stopping");
                    break;
                }
            }
        }
    }
}

/// Resolve the handler afresh, run it, and report to the listener.
async fn execute(inner: Arc<Inner>, fire: Fire) {
    let job_id = fire.job.job_id.clone();
    let mut event = ExecutionEvent {
        job_id: job_id.clone(),
        scheduled_run_time: fire.scheduled_at,
        retval: None,
        exception: None,
        traceback: None,
        unscheduled: fire.exhausted,
    };

    match inner
        .registry
        .resolve(&fire.job.handler_ref, &fire.job.handler_params)
    {
        Ok(handler) => {
            let ctx = TaskContext {
                job_id: job_id.clone(),
                scheduled_at: fire.scheduled_at,
            };
            // nested task so a panicking handler surfaces as a JoinError
            let run = tokio::spawn(async move { handler.main(&ctx).await });
            match run.await {
                Ok(Ok(retval)) => {
                    debug!(%job_id, "job finished");
                    event.retval = Some(retval);
                }
                Ok(Err(e)) => {
                    warn!(%job_id, "job failed: {e:#}");
                    event.exception = Some(e.to_string());
                    event.traceback = Some(format!("{e:?}"));
                }
                Err(join) => {
                    let message = if join.is_panic() {
                        let payload = join.into_panic();
                        payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "handler panicked".to_string())
                    } else {
                        "handler task was cancelled".to_string()
                    };
                    error!(%job_id, "job panicked: {message}");
                    event.exception = Some(format!("panic: {message}"));
                }
            }
        }
        Err(e) => {
            error!(%job_id, code = e.code(), "handler resolution failed: {e}");
            inner.unschedule(&job_id, fire.generation);
            event.exception = Some(e.to_string());
            event.unscheduled = true;
        }
    }

    if !inner.config.listener {
        return;
    }
    if event.unscheduled {
        let lifecycle = Arc::clone(&inner.lifecycle);
        let _guard = lifecycle.lock().await;
        // registered again while the handler ran: leave the flag alone
        if inner.is_registered(durable_job_id(&event.job_id)) {
            debug!(%job_id, "job re-registered before its last fire was recorded");
            event.unscheduled = false;
        }
        inner.listener.job_executed(event).await;
    } else {
        inner.listener.job_executed(event).await;
    }
}
