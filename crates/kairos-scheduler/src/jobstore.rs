use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    trigger::TriggerSpec,
    types::ScheduledJob,
};

/// Durable mirror of the engine's live job set.
///
/// Every registered job is written here so a restarted process can rebuild
/// its timers. Statements are single-row and run inline on the caller.
pub struct TimerStore {
    conn: Mutex<Connection>,
}

impl TimerStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist a new job. An existing row with the same id is a duplicate.
    pub fn insert(&self, job: &ScheduledJob) -> Result<()> {
        let trigger = serde_json::to_string(&job.trigger)?;
        let conn = self.conn.lock().expect("timer store poisoned");
        let res = conn.execute(
            "INSERT INTO scheduler_task_jobs
             (job_id, handler_ref, handler_params, trigger_spec, next_run, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            rusqlite::params![
                job.job_id,
                job.handler_ref,
                job.handler_params,
                trigger,
                job.next_fire_time.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(SchedulerError::JobAlreadyExists {
                    id: job.job_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_next_run(&self, job_id: &str, next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().expect("timer store poisoned");
        conn.execute(
            "UPDATE scheduler_task_jobs SET next_run = ?1 WHERE job_id = ?2",
            rusqlite::params![next.map(|t| t.to_rfc3339()), job_id],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, job_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("timer store poisoned");
        let n = conn.execute("DELETE FROM scheduler_task_jobs WHERE job_id = ?1", [job_id])?;
        Ok(n > 0)
    }

    /// Every stored job, soonest first. Rows that no longer decode are skipped.
    pub fn load_all(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn.lock().expect("timer store poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_id, handler_ref, handler_params, trigger_spec, next_run
             FROM scheduler_task_jobs ORDER BY next_run",
        )?;
        let jobs = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,         // job_id
                    row.get::<_, String>(1)?,         // handler_ref
                    row.get::<_, String>(2)?,         // handler_params
                    row.get::<_, String>(3)?,         // trigger JSON
                    row.get::<_, Option<String>>(4)?, // next_run
                ))
            })?
            .filter_map(|r| {
                let (job_id, handler_ref, handler_params, trigger_json, next_run) = r.ok()?;
                let trigger: TriggerSpec = match serde_json::from_str(&trigger_json) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(%job_id, "bad trigger JSON in timer store: {e}");
                        return None;
                    }
                };
                let next_fire_time = next_run
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc));
                Some(ScheduledJob {
                    job_id,
                    handler_ref,
                    handler_params,
                    trigger,
                    next_fire_time,
                })
            })
            .collect::<Vec<_>>();
        debug!(count = jobs.len(), "timer store loaded");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairos_core::TriggerKind;

    fn job(id: &str) -> ScheduledJob {
        ScheduledJob {
            job_id: id.to_string(),
            handler_ref: "demo.Echo".to_string(),
            handler_params: "{}".to_string(),
            trigger: TriggerSpec {
                kind: TriggerKind::Interval,
                expression: Some("5 * * * *".to_string()),
                start: Some(Utc::now()),
                end: None,
                timezone: "UTC".to_string(),
                jitter: None,
            },
            next_fire_time: Some(Utc::now()),
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = TimerStore::new(Connection::open_in_memory().unwrap()).unwrap();
        store.insert(&job("a")).unwrap();
        assert!(matches!(
            store.insert(&job("a")).unwrap_err(),
            SchedulerError::JobAlreadyExists { id } if id == "a"
        ));
    }

    #[test]
    fn round_trips_and_deletes() {
        let store = TimerStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let original = job("a");
        store.insert(&original).unwrap();
        store.update_next_run("a", None).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].trigger, original.trigger);
        assert_eq!(loaded[0].next_fire_time, None);

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }
}
