use rusqlite::Connection;

use crate::error::Result;

/// Internal timer-state table. Application code reads job definitions from
/// `scheduler_task_list` instead.
pub const TIMER_TABLE: &str = "scheduler_task_jobs";

/// Initialise the engine's timer-state schema in `conn`.
///
/// Idempotent. The index keeps rehydration ordered by next fire time.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduler_task_jobs (
            job_id          TEXT    NOT NULL PRIMARY KEY,
            handler_ref     TEXT    NOT NULL,
            handler_params  TEXT    NOT NULL,
            trigger_spec    TEXT    NOT NULL,   -- JSON-encoded TriggerSpec
            next_run        TEXT,               -- RFC 3339 or NULL when exhausted
            created_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_task_jobs_next_run ON scheduler_task_jobs (next_run);
        ",
    )?;
    Ok(())
}
