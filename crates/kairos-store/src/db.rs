use rusqlite::Connection;

use crate::error::Result;

/// Job definitions collection.
pub const TASK_LIST_TABLE: &str = "scheduler_task_list";
/// Execution history collection.
pub const TASK_RECORD_TABLE: &str = "scheduler_task_record";

/// Initialise the job definition and execution record tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS scheduler_task_list (
            id                 TEXT    NOT NULL PRIMARY KEY,
            name               TEXT    NOT NULL,
            task_group         TEXT,
            handler_ref        TEXT    NOT NULL,
            handler_params     TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            trigger_kind       TEXT    NOT NULL,
            expression         TEXT,
            is_active          INTEGER NOT NULL DEFAULT 0,
            start_datetime     TEXT,
            end_datetime       TEXT,
            remark             TEXT,
            last_run_datetime  TEXT,
            create_datetime    TEXT    NOT NULL,
            update_datetime    TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_list_active
            ON scheduler_task_list(is_active);

        -- append-only; job_id is a soft reference (definitions may be deleted)
        CREATE TABLE IF NOT EXISTS scheduler_task_record (
            id              TEXT    NOT NULL PRIMARY KEY,
            job_id          TEXT    NOT NULL,
            start_datetime  TEXT    NOT NULL,
            end_datetime    TEXT    NOT NULL,
            process_time    REAL    NOT NULL,
            retval          TEXT,
            exception       TEXT,
            traceback       TEXT,
            name            TEXT,
            task_group      TEXT,
            handler_ref     TEXT,
            handler_params  TEXT,
            trigger_kind    TEXT,
            expression      TEXT,
            create_datetime TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_record_job
            ON scheduler_task_record(job_id, create_datetime DESC);",
    )?;
    Ok(())
}
