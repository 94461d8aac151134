use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use kairos_core::TriggerKind;
use rusqlite::{types::Type, Connection, Row, ToSql};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::{init_db, TASK_LIST_TABLE, TASK_RECORD_TABLE};
use crate::error::{Result, StoreError};
use crate::types::{
    ExecutionRecord, JobDefinition, JobPatch, NewExecutionRecord, NewJobDefinition, Page,
    RecordFilter, TaskFilter,
};

/// Async CRUD contract over the two scheduler collections.
///
/// Every call is a single-row read or write (plus a count for listings);
/// callers on the scheduler's hot path may await these freely.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    async fn create_task(&self, def: NewJobDefinition) -> Result<String>;
    async fn get_task(&self, id: &str) -> Result<JobDefinition>;
    async fn update_task(&self, id: &str, patch: JobPatch) -> Result<()>;
    async fn delete_task(&self, id: &str) -> Result<()>;
    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<(Vec<JobDefinition>, u64)>;

    async fn create_record(&self, record: NewExecutionRecord) -> Result<String>;
    async fn get_record(&self, id: &str) -> Result<ExecutionRecord>;
    async fn list_records(
        &self,
        filter: RecordFilter,
        page: Page,
    ) -> Result<(Vec<ExecutionRecord>, u64)>;
}

const TASK_COLUMNS: &str = "id, name, task_group, handler_ref, handler_params, trigger_kind,
    expression, is_active, start_datetime, end_datetime, remark, last_run_datetime,
    create_datetime, update_datetime";

const RECORD_COLUMNS: &str = "id, job_id, start_datetime, end_datetime, process_time, retval,
    exception, traceback, name, task_group, handler_ref, handler_params, trigger_kind,
    expression, create_datetime";

/// SQLite implementation of [`JobRecordStore`].
///
/// Wraps one connection in a `Mutex`; each statement runs on Tokio's blocking
/// pool so async callers never stall a runtime worker on disk I/O.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Wrap `conn`, creating the tables if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

fn check_id(id: &str) -> Result<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(id.to_string())
}

#[async_trait]
impl JobRecordStore for SqliteJobStore {
    #[instrument(skip(self, def), fields(name = %def.name))]
    async fn create_task(&self, def: NewJobDefinition) -> Result<String> {
        let id = match def.id.as_deref() {
            Some(id) => check_id(id)?,
            None => Uuid::now_v7().to_string(),
        };
        let now = Utc::now().to_rfc3339();
        let row_id = id.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO scheduler_task_list
                 (id, name, task_group, handler_ref, handler_params, trigger_kind, expression,
                  is_active, start_datetime, end_datetime, remark, last_run_datetime,
                  create_datetime, update_datetime)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,NULL,?12,?12)",
                rusqlite::params![
                    row_id,
                    def.name,
                    def.group,
                    def.handler_ref,
                    def.handler_params,
                    def.trigger_kind.to_string(),
                    def.expression,
                    def.is_active,
                    def.start_datetime.map(|d| d.to_rfc3339()),
                    def.end_datetime.map(|d| d.to_rfc3339()),
                    def.remark,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;
        debug!(task_id = %id, "job definition created");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_task(&self, id: &str) -> Result<JobDefinition> {
        let id = check_id(id)?;
        self.call(move |conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM scheduler_task_list WHERE id = ?1");
            match conn.query_row(&sql, [&id], row_to_task) {
                Ok(def) => Ok(def),
                Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound {
                    collection: TASK_LIST_TABLE,
                    id,
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    #[instrument(skip(self, patch))]
    async fn update_task(&self, id: &str, patch: JobPatch) -> Result<()> {
        let id = check_id(id)?;
        self.call(move |conn| {
            let mut sets: Vec<&str> = Vec::new();
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            let mut set = |column: &'static str, value: Box<dyn ToSql>| {
                sets.push(column);
                params.push(value);
            };

            if let Some(v) = patch.name {
                set("name", Box::new(v));
            }
            if let Some(v) = patch.group {
                set("task_group", Box::new(v));
            }
            if let Some(v) = patch.handler_ref {
                set("handler_ref", Box::new(v));
            }
            if let Some(v) = patch.handler_params {
                set("handler_params", Box::new(v));
            }
            if let Some(v) = patch.trigger_kind {
                set("trigger_kind", Box::new(v.to_string()));
            }
            if let Some(v) = patch.expression {
                set("expression", Box::new(v));
            }
            if let Some(v) = patch.is_active {
                set("is_active", Box::new(v));
            }
            if let Some(v) = patch.start_datetime {
                set("start_datetime", Box::new(v.to_rfc3339()));
            }
            if let Some(v) = patch.end_datetime {
                set("end_datetime", Box::new(v.to_rfc3339()));
            }
            if let Some(v) = patch.remark {
                set("remark", Box::new(v));
            }
            if let Some(v) = patch.last_run_datetime {
                set("last_run_datetime", Box::new(v.to_rfc3339()));
            }
            set("update_datetime", Box::new(Utc::now().to_rfc3339()));

            let assignments: Vec<String> = sets
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{column} = ?{}", i + 1))
                .collect();
            let sql = format!(
                "UPDATE scheduler_task_list SET {} WHERE id = ?{}",
                assignments.join(", "),
                params.len() + 1
            );
            params.push(Box::new(id.clone()));

            let n = conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    collection: TASK_LIST_TABLE,
                    id,
                });
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_task(&self, id: &str) -> Result<()> {
        let id = check_id(id)?;
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM scheduler_task_list WHERE id = ?1", [&id])?;
            if n == 0 {
                return Err(StoreError::NotFound {
                    collection: TASK_LIST_TABLE,
                    id,
                });
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<(Vec<JobDefinition>, u64)> {
        self.call(move |conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(name) = filter.name {
                params.push(Box::new(format!("%{name}%")));
                clauses.push(format!("name LIKE ?{}", params.len()));
            }
            if let Some(group) = filter.group {
                params.push(Box::new(group));
                clauses.push(format!("task_group = ?{}", params.len()));
            }
            if let Some(kind) = filter.trigger_kind {
                params.push(Box::new(kind.to_string()));
                clauses.push(format!("trigger_kind = ?{}", params.len()));
            }
            if let Some(active) = filter.is_active {
                params.push(Box::new(active));
                clauses.push(format!("is_active = ?{}", params.len()));
            }
            let where_sql = where_clause(&clauses);

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM scheduler_task_list{where_sql}"),
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM scheduler_task_list{where_sql}
                 ORDER BY create_datetime DESC, id DESC
                 LIMIT ?{} OFFSET ?{}",
                params.len() + 1,
                params.len() + 2
            );
            params.push(Box::new(page.limit as i64));
            params.push(Box::new(page.offset()));

            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((items, total as u64))
        })
        .await
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id))]
    async fn create_record(&self, record: NewExecutionRecord) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let row_id = id.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO scheduler_task_record
                 (id, job_id, start_datetime, end_datetime, process_time, retval, exception,
                  traceback, name, task_group, handler_ref, handler_params, trigger_kind,
                  expression, create_datetime)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                rusqlite::params![
                    row_id,
                    record.job_id,
                    record.start_datetime.to_rfc3339(),
                    record.end_datetime.to_rfc3339(),
                    record.process_time,
                    record.retval,
                    record.exception,
                    record.traceback,
                    record.name,
                    record.group,
                    record.handler_ref,
                    record.handler_params,
                    record.trigger_kind.map(|k| k.to_string()),
                    record.expression,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_record(&self, id: &str) -> Result<ExecutionRecord> {
        let id = check_id(id)?;
        self.call(move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM scheduler_task_record WHERE id = ?1");
            match conn.query_row(&sql, [&id], row_to_record) {
                Ok(record) => Ok(record),
                Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound {
                    collection: TASK_RECORD_TABLE,
                    id,
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_records(
        &self,
        filter: RecordFilter,
        page: Page,
    ) -> Result<(Vec<ExecutionRecord>, u64)> {
        self.call(move |conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut params: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(job_id) = filter.job_id {
                params.push(Box::new(job_id));
                clauses.push(format!("job_id = ?{}", params.len()));
            }
            if let Some(name) = filter.name {
                params.push(Box::new(format!("%{name}%")));
                clauses.push(format!("name LIKE ?{}", params.len()));
            }
            let where_sql = where_clause(&clauses);

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM scheduler_task_record{where_sql}"),
                rusqlite::params_from_iter(params.iter()),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM scheduler_task_record{where_sql}
                 ORDER BY create_datetime DESC, id DESC
                 LIMIT ?{} OFFSET ?{}",
                params.len() + 1,
                params.len() + 2
            );
            params.push(Box::new(page.limit as i64));
            params.push(Box::new(page.offset()));

            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((items, total as u64))
        })
        .await
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn fixed_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<FixedOffset>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw).map_err(|e| conversion_error(idx, e))
}

fn utc_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    fixed_col(row, idx).map(|d| d.with_timezone(&Utc))
}

fn opt_utc_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn kind_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<TriggerKind>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw
            .parse::<TriggerKind>()
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

/// Map a SQLite row to a `JobDefinition`.
fn row_to_task(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    let trigger_kind = kind_col(row, 5)?
        .ok_or_else(|| conversion_error(5, "trigger_kind is NULL"))?;
    Ok(JobDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        group: row.get(2)?,
        handler_ref: row.get(3)?,
        handler_params: row.get(4)?,
        trigger_kind,
        expression: row.get(6)?,
        is_active: row.get(7)?,
        start_datetime: opt_utc_col(row, 8)?,
        end_datetime: opt_utc_col(row, 9)?,
        remark: row.get(10)?,
        last_run_datetime: opt_utc_col(row, 11)?,
        create_datetime: utc_col(row, 12)?,
        update_datetime: utc_col(row, 13)?,
    })
}

/// Map a SQLite row to an `ExecutionRecord`.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        start_datetime: fixed_col(row, 2)?,
        end_datetime: fixed_col(row, 3)?,
        process_time: row.get(4)?,
        retval: row.get(5)?,
        exception: row.get(6)?,
        traceback: row.get(7)?,
        name: row.get(8)?,
        group: row.get(9)?,
        handler_ref: row.get(10)?,
        handler_params: row.get(11)?,
        trigger_kind: kind_col(row, 12)?,
        expression: row.get(13)?,
        create_datetime: utc_col(row, 14)?,
    })
}
