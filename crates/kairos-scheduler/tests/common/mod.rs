#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kairos_core::{TaskConfig, TriggerKind};
use kairos_scheduler::{HandlerRegistry, SchedulerEngine, TaskContext, TaskHandler};
use kairos_store::{
    ExecutionRecord, JobRecordStore, NewJobDefinition, Page, RecordFilter, SqliteJobStore,
};
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Echo {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl TaskHandler for Echo {
    async fn main(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        Ok(self.message.clone().unwrap_or_else(|| "echo".to_string()))
    }
}

#[derive(Deserialize)]
pub struct Fail {}

#[async_trait]
impl TaskHandler for Fail {
    async fn main(&self, ctx: &TaskContext) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("upstream unavailable").context(format!("job {} failed", ctx.job_id)))
    }
}

#[derive(Deserialize)]
pub struct Panic {}

#[async_trait]
impl TaskHandler for Panic {
    async fn main(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        panic!("handler exploded");
    }
}

#[derive(Deserialize)]
pub struct Slow {
    #[serde(default)]
    millis: u64,
}

#[async_trait]
impl TaskHandler for Slow {
    async fn main(&self, _ctx: &TaskContext) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok("slow".to_string())
    }
}

pub fn registry() -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    registry.register::<Echo>("pkg.Echo");
    registry.register::<Fail>("pkg.Fail");
    registry.register::<Panic>("pkg.Panic");
    registry.register::<Slow>("pkg.Slow");
    Arc::new(registry)
}

pub fn config(enabled: bool) -> TaskConfig {
    TaskConfig {
        enabled,
        timezone: "UTC".to_string(),
        ..TaskConfig::default()
    }
}

pub fn memory_store() -> Arc<dyn JobRecordStore> {
    Arc::new(SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap())
}

pub fn engine_with(config: TaskConfig, store: &Arc<dyn JobRecordStore>) -> SchedulerEngine {
    SchedulerEngine::new(
        config,
        Connection::open_in_memory().unwrap(),
        registry(),
        Arc::clone(store),
    )
    .unwrap()
}

/// A started engine over in-memory databases.
pub fn running() -> (SchedulerEngine, Arc<dyn JobRecordStore>) {
    let store = memory_store();
    let engine = engine_with(config(true), &store);
    engine.start().unwrap();
    (engine, store)
}

pub fn definition(id: &str, kind: TriggerKind, expression: Option<&str>) -> NewJobDefinition {
    NewJobDefinition {
        id: Some(id.to_string()),
        name: "X".to_string(),
        group: Some("tests".to_string()),
        handler_ref: "pkg.Echo".to_string(),
        handler_params: "{}".to_string(),
        trigger_kind: kind,
        expression: expression.map(String::from),
        is_active: false,
        start_datetime: None,
        end_datetime: None,
        remark: None,
    }
}

pub async fn records(store: &Arc<dyn JobRecordStore>, job_id: &str) -> Vec<ExecutionRecord> {
    let filter = RecordFilter {
        job_id: Some(job_id.to_string()),
        ..RecordFilter::default()
    };
    store.list_records(filter, Page::all()).await.unwrap().0
}

/// Poll until `job_id` has at least `n` records or `timeout` passes.
pub async fn wait_for_records(
    store: &Arc<dyn JobRecordStore>,
    job_id: &str,
    n: usize,
    timeout: Duration,
) -> Vec<ExecutionRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let recs = records(store, job_id).await;
        if recs.len() >= n || tokio::time::Instant::now() >= deadline {
            return recs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
