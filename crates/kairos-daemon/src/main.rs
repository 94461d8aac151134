use std::sync::Arc;

use clap::Parser;
use kairos_core::TriggerKind;
use kairos_scheduler::{HandlerRegistry, SchedulerEngine, TaskService};
use kairos_store::{JobRecordStore, NewJobDefinition, SqliteJobStore};
use tracing::{info, warn};

mod tasks;

/// Kairos daemon - runs scheduled jobs from the task table
#[derive(Parser, Debug)]
#[command(name = "kairos-daemon", version)]
struct Args {
    /// Config file (defaults to ~/.kairos/kairos.toml)
    #[arg(long, env = "KAIROS_CONFIG")]
    config: Option<String>,

    /// Skip re-registering active tasks on start
    #[arg(long)]
    no_restore: bool,

    /// Create a `demo.Echo` interval task firing every N seconds
    #[arg(long, value_name = "SECONDS")]
    demo_every: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kairos_daemon=info,kairos_scheduler=info,kairos_store=info".into()
            }),
        )
        .init();

    let args = Args::parse();

    // load config: --config / KAIROS_CONFIG > ~/.kairos/kairos.toml
    let config = kairos_core::KairosConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        kairos_core::KairosConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = open_db(db_path)?;
    kairos_store::init_db(&db)?;
    kairos_scheduler::db::init_db(&db)?;
    drop(db);
    info!("database migrations complete");

    // the record store and the engine's timer table each get their own connection
    let store: Arc<dyn JobRecordStore> = Arc::new(SqliteJobStore::new(open_db(db_path)?)?);

    let registry = HandlerRegistry::new();
    tasks::register_builtin(&registry);
    info!(handlers = ?registry.keys(), "handlers registered");

    let engine = SchedulerEngine::new(
        config.task.clone(),
        open_db(db_path)?,
        Arc::new(registry),
        Arc::clone(&store),
    )?;
    let service = TaskService::new(engine.clone(), Arc::clone(&store));

    if !config.task.enabled {
        warn!("task subsystem disabled (task.enabled = false); nothing to do");
        return Ok(());
    }
    engine.start()?;

    if config.task.restore && !args.no_restore {
        let report = service.restore_active_jobs().await?;
        info!(?report, "restore finished");
    }

    if let Some(seconds) = args.demo_every {
        let id = service
            .create_task(NewJobDefinition {
                id: None,
                name: "demo echo".to_string(),
                group: Some("demo".to_string()),
                handler_ref: "demo.Echo".to_string(),
                handler_params: serde_json::json!({ "message": "tick" }).to_string(),
                trigger_kind: TriggerKind::Interval,
                expression: Some(format!("{seconds} * * * *")),
                is_active: true,
                start_datetime: None,
                end_datetime: None,
                remark: Some("created by --demo-every".to_string()),
            })
            .await?;
        info!(task_id = %id, seconds, "demo task created");
    }

    info!(jobs = engine.get_job_ids()?.len(), "Kairos daemon running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

fn open_db(path: &str) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
