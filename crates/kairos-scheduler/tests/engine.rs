// End-to-end behaviour of the scheduler engine against in-memory SQLite.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::*;
use kairos_core::TriggerKind;
use kairos_scheduler::{
    AddTaskRequest, EngineState, SchedulerEngine, SchedulerError, TriggerOptions,
};
use kairos_store::JobRecordStore;
use rusqlite::Connection;

fn not_active<T>(res: Result<T, SchedulerError>) -> bool {
    matches!(res, Err(SchedulerError::EngineNotActive(_)))
}

fn request(id: &str, handler_ref: &str, kind: TriggerKind, expression: Option<&str>) -> AddTaskRequest {
    AddTaskRequest {
        task_id: id.to_string(),
        group: None,
        handler_ref: handler_ref.to_string(),
        handler_params: "{}".to_string(),
        trigger_kind: kind,
        expression: expression.map(String::from),
        remark: None,
        start_datetime: None,
        end_datetime: None,
    }
}

#[tokio::test]
async fn guard_runs_before_argument_validation() {
    let store = memory_store();
    let engine = engine_with(config(true), &store);
    assert_eq!(engine.state(), EngineState::Stopped);

    // every argument below is invalid, the guard must still win
    assert!(not_active(engine.add_interval_job("", "nope", "1 2", TriggerOptions::default(), None)));
    assert!(not_active(engine.add_cron_job("", "nope", "bad", TriggerOptions::default(), None)));
    assert!(not_active(engine.add_date_job("", "nope", "yesterday", None)));
    assert!(not_active(engine.run_job("", "nope", None)));
    assert!(not_active(engine.remove_job("")));
    assert!(not_active(engine.get_job("")));
    assert!(not_active(engine.has_job("")));
    assert!(not_active(engine.get_jobs()));
    assert!(not_active(engine.get_job_ids()));
    let bad = request("", "", TriggerKind::Interval, Some("1"));
    assert!(not_active(engine.add_job(&bad).await));
}

#[tokio::test]
async fn disabled_subsystem_refuses_everything() {
    let store = memory_store();
    let engine = engine_with(config(false), &store);
    assert!(not_active(engine.start()));
    assert!(not_active(engine.has_job("j1")));
}

#[tokio::test]
async fn shutdown_is_terminal() {
    let store = memory_store();
    let engine = engine_with(config(true), &store);

    // never started: no-op
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);

    engine.start().unwrap();
    assert_eq!(engine.state(), EngineState::Running);
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::ShutDown);
    engine.shutdown().await;

    assert!(matches!(engine.start(), Err(SchedulerError::EngineShutDown)));
    assert!(not_active(engine.get_jobs()));
}

#[tokio::test]
async fn remove_unknown_job_is_recoverable() {
    let (engine, _store) = running();
    for _ in 0..2 {
        assert!(matches!(
            engine.remove_job("ghost"),
            Err(SchedulerError::JobNotFound { id }) if id == "ghost"
        ));
    }

    engine
        .add_interval_job("pkg.Echo", "{}", "* * 1 * *", TriggerOptions::default(), Some("j1"))
        .unwrap();
    engine.remove_job("j1").unwrap();
    assert!(!engine.has_job("j1").unwrap());
    for _ in 0..2 {
        assert!(matches!(engine.remove_job("j1"), Err(SchedulerError::JobNotFound { .. })));
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn queries_reflect_live_jobs() {
    let (engine, _store) = running();
    engine
        .add_cron_job("pkg.Echo", "{}", "0 0 3 1 1 *", TriggerOptions::default(), Some("yearly"))
        .unwrap();
    engine
        .add_interval_job("pkg.Echo", "{}", "* 5 * * *", TriggerOptions::default(), Some("often"))
        .unwrap();

    assert_eq!(engine.get_job_ids().unwrap(), vec!["often", "yearly"]);
    let job = engine.get_job("yearly").unwrap().unwrap();
    assert_eq!(job.trigger.kind, TriggerKind::Cron);
    assert_eq!(job.trigger.timezone, "UTC");
    assert!(job.next_fire_time.unwrap() > Utc::now());
    assert!(engine.get_job("missing").unwrap().is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn validation_errors_are_synchronous() {
    let (engine, store) = running();
    let err = engine
        .add_interval_job("pkg.Echo", "{}", "10 * * *", TriggerOptions::default(), Some("j1"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidIntervalExpression { .. }));

    let err = engine
        .add_cron_job("pkg.Echo", "{}", "0 0", TriggerOptions::default(), Some("j1"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCronExpression { .. }));

    store
        .create_task(definition("j1", TriggerKind::Interval, Some("10 x * * *")))
        .await
        .unwrap();
    let err = engine
        .add_job(&request("j1", "pkg.Echo", TriggerKind::Interval, Some("10 x * * *")))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidIntervalField { field: "minutes", .. }));
    assert!(records(&store, "j1").await.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn interval_job_records_one_run() {
    let (engine, store) = running();
    let mut def = definition("j1", TriggerKind::Interval, Some("5 * * * *"));
    def.is_active = true;
    store.create_task(def).await.unwrap();

    engine
        .add_interval_job("pkg.Echo", "{}", "5 * * * *", TriggerOptions::default(), Some("j1"))
        .unwrap();
    assert!(engine.has_job("j1").unwrap());

    tokio::time::sleep(Duration::from_millis(6_500)).await;

    let recs = records(&store, "j1").await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].retval.as_deref(), Some("echo"));
    assert!(recs[0].exception.is_none());
    assert_eq!(recs[0].name.as_deref(), Some("X"));
    assert!(store.get_task("j1").await.unwrap().last_run_datetime.is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn unresolvable_handler_does_not_disturb_other_jobs() {
    let (engine, store) = running();
    engine
        .add_interval_job("pkg.Echo", "{}", "1 * * * *", TriggerOptions::default(), Some("good"))
        .unwrap();
    engine
        .add_interval_job("missing.Handler", "{}", "1 * * * *", TriggerOptions::default(), Some("bad"))
        .unwrap();
    let good_next = engine.get_job("good").unwrap().unwrap().next_fire_time;

    wait_for_records(&store, "bad", 1, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let bad = records(&store, "bad").await;
    assert_eq!(bad.len(), 1);
    assert!(bad[0].retval.is_none());
    assert!(bad[0]
        .exception
        .as_deref()
        .unwrap()
        .starts_with("handler module not found: missing"));
    assert!(!engine.has_job("bad").unwrap());

    assert!(engine.has_job("good").unwrap());
    assert!(engine.get_job("good").unwrap().unwrap().next_fire_time > good_next);
    assert!(!records(&store, "good").await.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn deleted_definition_still_produces_record() {
    let (engine, store) = running();
    store
        .create_task(definition("x1", TriggerKind::Interval, Some("1 * * * *")))
        .await
        .unwrap();
    engine
        .add_interval_job("pkg.Echo", "{}", "1 * * * *", TriggerOptions::default(), Some("x1"))
        .unwrap();
    store.delete_task("x1").await.unwrap();

    let recs = wait_for_records(&store, "x1", 1, Duration::from_secs(5)).await;
    assert_eq!(recs.len(), 1);
    assert!(recs[0].name.is_none());
    assert_eq!(recs[0].retval.as_deref(), Some("echo"));
    assert!(recs[0].exception.as_deref().unwrap().contains("not found"));
    engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_registration_goes_to_failure_path() {
    let (engine, store) = running();
    let mut def = definition("j1", TriggerKind::Interval, Some("* * 1 * *"));
    def.is_active = true;
    store.create_task(def).await.unwrap();

    let req = request("j1", "pkg.Echo", TriggerKind::Interval, Some("* * 1 * *"));
    assert!(engine.add_job(&req).await.unwrap().is_some());
    assert!(engine.add_job(&req).await.unwrap().is_none());

    assert!(engine.has_job("j1").unwrap());
    assert!(!store.get_task("j1").await.unwrap().is_active);
    let recs = records(&store, "j1").await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].process_time, 0.0);
    assert!(recs[0].exception.as_deref().unwrap().contains("already exists"));
    engine.shutdown().await;
}

#[tokio::test]
async fn unknown_handler_in_request_is_recorded() {
    let (engine, store) = running();
    let mut def = definition("j2", TriggerKind::Cron, Some("0 0 3 * * *"));
    def.is_active = true;
    store.create_task(def).await.unwrap();

    let req = request("j2", "pkg.Missing", TriggerKind::Cron, Some("0 0 3 * * *"));
    assert!(engine.add_job(&req).await.unwrap().is_none());
    assert!(!engine.has_job("j2").unwrap());

    let recs = records(&store, "j2").await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].exception.as_deref(), Some("handler class not found: Missing"));
    assert!(!store.get_task("j2").await.unwrap().is_active);
    engine.shutdown().await;
}

#[tokio::test]
async fn failing_handler_keeps_firing() {
    let (engine, store) = running();
    store
        .create_task(definition("flaky", TriggerKind::Interval, Some("1 * * * *")))
        .await
        .unwrap();
    engine
        .add_interval_job("pkg.Fail", "{}", "1 * * * *", TriggerOptions::default(), Some("flaky"))
        .unwrap();

    let recs = wait_for_records(&store, "flaky", 2, Duration::from_secs(5)).await;
    assert!(recs.len() >= 2);
    for rec in &recs {
        assert!(rec.retval.is_none());
        assert_eq!(rec.exception.as_deref(), Some("job flaky failed"));
        assert!(rec.traceback.as_deref().unwrap().contains("upstream unavailable"));
    }
    assert!(engine.has_job("flaky").unwrap());
    engine.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_is_recorded() {
    let (engine, store) = running();
    store
        .create_task(definition("p1", TriggerKind::Once, None))
        .await
        .unwrap();
    engine.run_job("pkg.Panic", "{}", Some("p1")).unwrap();

    let recs = wait_for_records(&store, "p1", 1, Duration::from_secs(5)).await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].exception.as_deref(), Some("panic: handler exploded"));
    assert_eq!(engine.state(), EngineState::Running);
    engine.shutdown().await;
}

#[tokio::test]
async fn run_job_fires_immediately_under_temp_id() {
    let (engine, store) = running();
    let mut def = definition("r1", TriggerKind::Cron, Some("0 0 3 * * *"));
    def.is_active = true;
    store.create_task(def).await.unwrap();
    engine
        .add_cron_job("pkg.Echo", "{}", "0 0 3 * * *", TriggerOptions::default(), Some("r1"))
        .unwrap();

    let job = engine.run_job("pkg.Echo", r#"{"message":"now"}"#, Some("r1")).unwrap();
    assert!(job.job_id.starts_with("r1-temp-"));

    let recs = wait_for_records(&store, "r1", 1, Duration::from_secs(3)).await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].retval.as_deref(), Some("now"));
    assert!(!engine.has_job(&job.job_id).unwrap());
    // the recurring registration is untouched
    assert!(engine.has_job("r1").unwrap());
    assert!(store.get_task("r1").await.unwrap().is_active);
    engine.shutdown().await;
}

#[tokio::test]
async fn past_date_job_fires_once_and_deactivates() {
    let (engine, store) = running();
    let mut def = definition("d1", TriggerKind::Date, Some("2020-01-01 00:00:00"));
    def.is_active = true;
    store.create_task(def).await.unwrap();

    let req = request("d1", "pkg.Echo", TriggerKind::Date, Some("2020-01-01 00:00:00"));
    assert!(engine.add_job(&req).await.unwrap().is_some());

    let recs = wait_for_records(&store, "d1", 1, Duration::from_secs(3)).await;
    assert_eq!(recs.len(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!engine.has_job("d1").unwrap());
    assert!(!store.get_task("d1").await.unwrap().is_active);
    engine.shutdown().await;
}

#[tokio::test]
async fn end_before_start_never_fires() {
    let (engine, _store) = running();
    let now = Utc::now();
    let options = TriggerOptions {
        start: Some(now + chrono::Duration::hours(2)),
        end: Some(now + chrono::Duration::hours(1)),
        ..TriggerOptions::default()
    };
    let err = engine
        .add_cron_job("pkg.Echo", "{}", "0 0 * * * *", options, Some("never"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::TriggerNeverFires { .. }));
    assert!(!engine.has_job("never").unwrap());
    engine.shutdown().await;
}

#[tokio::test]
async fn jobs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timers.db");
    let store = memory_store();

    let first = SchedulerEngine::new(
        config(true),
        Connection::open(&path).unwrap(),
        registry(),
        Arc::clone(&store),
    )
    .unwrap();
    first.start().unwrap();
    let kept = first
        .add_interval_job("pkg.Echo", "{}", "* * 1 * *", TriggerOptions::default(), Some("keep"))
        .unwrap();
    first
        .add_interval_job("pkg.Echo", "{}", "1 * * * *", TriggerOptions::default(), Some("tick"))
        .unwrap();
    // stop before "tick" is due, then stay down past several of its fires
    first.shutdown().await;
    tokio::time::sleep(Duration::from_millis(3_200)).await;

    let second = SchedulerEngine::new(
        config(true),
        Connection::open(&path).unwrap(),
        registry(),
        Arc::clone(&store),
    )
    .unwrap();
    second.start().unwrap();

    let restored = second.get_job("keep").unwrap().unwrap();
    assert_eq!(restored.next_fire_time, kept.next_fire_time);
    assert_eq!(restored.trigger, kept.trigger);

    // missed fires collapse into a single catch-up run
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(records(&store, "tick").await.len(), 1);
    assert!(second.get_job("tick").unwrap().unwrap().next_fire_time.unwrap() > Utc::now());
    second.shutdown().await;
}

#[tokio::test]
async fn reregistration_during_last_fire_keeps_flag() {
    let (engine, store) = running();
    let params = r#"{"millis": 400}"#;
    let mut def = definition("d2", TriggerKind::Date, Some("2020-01-01 00:00:00"));
    def.handler_ref = "pkg.Slow".to_string();
    def.handler_params = params.to_string();
    def.is_active = true;
    store.create_task(def).await.unwrap();

    let mut req = request("d2", "pkg.Slow", TriggerKind::Date, Some("2020-01-01 00:00:00"));
    req.handler_params = params.to_string();
    assert!(engine.add_job(&req).await.unwrap().is_some());

    // the only fire is in flight; register the id again before it finishes
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!engine.has_job("d2").unwrap());
    engine
        .add_cron_job("pkg.Echo", "{}", "0 0 3 1 1 *", TriggerOptions::default(), Some("d2"))
        .unwrap();

    let recs = wait_for_records(&store, "d2", 1, Duration::from_secs(3)).await;
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].retval.as_deref(), Some("slow"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.has_job("d2").unwrap());
    assert!(store.get_task("d2").await.unwrap().is_active);
    engine.shutdown().await;
}

#[tokio::test]
async fn all_wildcard_cron_fires_each_second() {
    let (engine, store) = running();
    engine
        .add_cron_job("pkg.Echo", "{}", "* * * * * *", TriggerOptions::default(), Some("w1"))
        .unwrap();
    let next = engine.get_job("w1").unwrap().unwrap().next_fire_time.unwrap();
    assert!(next <= Utc::now() + chrono::Duration::seconds(1));

    let recs = wait_for_records(&store, "w1", 2, Duration::from_secs(4)).await;
    assert!(recs.len() >= 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn oversized_interval_is_a_validation_error() {
    let (engine, _store) = running();
    let err = engine
        .add_interval_job("pkg.Echo", "{}", "* * * * 100000000", TriggerOptions::default(), Some("huge"))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidIntervalExpression { .. }));
    assert!(err.is_validation());
    assert!(!engine.has_job("huge").unwrap());
    engine.shutdown().await;
}
