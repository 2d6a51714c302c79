//! SQLite store + HTTP data source against a stubbed platform API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clubsync_core::clock::ManualClock;
use clubsync_core::config::{ClubSyncConfig, SourceConfig};
use clubsync_core::task::{CollectionSettings, EntityId, ExecutionStatus, ScheduleWindow, Task};
use clubsync_core::traits::TaskStore;
use clubsync_scheduler::{JobJournal, JobOrigin, SchedulerDb, SchedulerService};
use clubsync_source::HttpDataSource;

async fn platform() -> MockServer {
    let server = MockServer::start().await;
    let clubs = [("team-alpha", "Team Alpha", 3), ("team-bravo", "Team Bravo", 2)];
    for (slug, name, members) in clubs {
        Mock::given(method("GET"))
            .and(path(format!("/club/{slug}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": name })))
            .mount(&server)
            .await;
        let roster: Vec<_> = (0..members)
            .map(|i| json!({ "username": format!("{slug}-{i}") }))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/club/{slug}/members")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "all_time": roster })))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/club/team-down/members"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/club/team-down"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "Team Down" })))
        .mount(&server)
        .await;
    server
}

fn config(server: &MockServer, db: &std::path::Path) -> ClubSyncConfig {
    let mut source = SourceConfig::new(&server.uri());
    source.lookup_path = "/club/{name}".into();
    source.items_path = "/club/{key}/{task_type}".into();
    source.min_interval_ms = 0;
    source.timeout_secs = 5;
    source.items_pointers.insert("members".into(), "/all_time".into());

    let mut config = ClubSyncConfig::default();
    config.sources = BTreeMap::from([("chesscom".to_string(), source)]);
    config.storage.db_path = db.display().to_string();
    config
}

fn service(
    config: &ClubSyncConfig,
    db: Arc<SchedulerDb>,
    clock: Arc<ManualClock>,
) -> SchedulerService {
    SchedulerService::new(
        config,
        db.clone(),
        db.clone(),
        Arc::new(HttpDataSource::from_config(config)),
        db,
        clock,
    )
}

fn task(targets: &[&str]) -> Task {
    let mut settings = CollectionSettings::new("chesscom", "members");
    settings.retry_attempts = 0;
    Task::new(
        "nightly-members",
        "owner-1",
        ScheduleWindow::new(20, 23, &[2, 3], "EST"),
        settings,
    )
    .with_targets(targets.iter().copied())
}

#[tokio::test]
async fn scheduled_run_collects_persists_and_pre_schedules() {
    let server = platform().await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("clubsync.db");
    let config = config(&server, &db_path);
    let db = Arc::new(SchedulerDb::open(&config.storage.resolved_db_path()).unwrap());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()));
    let svc = service(&config, db.clone(), clock.clone());

    let alpha = svc.register_entity("team-alpha", "chesscom").await.unwrap();
    assert_eq!(alpha.name, "Team Alpha");
    svc.register_entity("team-bravo", "chesscom").await.unwrap();
    assert!(svc.register_entity("team-ghost", "chesscom").await.is_err());

    let created = svc
        .create_task(task(&["team-alpha", "unknown-club", "team-bravo"]))
        .await
        .unwrap();
    clock.set(created.next_run.unwrap() + chrono::Duration::seconds(10));

    assert_eq!(svc.trigger().tick().await, Some(1));

    let mut history = Vec::new();
    for _ in 0..200 {
        history = svc.history(&created.id, 10).await.unwrap();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status(), ExecutionStatus::Success);
    assert_eq!(history[0].items_collected, 5);
    assert_eq!(history[0].entities_processed, 2);

    // The follow-up job is journaled, so it survives a restart.
    let mut pending = Vec::new();
    for _ in 0..200 {
        pending = db.pending_jobs().await.unwrap();
        if pending.iter().any(|j| j.origin == JobOrigin::SelfScheduled) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task_id, created.id);
    svc.shutdown();

    let reopened = SchedulerDb::open(&db_path).unwrap();
    let saved = reopened.get_task(&created.id).await.unwrap().unwrap();
    assert_eq!(pending[0].run_at, saved.next_run.unwrap());
    assert_eq!(reopened.pending_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn upstream_failure_mid_run_is_partial_in_history() {
    let server = platform().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config(&server, &dir.path().join("clubsync.db"));
    let db = Arc::new(SchedulerDb::open(&config.storage.resolved_db_path()).unwrap());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()));
    let svc = service(&config, db, clock);

    for club in ["team-alpha", "team-down", "team-bravo"] {
        svc.register_entity(club, "chesscom").await.unwrap();
    }
    let created = svc
        .create_task(task(&["team-alpha", "team-down", "team-bravo"]))
        .await
        .unwrap();

    let record = svc.run_now(&created.id).await.unwrap();
    assert_eq!(record.status(), ExecutionStatus::Partial);
    assert_eq!(record.items_collected, 3);
    assert_eq!(record.entities_processed, 2);
    assert!(record.error().unwrap().contains("500"));

    let history = svc.history(&created.id, 5).await.unwrap();
    assert_eq!(history, vec![record]);

    let updated = svc
        .update_targets(&created.id, vec![EntityId::new("team-bravo")])
        .await
        .unwrap();
    assert_eq!(updated.targets.len(), 1);
    let record = svc.run_now(&created.id).await.unwrap();
    assert_eq!(record.status(), ExecutionStatus::Success);
    assert_eq!(svc.history(&created.id, 5).await.unwrap().len(), 2);
}
