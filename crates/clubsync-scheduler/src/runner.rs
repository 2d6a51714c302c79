//! Task runner: one collection run of a task.
//!
//! Entities are processed strictly in list order, one fetch at a time. The
//! first fetch that still fails after its retries aborts the rest of the run;
//! the failure is recorded in history, never rethrown. A run that outlives
//! its time budget is recorded the same way, with the counts reached so far.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use clubsync_core::clock::Clock;
use clubsync_core::config::RunnerConfig;
use clubsync_core::error::{ClubSyncError, Result};
use clubsync_core::task::{EntityId, ExecutionRecord, Outcome, TaskId};
use clubsync_core::traits::{DataSource, EntityRegistry, TaskStore};

use crate::next_run::next_run;
use crate::retry::{RetryPolicy, retry_with};

/// In-process single-flight lease; released on drop.
struct Lease {
    held: Arc<Mutex<HashSet<TaskId>>>,
    task_id: TaskId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn EntityRegistry>,
    source: Arc<dyn DataSource>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    leases: Arc<Mutex<HashSet<TaskId>>>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn EntityRegistry>,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            source,
            clock,
            config,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a run of `task_id` is in progress in this process.
    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task_id)
    }

    fn acquire(&self, task_id: TaskId) -> Result<Lease> {
        let mut held = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(task_id) {
            return Err(ClubSyncError::AlreadyRunning(task_id.to_string()));
        }
        Ok(Lease {
            held: Arc::clone(&self.leases),
            task_id,
        })
    }

    /// Run `task_id` once.
    ///
    /// Returns `Ok(None)` without touching history when the task is missing
    /// or inactive. Fails with `AlreadyRunning` if another run holds the lease.
    pub async fn run(&self, task_id: TaskId) -> Result<Option<ExecutionRecord>> {
        let _lease = self.acquire(task_id)?;

        let Some(task) = self.store.get_task(&task_id).await? else {
            tracing::debug!("⏭️ Task {task_id} no longer exists, nothing to run");
            return Ok(None);
        };
        if !task.active {
            tracing::debug!("⏭️ Task '{}' is stopped, nothing to run", task.name);
            return Ok(None);
        }

        tracing::info!(
            "▶️ Running task '{}' ({} targets, {}/{})",
            task.name,
            task.targets.len(),
            task.settings.platform,
            task.settings.task_type
        );

        let started = tokio::time::Instant::now();
        let budget = Duration::from_secs(self.config.run_timeout_secs.max(1));
        let policy = RetryPolicy::from_settings(&task.settings);
        let mut collected: u64 = 0;
        let mut processed: u64 = 0;
        let mut fetched_ok = 0usize;
        let mut current: Option<&EntityId> = None;
        let mut failure: Option<String> = None;

        let entities = tokio::time::timeout(budget, async {
            for entity_id in &task.targets {
                let Some(entity) = self.registry.get_entity(entity_id).await? else {
                    tracing::debug!("⏭️ Entity '{entity_id}' not registered, skipping");
                    continue;
                };
                processed += 1;
                current = Some(entity_id);

                let label = format!("Fetch {} for '{}'", entity.id, task.name);
                let result = retry_with(
                    &policy,
                    &label,
                    |e: &ClubSyncError| e.is_external(),
                    |_| {
                        self.source.fetch_items(
                            &entity.external_key,
                            &task.settings.platform,
                            &task.settings.task_type,
                        )
                    },
                )
                .await;

                match result {
                    Ok(items) => {
                        collected += items.len() as u64;
                        fetched_ok += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Task '{}' aborted at entity '{}': {e}",
                            task.name,
                            entity.id
                        );
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            Ok::<(), ClubSyncError>(())
        })
        .await;

        match entities {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let at = current.map(EntityId::as_str).unwrap_or("-");
                let error = format!(
                    "{} while fetching entity '{at}'",
                    ClubSyncError::Timeout(budget.as_secs())
                );
                tracing::warn!("⏱️ Task '{}' ran out of time: {error}", task.name);
                failure = Some(error);
            }
        }

        let outcome = match failure {
            None => Outcome::Success,
            Some(error) if fetched_ok > 0 && self.config.partial_on_prior_success => {
                Outcome::Partial { error }
            }
            Some(error) => Outcome::Error { error },
        };

        let now = self.clock.now();
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            task_id,
            timestamp: now,
            outcome,
            items_collected: collected,
            entities_processed: processed,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match self.store.append_execution(&record).await {
            Ok(()) => {}
            Err(ClubSyncError::NotFound { .. }) => {
                tracing::info!("🗑️ Task '{}' was deleted during its run", task.name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        // The schedule or active flag may have changed while we were fetching.
        let next = self
            .store
            .get_task(&task_id)
            .await?
            .filter(|t| t.active)
            .map(|t| next_run(now, &t.window));
        self.store.complete_run(&task_id, now, next).await?;

        tracing::info!(
            "✅ Task '{}' finished: {} ({} items from {} entities in {}ms)",
            task.name,
            record.status(),
            record.items_collected,
            record.entities_processed,
            record.duration_ms
        );
        if let Some(next) = next {
            tracing::debug!(
                "📅 Task '{}' next run at {} ({} from now)",
                task.name,
                next,
                humanize(next - now)
            );
        }

        Ok(Some(record))
    }
}

fn humanize(d: chrono::Duration) -> String {
    let minutes = d.num_minutes().max(0);
    if minutes >= 60 * 24 {
        format!("{}d{}h", minutes / (60 * 24), (minutes / 60) % 24)
    } else if minutes >= 60 {
        format!("{}h{}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use clubsync_core::clock::ManualClock;
    use clubsync_core::task::{
        CollectionSettings, Entity, EntityId, ExecutionStatus, ScheduleWindow, Task,
    };
    use clubsync_core::traits::EntityDescriptor;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Notify;

    use crate::store::MemoryStore;

    /// Returns `items[key]` items per entity; keys in `failing` always fail.
    #[derive(Default)]
    struct ScriptedSource {
        items: HashMap<String, usize>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn lookup(&self, _name: &str, _platform: &str) -> Result<Option<EntityDescriptor>> {
            Ok(None)
        }

        async fn fetch_items(
            &self,
            key: &str,
            platform: &str,
            _task_type: &str,
        ) -> Result<Vec<Value>> {
            self.calls.lock().unwrap().push(key.to_string());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.failing.contains(key) {
                return Err(ClubSyncError::ExternalFetch {
                    platform: platform.to_string(),
                    message: format!("HTTP 503 for {key}"),
                });
            }
            let n = self.items.get(key).copied().unwrap_or(0);
            Ok((0..n).map(|i| json!({ "n": i })).collect())
        }
    }

    fn monday_morning() -> DateTime<Utc> {
        // 2026-03-02 10:00 EST.
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    async fn setup(
        targets: &[&str],
        registered: &[&str],
        source: ScriptedSource,
        config: RunnerConfig,
    ) -> (Arc<TaskRunner>, Arc<MemoryStore>, Arc<ScriptedSource>, Task) {
        let store = Arc::new(MemoryStore::new());
        for id in registered {
            store
                .register_entity(&Entity {
                    id: EntityId::new(*id),
                    name: id.to_uppercase(),
                    platform: "chesscom".into(),
                    external_key: id.to_string(),
                })
                .await
                .unwrap();
        }

        let mut settings = CollectionSettings::new("chesscom", "members");
        settings.retry_attempts = 0;
        let mut task = Task::new(
            "weekly-roster",
            "owner-1",
            ScheduleWindow::new(20, 23, &[2, 3], "EST"),
            settings,
        )
        .with_targets(targets.iter().copied());
        task.next_run = Some(monday_morning());
        store.create_task(&task).await.unwrap();

        let source = Arc::new(source);
        let runner = Arc::new(TaskRunner::new(
            store.clone(),
            store.clone(),
            source.clone(),
            Arc::new(ManualClock::new(monday_morning())),
            config,
        ));
        (runner, store, source, task)
    }

    #[tokio::test]
    async fn test_zero_targets_is_empty_success() {
        let (runner, store, _, task) =
            setup(&[], &[], ScriptedSource::default(), RunnerConfig::default()).await;

        let record = runner.run(task.id).await.unwrap().unwrap();
        assert_eq!(record.status(), ExecutionStatus::Success);
        assert_eq!(record.entities_processed, 0);
        assert_eq!(record.items_collected, 0);

        let saved = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(saved.last_run, Some(monday_morning()));
        // Tuesday 20:00 EST.
        assert_eq!(saved.next_run, Some(Utc.with_ymd_and_hms(2026, 3, 4, 1, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_unregistered_entity_is_skipped() {
        let source = ScriptedSource {
            items: HashMap::from([("a".into(), 2), ("c".into(), 3)]),
            ..Default::default()
        };
        let (runner, _, source, task) =
            setup(&["a", "ghost", "c"], &["a", "c"], source, RunnerConfig::default()).await;

        let record = runner.run(task.id).await.unwrap().unwrap();
        assert_eq!(record.status(), ExecutionStatus::Success);
        assert_eq!(record.entities_processed, 2);
        assert_eq!(record.items_collected, 5);
        assert_eq!(source.calls(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_first_entity_failure_is_error_and_aborts() {
        let source = ScriptedSource {
            items: HashMap::from([("b".into(), 4), ("c".into(), 4)]),
            failing: HashSet::from(["a".to_string()]),
            ..Default::default()
        };
        let (runner, store, source, task) =
            setup(&["a", "b", "c"], &["a", "b", "c"], source, RunnerConfig::default()).await;

        let record = runner.run(task.id).await.unwrap().unwrap();
        assert_eq!(record.status(), ExecutionStatus::Error);
        assert!(record.error().unwrap().contains("HTTP 503 for a"));
        assert_eq!(record.entities_processed, 1);
        assert_eq!(record.items_collected, 0);
        assert_eq!(source.calls(), vec!["a"]);

        let history = store.history(&task.id, 10).await.unwrap();
        assert_eq!(history, vec![record]);
    }

    #[tokio::test]
    async fn test_failure_after_success_is_partial() {
        let source = ScriptedSource {
            items: HashMap::from([("a".into(), 3), ("c".into(), 1)]),
            failing: HashSet::from(["b".to_string()]),
            ..Default::default()
        };
        let (runner, _, source, task) =
            setup(&["a", "b", "c"], &["a", "b", "c"], source, RunnerConfig::default()).await;

        let record = runner.run(task.id).await.unwrap().unwrap();
        assert_eq!(record.status(), ExecutionStatus::Partial);
        assert_eq!(record.entities_processed, 2);
        assert_eq!(record.items_collected, 3);
        assert_eq!(source.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_partial_can_be_disabled() {
        let source = ScriptedSource {
            items: HashMap::from([("a".into(), 3)]),
            failing: HashSet::from(["b".to_string()]),
            ..Default::default()
        };
        let config = RunnerConfig {
            partial_on_prior_success: false,
            ..Default::default()
        };
        let (runner, _, _, task) = setup(&["a", "b"], &["a", "b"], source, config).await;

        let record = runner.run(task.id).await.unwrap().unwrap();
        assert_eq!(record.status(), ExecutionStatus::Error);
        assert_eq!(record.items_collected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_past_budget_is_recorded_as_failure() {
        let source = ScriptedSource {
            items: HashMap::from([("a".into(), 2)]),
            failing: HashSet::from(["b".to_string()]),
            ..Default::default()
        };
        let (runner, store, source, mut task) =
            setup(&["a", "b", "c"], &["a", "b", "c"], source, RunnerConfig::default()).await;
        // Backoff 5m, 10m, 20m: the third attempt would start after the 540s budget.
        task.settings.retry_attempts = 3;
        task.settings.retry_delay_minutes = 5;
        store.update_task(&task).await.unwrap();
        let started = tokio::time::Instant::now();

        let record = runner.run(task.id).await.unwrap().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(540) && elapsed < Duration::from_secs(600));
        assert_eq!(record.status(), ExecutionStatus::Partial);
        assert!(record.error().unwrap().contains("Timed out after 540s"));
        assert!(record.error().unwrap().contains("'b'"));
        assert_eq!(record.entities_processed, 2);
        assert_eq!(record.items_collected, 2);
        assert_eq!(source.calls(), vec!["a", "b", "b"]);

        let history = store.history(&task.id, 10).await.unwrap();
        assert_eq!(history, vec![record]);
        let saved = store.get_task(&task.id).await.unwrap().unwrap();
        assert!(saved.last_run.is_some());
        assert!(saved.next_run.is_some());
    }

    #[tokio::test]
    async fn test_inactive_or_missing_task_is_noop() {
        let (runner, store, source, mut task) =
            setup(&["a"], &["a"], ScriptedSource::default(), RunnerConfig::default()).await;

        task.active = false;
        task.next_run = None;
        store.update_task(&task).await.unwrap();

        assert!(runner.run(task.id).await.unwrap().is_none());
        assert!(runner.run(TaskId::new()).await.unwrap().is_none());
        assert!(store.history(&task.id, 10).await.unwrap().is_empty());
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected_by_lease() {
        let gate = Arc::new(Notify::new());
        let source = ScriptedSource {
            items: HashMap::from([("a".into(), 1)]),
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let (runner, _, _, task) = setup(&["a"], &["a"], source, RunnerConfig::default()).await;

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(task.id).await }
        });
        while !runner.is_running(&task.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = runner.run(task.id).await;
        assert!(matches!(second, Err(ClubSyncError::AlreadyRunning(_))));

        gate.notify_one();
        let record = first.await.unwrap().unwrap().unwrap();
        assert_eq!(record.items_collected, 1);
        assert!(!runner.is_running(&task.id));
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(chrono::Duration::minutes(42)), "42m");
        assert_eq!(humanize(chrono::Duration::minutes(125)), "2h5m");
        assert_eq!(humanize(chrono::Duration::hours(30)), "1d6h");
    }
}
