//! Scheduler service. Wires store, runner, queue and trigger loop together
//! and exposes the administrative operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use clubsync_core::clock::Clock;
use clubsync_core::config::ClubSyncConfig;
use clubsync_core::error::{ClubSyncError, Result};
use clubsync_core::task::{Entity, EntityId, ExecutionRecord, ScheduleWindow, Task, TaskId};
use clubsync_core::traits::{DataSource, EntityRegistry, TaskStore};

use crate::next_run::next_run;
use crate::queue::{
    Job, JobHandle, JobHandler, JobJournal, JobOrigin, JobOutcome, JobQueue, LocalQueue,
    QueueStats,
};
use crate::runner::TaskRunner;
use crate::trigger::{LoopTransition, TriggerLoop, TriggerStatus};

/// Queue worker callback: runs the task and pre-schedules its next slot.
struct RunnerJobHandler {
    runner: Arc<TaskRunner>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    self_schedule: bool,
}

#[async_trait]
impl JobHandler for RunnerJobHandler {
    async fn handle(&self, job: &Job) -> Result<JobOutcome> {
        if job.origin == JobOrigin::SelfScheduled {
            let due = self
                .store
                .get_task(&job.task_id)
                .await?
                .is_some_and(|t| t.is_due(self.clock.now()));
            if !due {
                tracing::debug!(
                    "⏭️ Pre-scheduled job for task {} is stale, skipping",
                    job.task_id
                );
                return Ok(JobOutcome::Completed);
            }
        }

        match self.runner.run(job.task_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(JobOutcome::Completed),
            Err(ClubSyncError::AlreadyRunning(_)) => {
                tracing::debug!(
                    "⏭️ Task {} already running, dropping job {}",
                    job.task_id,
                    job.id
                );
                return Ok(JobOutcome::Completed);
            }
            Err(e) => return Err(e),
        }

        if !self.self_schedule {
            return Ok(JobOutcome::Completed);
        }
        let next = self
            .store
            .get_task(&job.task_id)
            .await?
            .filter(|t| t.active)
            .and_then(|t| t.next_run);
        Ok(match next {
            Some(at) => {
                let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                JobOutcome::Reschedule(delay)
            }
            None => JobOutcome::Completed,
        })
    }
}

/// Combined health view.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub trigger: TriggerStatus,
    pub queue: QueueStats,
}

pub struct SchedulerService {
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn EntityRegistry>,
    source: Arc<dyn DataSource>,
    clock: Arc<dyn Clock>,
    runner: Arc<TaskRunner>,
    queue: LocalQueue,
    trigger: TriggerLoop,
}

impl SchedulerService {
    pub fn new(
        config: &ClubSyncConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn EntityRegistry>,
        source: Arc<dyn DataSource>,
        journal: Arc<dyn JobJournal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&source),
            Arc::clone(&clock),
            config.runner.capped_to(config.queue.job_timeout_secs),
        ));
        let handler = Arc::new(RunnerJobHandler {
            runner: Arc::clone(&runner),
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            self_schedule: config.scheduler.self_schedule,
        });
        let queue = LocalQueue::new(&config.queue, handler, journal, Arc::clone(&clock));
        let trigger = TriggerLoop::new(
            Arc::clone(&store),
            Arc::new(queue.clone()),
            Arc::clone(&clock),
            &config.scheduler,
        );

        Self {
            store,
            registry,
            source,
            clock,
            runner,
            queue,
            trigger,
        }
    }

    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    pub fn trigger(&self) -> &TriggerLoop {
        &self.trigger
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Recover journaled jobs and start the trigger loop.
    pub async fn start(&self) -> Result<LoopTransition> {
        self.queue.recover().await?;
        Ok(self.trigger.start().await)
    }

    /// Stop polling and stop accepting new jobs.
    pub fn shutdown(&self) {
        self.trigger.stop();
        self.queue.shutdown();
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            trigger: self.trigger.status(),
            queue: self.queue.stats().await,
        }
    }

    // ─── Tasks ──────────────────────────────────────────────

    /// Validate and persist a new task; an active task gets its first `next_run`.
    pub async fn create_task(&self, mut task: Task) -> Result<Task> {
        task.validate()?;
        task.next_run = task
            .active
            .then(|| next_run(self.clock.now(), &task.window));
        self.store.create_task(&task).await?;
        tracing::info!(
            "📋 Task '{}' created ({} targets, next run {})",
            task.name,
            task.targets.len(),
            task.next_run
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into())
        );
        Ok(task)
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| ClubSyncError::task_not_found(id))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.list_tasks().await
    }

    /// Replace the schedule window and recompute `next_run` if active.
    pub async fn update_schedule(&self, id: &TaskId, window: ScheduleWindow) -> Result<Task> {
        window.validate()?;
        let next = next_run(self.clock.now(), &window);
        self.store.set_window(id, &window, next).await?;
        let task = self.get_task(id).await?;
        tracing::info!("📅 Task '{}' rescheduled", task.name);
        Ok(task)
    }

    pub async fn update_targets(&self, id: &TaskId, targets: Vec<EntityId>) -> Result<Task> {
        self.store.set_targets(id, &targets).await?;
        let task = self.get_task(id).await?;
        tracing::info!(
            "🎯 Task '{}' now targets {} entities",
            task.name,
            task.targets.len()
        );
        Ok(task)
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<()> {
        if !self.store.delete_task(id).await? {
            return Err(ClubSyncError::task_not_found(id));
        }
        tracing::info!("🗑️ Task {id} deleted");
        Ok(())
    }

    /// Activate a task and schedule its next slot. No-op if already active.
    pub async fn start_task(&self, id: &TaskId) -> Result<Task> {
        let task = self.get_task(id).await?;
        if task.active && task.next_run.is_some() {
            return Ok(task);
        }
        let next = next_run(self.clock.now(), &task.window);
        self.store.set_active(id, true, Some(next)).await?;
        tracing::info!("▶️ Task '{}' started", task.name);
        self.get_task(id).await
    }

    /// Deactivate a task and clear `next_run`. A run in flight completes.
    pub async fn stop_task(&self, id: &TaskId) -> Result<Task> {
        let task = self.get_task(id).await?;
        if !task.active && task.next_run.is_none() {
            return Ok(task);
        }
        self.store.set_active(id, false, None).await?;
        tracing::info!("⏸️ Task '{}' stopped", task.name);
        self.get_task(id).await
    }

    /// Run a task synchronously and return its execution record.
    pub async fn run_now(&self, id: &TaskId) -> Result<ExecutionRecord> {
        let task = self.get_task(id).await?;
        if !task.active {
            return Err(ClubSyncError::Configuration(format!(
                "Task '{}' is stopped; start it before running",
                task.name
            )));
        }
        self.runner
            .run(*id)
            .await?
            .ok_or_else(|| ClubSyncError::task_not_found(id))
    }

    /// Queue a manual run without waiting for it.
    pub async fn queue_run(&self, id: &TaskId) -> Result<JobHandle> {
        self.get_task(id).await?;
        self.queue.enqueue(*id, Duration::ZERO, JobOrigin::Manual).await
    }

    /// Execution history, newest first.
    pub async fn history(&self, id: &TaskId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.get_task(id).await?;
        self.store.history(id, limit).await
    }

    // ─── Entities ───────────────────────────────────────────

    /// Resolve `name` on `platform` through the data source and register it.
    pub async fn register_entity(&self, name: &str, platform: &str) -> Result<Entity> {
        let descriptor = self
            .source
            .lookup(name, platform)
            .await?
            .ok_or_else(|| ClubSyncError::entity_not_found(format!("{platform}:{name}")))?;
        let entity = Entity {
            id: EntityId::new(descriptor.key.clone()),
            name: descriptor.name,
            platform: descriptor.platform,
            external_key: descriptor.key,
        };
        self.registry.register_entity(&entity).await?;
        tracing::info!("🏷️ Registered entity '{}' ({})", entity.name, entity.id);
        Ok(entity)
    }

    pub async fn list_entities(&self) -> Result<Vec<Entity>> {
        self.registry.list_entities().await
    }
}
