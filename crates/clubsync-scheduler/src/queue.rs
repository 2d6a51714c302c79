//! Delayed, deduplicated job queue with retries.
//!
//! At most one job per task id is waiting or active at any time; a second
//! enqueue for the same task returns the existing handle. Failed jobs are
//! retried with exponential backoff and marked failed once the policy is
//! exhausted. Every state change goes through a [`JobJournal`] so waiting
//! work survives a restart (delivery is at-least-once).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use clubsync_core::clock::Clock;
use clubsync_core::config::QueueConfig;
use clubsync_core::error::{ClubSyncError, Result};
use clubsync_core::task::TaskId;

use crate::retry::RetryPolicy;

/// Finished jobs kept for inspection.
const RECENT_CAPACITY: usize = 100;

/// Why a job was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    /// Picked up by the trigger loop.
    Trigger,
    /// Pre-scheduled by the previous run of the same task.
    SelfScheduled,
    /// Requested by an operator.
    Manual,
}

impl JobOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOrigin::Trigger => "trigger",
            JobOrigin::SelfScheduled => "self_scheduled",
            JobOrigin::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trigger" => Some(JobOrigin::Trigger),
            "self_scheduled" => Some(JobOrigin::SelfScheduled),
            "manual" => Some(JobOrigin::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Dropped before it ever ran.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    /// Waiting or active.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active)
    }
}

/// One unit of queued work: "run task X".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task_id: TaskId,
    pub origin: JobOrigin,
    pub state: JobState,
    /// Attempts started so far.
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Returned from `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub task_id: TaskId,
    pub run_at: DateTime<Utc>,
    /// `true` when an existing pending job for the task was returned instead.
    pub deduplicated: bool,
}

/// What the handler wants done after a successful job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Completed; enqueue the task again after this delay.
    Reschedule(Duration),
}

/// Worker callback executed for every job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobOutcome>;
}

/// Durable record of job state transitions.
#[async_trait]
pub trait JobJournal: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Jobs left waiting or active.
    async fn pending_jobs(&self) -> Result<Vec<Job>>;
}

/// Journal that forgets everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

#[async_trait]
impl JobJournal for NoopJournal {
    async fn save_job(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<Job>> {
        Ok(Vec::new())
    }
}

/// Queue counters, exposed to the health dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub deduplicated: u64,
    pub cancelled: u64,
}

/// The queue surface used by the trigger loop and the admin service.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        task_id: TaskId,
        delay: Duration,
        origin: JobOrigin,
    ) -> Result<JobHandle>;

    /// Whether a waiting or active job exists for the task.
    async fn has_pending(&self, task_id: &TaskId) -> Result<bool>;

    /// Cancel the task's self-scheduled job if it has not started yet and is
    /// set to fire after `due`. Returns whether a job was cancelled.
    async fn cancel_if_later(&self, task_id: &TaskId, due: DateTime<Utc>) -> Result<bool>;

    async fn stats(&self) -> QueueStats;
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    by_task: HashMap<TaskId, Uuid>,
    recent: VecDeque<Job>,
    completed: u64,
    failed: u64,
    retried: u64,
    deduplicated: u64,
    cancelled: u64,
}

impl QueueState {
    fn finish(&mut self, job: Job) {
        self.jobs.remove(&job.id);
        if self.by_task.get(&job.task_id) == Some(&job.id) {
            self.by_task.remove(&job.task_id);
        }
        if self.recent.len() >= RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(job);
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    handler: Arc<dyn JobHandler>,
    journal: Arc<dyn JobJournal>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    job_timeout: Duration,
    workers: Arc<Semaphore>,
    closed: AtomicBool,
}

/// In-process job queue running on tokio with a bounded worker pool.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<QueueInner>,
}

impl LocalQueue {
    pub fn new(
        config: &QueueConfig,
        handler: Arc<dyn JobHandler>,
        journal: Arc<dyn JobJournal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                handler,
                journal,
                clock,
                policy: RetryPolicy::from_queue_config(config),
                job_timeout: Duration::from_secs(config.job_timeout_secs.max(1)),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Override the job-level retry policy.
    pub fn with_policy(self, policy: RetryPolicy) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.policy = policy;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    /// Re-schedule jobs a previous process left waiting or active.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.inner.journal.pending_jobs().await?;
        let now = self.inner.clock.now();
        let mut recovered = 0;

        for mut job in pending {
            {
                let mut state = self.inner.lock_state();
                if state.by_task.contains_key(&job.task_id) {
                    continue;
                }
                job.state = JobState::Waiting;
                state.by_task.insert(job.task_id, job.id);
                state.jobs.insert(job.id, job.clone());
            }
            if let Err(e) = self.inner.journal.save_job(&job).await {
                tracing::warn!("⚠️ Failed to journal recovered job {}: {e}", job.id);
            }
            let delay = (job.run_at - now).to_std().unwrap_or(Duration::ZERO);
            self.inner.schedule(job.id, delay);
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!("♻️ Recovered {recovered} pending jobs from journal");
        }
        Ok(recovered)
    }

    /// Stop accepting work. Jobs not yet started stay waiting in the journal.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        tracing::info!("🛑 Job queue shut down");
    }

    /// Snapshot of a pending or recently finished job.
    pub fn job(&self, id: &Uuid) -> Option<Job> {
        let state = self.inner.lock_state();
        state
            .jobs
            .get(id)
            .cloned()
            .or_else(|| state.recent.iter().rev().find(|j| j.id == *id).cloned())
    }

    /// Recently finished jobs, oldest first.
    pub fn recent(&self) -> Vec<Job> {
        self.inner.lock_state().recent.iter().cloned().collect()
    }

    /// Wait until nothing is waiting or active, or the timeout elapses.
    /// Returns whether the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.lock_state().jobs.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn enqueue(
        &self,
        task_id: TaskId,
        delay: Duration,
        origin: JobOrigin,
    ) -> Result<JobHandle> {
        self.inner.enqueue(task_id, delay, origin).await
    }

    async fn has_pending(&self, task_id: &TaskId) -> Result<bool> {
        Ok(self.inner.lock_state().by_task.contains_key(task_id))
    }

    async fn cancel_if_later(&self, task_id: &TaskId, due: DateTime<Utc>) -> Result<bool> {
        let job = {
            let mut state = self.inner.lock_state();
            let Some(mut job) = state
                .by_task
                .get(task_id)
                .and_then(|id| state.jobs.get(id))
                .cloned()
            else {
                return Ok(false);
            };
            if job.origin != JobOrigin::SelfScheduled
                || job.state != JobState::Waiting
                || job.attempts > 0
                || job.run_at <= due
            {
                return Ok(false);
            }
            job.state = JobState::Cancelled;
            state.cancelled += 1;
            state.finish(job.clone());
            job
        };
        self.inner.journal_quietly(&job).await;
        tracing::info!(
            "✂️ Cancelled job {} for task {task_id}: set for {}, task now due at {due}",
            job.id,
            job.run_at
        );
        Ok(true)
    }

    async fn stats(&self) -> QueueStats {
        let state = self.inner.lock_state();
        let (waiting, active) = state.jobs.values().fold((0, 0), |(w, a), job| match job.state {
            JobState::Waiting => (w + 1, a),
            JobState::Active => (w, a + 1),
            _ => (w, a),
        });
        QueueStats {
            waiting,
            active,
            completed: state.completed,
            failed: state.failed,
            retried: state.retried,
            deduplicated: state.deduplicated,
            cancelled: state.cancelled,
        }
    }
}

impl QueueInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enqueue(
        self: &Arc<Self>,
        task_id: TaskId,
        delay: Duration,
        origin: JobOrigin,
    ) -> Result<JobHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClubSyncError::Queue("queue is shut down".into()));
        }

        let now = self.clock.now();
        let run_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let job = {
            let mut state = self.lock_state();
            if let Some(existing) = state
                .by_task
                .get(&task_id)
                .and_then(|id| state.jobs.get(id))
            {
                let handle = JobHandle {
                    job_id: existing.id,
                    task_id,
                    run_at: existing.run_at,
                    deduplicated: true,
                };
                state.deduplicated += 1;
                tracing::debug!("📎 Task {task_id} already queued as job {}", handle.job_id);
                return Ok(handle);
            }

            let job = Job {
                id: Uuid::new_v4(),
                task_id,
                origin,
                state: JobState::Waiting,
                attempts: 0,
                run_at,
                created_at: now,
                last_error: None,
            };
            state.by_task.insert(task_id, job.id);
            state.jobs.insert(job.id, job.clone());
            job
        };

        if let Err(e) = self.journal.save_job(&job).await {
            let mut state = self.lock_state();
            state.jobs.remove(&job.id);
            if state.by_task.get(&task_id) == Some(&job.id) {
                state.by_task.remove(&task_id);
            }
            return Err(ClubSyncError::Queue(format!("failed to journal job: {e}")));
        }

        tracing::info!(
            "📥 Job {} enqueued for task {task_id} ({}, in {}s)",
            job.id,
            origin.as_str(),
            delay.as_secs()
        );
        self.schedule(job.id, delay);

        Ok(JobHandle {
            job_id: job.id,
            task_id,
            run_at: job.run_at,
            deduplicated: false,
        })
    }

    /// Fire `job_id` after `delay`, once a worker slot is free.
    fn schedule(self: &Arc<Self>, job_id: Uuid, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Ok(permit) = Arc::clone(&inner.workers).acquire_owned().await else {
                return;
            };
            inner.process(job_id).await;
            drop(permit);
        });
    }

    fn process(self: Arc<Self>, job_id: Uuid) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let job = {
                let mut state = self.lock_state();
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    return;
                };
                if job.state != JobState::Waiting {
                    return;
                }
                job.state = JobState::Active;
                job.attempts += 1;
                job.clone()
            };
            self.journal_quietly(&job).await;

            tracing::debug!(
                "⚙️ Job {} running task {} (attempt {}/{})",
                job.id,
                job.task_id,
                job.attempts,
                self.policy.max_attempts
            );

            let handled = tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await;
            let result = match handled {
                Ok(result) => result,
                Err(_) => Err(ClubSyncError::Timeout(self.job_timeout.as_secs())),
            };

            match result {
                Ok(outcome) => self.complete(job, outcome).await,
                Err(e) => self.fail(job, e).await,
            }
        })
    }

    async fn complete(self: &Arc<Self>, mut job: Job, outcome: JobOutcome) {
        job.state = JobState::Completed;
        job.last_error = None;
        {
            let mut state = self.lock_state();
            state.completed += 1;
            state.finish(job.clone());
        }
        self.journal_quietly(&job).await;
        tracing::debug!("✅ Job {} completed", job.id);

        if let JobOutcome::Reschedule(after) = outcome
            && let Err(e) = self.enqueue(job.task_id, after, JobOrigin::SelfScheduled).await
        {
            tracing::warn!("⚠️ Failed to pre-schedule task {}: {e}", job.task_id);
        }
    }

    async fn fail(self: &Arc<Self>, mut job: Job, error: ClubSyncError) {
        job.last_error = Some(error.to_string());

        if self.policy.should_retry(job.attempts) {
            let delay = self.policy.delay_for(job.attempts);
            job.state = JobState::Waiting;
            job.run_at = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            {
                let mut state = self.lock_state();
                state.retried += 1;
                state.jobs.insert(job.id, job.clone());
            }
            self.journal_quietly(&job).await;
            tracing::warn!(
                "🔁 Job {} for task {} failed (attempt {}/{}): {error}; retrying in {}s",
                job.id,
                job.task_id,
                job.attempts,
                self.policy.max_attempts,
                delay.as_secs()
            );
            self.schedule(job.id, delay);
            return;
        }

        job.state = JobState::Failed;
        {
            let mut state = self.lock_state();
            state.failed += 1;
            state.finish(job.clone());
        }
        self.journal_quietly(&job).await;
        tracing::error!(
            "❌ Job {} for task {} failed permanently after {} attempts: {error}",
            job.id,
            job.task_id,
            job.attempts
        );
    }

    async fn journal_quietly(&self, job: &Job) {
        if let Err(e) = self.journal.save_job(job).await {
            tracing::warn!("⚠️ Failed to journal job {}: {e}", job.id);
        }
    }
}
