//! Trigger loop: periodic poll that turns due tasks into queued jobs.
//!
//! Two states, stopped and running. `start` ticks once immediately and then
//! on a fixed period; too many failed ticks in a row stop the loop until an
//! explicit `start`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use clubsync_core::clock::Clock;
use clubsync_core::config::SchedulerConfig;
use clubsync_core::error::Result;
use clubsync_core::traits::TaskStore;

use crate::queue::{JobOrigin, JobQueue};

/// Result of a `start`/`stop` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopTransition {
    Started,
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
}

/// Health snapshot for the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerStatus {
    pub running: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub ticks: u64,
    pub enqueued: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct LoopState {
    running: bool,
    /// Bumped on every start so a superseded timer task exits.
    generation: u64,
    last_tick: Option<DateTime<Utc>>,
    consecutive_errors: u32,
    ticks: u64,
    enqueued: u64,
    last_error: Option<String>,
}

struct TriggerInner {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    period: Duration,
    max_consecutive_errors: u32,
    state: Mutex<LoopState>,
}

#[derive(Clone)]
pub struct TriggerLoop {
    inner: Arc<TriggerInner>,
}

impl TriggerLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                store,
                queue,
                clock,
                period: Duration::from_secs(config.tick_interval_secs.max(1)),
                max_consecutive_errors: config.max_consecutive_errors.max(1),
                state: Mutex::new(LoopState::default()),
            }),
        }
    }

    /// Transition to running: tick now, then every period.
    pub async fn start(&self) -> LoopTransition {
        let generation = {
            let mut state = self.inner.lock_state();
            if state.running {
                return LoopTransition::AlreadyRunning;
            }
            state.running = true;
            state.consecutive_errors = 0;
            state.generation += 1;
            state.generation
        };
        tracing::info!(
            "⏰ Trigger loop started (check every {}s)",
            self.inner.period.as_secs()
        );

        self.tick().await;

        // The first tick may already have stopped the loop.
        if !self.inner.is_current(generation) {
            return LoopTransition::Started;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + inner.period;
            let mut interval = tokio::time::interval_at(start, inner.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !inner.is_current(generation) {
                    break;
                }
                inner.record_tick().await;
            }
            tracing::debug!("⏰ Trigger timer (generation {generation}) exited");
        });

        LoopTransition::Started
    }

    /// Transition to stopped. A tick in progress finishes normally.
    pub fn stop(&self) -> LoopTransition {
        let mut state = self.inner.lock_state();
        if !state.running {
            return LoopTransition::AlreadyStopped;
        }
        state.running = false;
        tracing::info!("🛑 Trigger loop stopped");
        LoopTransition::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    /// Perform one tick and update the health counters.
    /// Returns the number of jobs enqueued, or `None` if the tick failed.
    pub async fn tick(&self) -> Option<usize> {
        self.inner.record_tick().await
    }

    pub fn status(&self) -> TriggerStatus {
        let state = self.inner.lock_state();
        TriggerStatus {
            running: state.running,
            last_tick: state.last_tick,
            consecutive_errors: state.consecutive_errors,
            ticks: state.ticks,
            enqueued: state.enqueued,
            last_error: state.last_error.clone(),
        }
    }
}

impl TriggerInner {
    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock_state();
        state.running && state.generation == generation
    }

    async fn record_tick(&self) -> Option<usize> {
        let now = self.clock.now();
        let result = self.scan(now).await;

        let mut state = self.lock_state();
        state.ticks += 1;
        state.last_tick = Some(now);
        match result {
            Ok(enqueued) => {
                state.consecutive_errors = 0;
                state.last_error = None;
                state.enqueued += enqueued as u64;
                if enqueued > 0 {
                    tracing::info!("📣 Tick enqueued {enqueued} due tasks");
                }
                Some(enqueued)
            }
            Err(e) => {
                state.consecutive_errors += 1;
                state.last_error = Some(e.to_string());
                tracing::warn!(
                    "⚠️ Trigger tick failed ({}/{}): {e}",
                    state.consecutive_errors,
                    self.max_consecutive_errors
                );
                if state.running && state.consecutive_errors >= self.max_consecutive_errors {
                    state.running = false;
                    tracing::error!(
                        "🛑 Trigger loop stopped after {} consecutive failed ticks",
                        state.consecutive_errors
                    );
                }
                None
            }
        }
    }

    async fn scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_tasks(now).await?;
        let mut enqueued = 0;
        for task in due {
            // A follow-up booked for a later slot must not shadow an earlier one.
            if let Some(next_run) = task.next_run
                && self.queue.cancel_if_later(&task.id, next_run).await?
            {
                tracing::info!("⏩ Task '{}' moved earlier, replacing its booked job", task.name);
            }
            if self.queue.has_pending(&task.id).await? {
                tracing::debug!("📎 Task '{}' already has a pending job", task.name);
                continue;
            }
            let handle = self
                .queue
                .enqueue(task.id, Duration::ZERO, JobOrigin::Trigger)
                .await?;
            if !handle.deduplicated {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }
}
