//! # ClubSync Scheduler
//!
//! Time-window-driven scheduling engine for periodic club data collection.
//!
//! ## Architecture
//! ```text
//! TriggerLoop (tokio interval, default 60s)
//!   ├── TaskStore::due_tasks(now)      active && next_run <= now
//!   ├── JobQueue::has_pending(task)    skip if waiting/active job exists
//!   └── JobQueue::enqueue(task, 0)
//!
//! LocalQueue (semaphore-bounded workers, journaled to SQLite)
//!   ├── dedup: one pending job per task
//!   ├── retry: exponential backoff, then terminal failure
//!   └── handler → TaskRunner::run(task)
//!                   ├── for each target entity, in order
//!                   │     └── retry_with(DataSource::fetch_items)
//!                   ├── append ExecutionRecord
//!                   └── complete_run(last_run, next_run)
//!                         └── Reschedule(next_run - now) → SelfScheduled job
//! ```

pub mod next_run;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod service;
pub mod store;
pub mod trigger;

pub use next_run::next_run;
pub use persistence::SchedulerDb;
pub use queue::{
    Job, JobHandle, JobHandler, JobJournal, JobOrigin, JobOutcome, JobQueue, JobState, LocalQueue,
    NoopJournal, QueueStats,
};
pub use retry::{RetryPolicy, retry_with};
pub use runner::TaskRunner;
pub use service::{SchedulerService, ServiceStatus};
pub use store::MemoryStore;
pub use trigger::{LoopTransition, TriggerLoop, TriggerStatus};
