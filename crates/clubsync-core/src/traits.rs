//! Collaborator contracts consumed by the scheduling engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::{Entity, EntityId, ExecutionRecord, ScheduleWindow, Task, TaskId};

/// Persistent owner of tasks and their execution history.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `AlreadyExists` on a duplicate name.
    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Replace a task's definition. Fails with `NotFound` if it is gone.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Set `active` and `next_run`, leaving every other field as stored.
    async fn set_active(
        &self,
        id: &TaskId,
        active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Replace the schedule window. `next_run` is written only if the task is
    /// active at write time.
    async fn set_window(
        &self,
        id: &TaskId,
        window: &ScheduleWindow,
        next_run: DateTime<Utc>,
    ) -> Result<()>;

    /// Replace the target list only.
    async fn set_targets(&self, id: &TaskId, targets: &[EntityId]) -> Result<()>;

    /// Delete a task together with its history. Returns whether it existed.
    async fn delete_task(&self, id: &TaskId) -> Result<bool>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Tasks with `active = true` and `next_run <= now`.
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Newest first, at most `limit` records.
    async fn history(&self, id: &TaskId, limit: usize) -> Result<Vec<ExecutionRecord>>;

    /// Record the end of a run: sets `last_run`, and sets `next_run` only if
    /// the task is still active at write time (otherwise clears it).
    async fn complete_run(
        &self,
        id: &TaskId,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Lookup of valid target entities.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>>;

    async fn register_entity(&self, entity: &Entity) -> Result<()>;

    async fn list_entities(&self) -> Result<Vec<Entity>>;
}

/// What the data source knows about an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub key: String,
    pub name: String,
    pub platform: String,
    /// Raw vendor payload, opaque to the scheduler.
    pub raw: serde_json::Value,
}

/// The rate-limited external API a task polls.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Resolve an entity by name. `Ok(None)` when the platform does not know it.
    async fn lookup(&self, name: &str, platform: &str) -> Result<Option<EntityDescriptor>>;

    /// Fetch the ordered item list for one entity. Failures are `ExternalFetch`.
    async fn fetch_items(
        &self,
        entity_key: &str,
        platform: &str,
        task_type: &str,
    ) -> Result<Vec<serde_json::Value>>;
}
