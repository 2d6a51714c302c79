//! In-memory task store and entity registry.
//! Used for tests and for embedding the engine without SQLite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use clubsync_core::error::{ClubSyncError, Result};
use clubsync_core::task::{Entity, EntityId, ExecutionRecord, ScheduleWindow, Task, TaskId};
use clubsync_core::traits::{EntityRegistry, TaskStore};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// Oldest first; reversed on read.
    history: HashMap<TaskId, Vec<ExecutionRecord>>,
    entities: HashMap<EntityId, Entity>,
}

/// Volatile store holding everything behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `change` to one stored task under the write lock.
    async fn modify(&self, id: &TaskId, change: impl FnOnce(&mut Task)) -> Result<()> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| ClubSyncError::task_not_found(id))?;
        change(task);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.values().any(|t| t.name == task.name) {
            return Err(ClubSyncError::AlreadyExists(format!("task '{}'", task.name)));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.inner.read().await.tasks.get(id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .tasks
            .values()
            .any(|t| t.name == task.name && t.id != task.id)
        {
            return Err(ClubSyncError::AlreadyExists(format!("task '{}'", task.name)));
        }
        match inner.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(ClubSyncError::task_not_found(task.id)),
        }
    }

    async fn set_active(
        &self,
        id: &TaskId,
        active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.modify(id, |task| {
            task.active = active;
            task.next_run = next_run;
        })
        .await
    }

    async fn set_window(
        &self,
        id: &TaskId,
        window: &ScheduleWindow,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        self.modify(id, |task| {
            task.window = window.clone();
            if task.active {
                task.next_run = Some(next_run);
            }
        })
        .await
    }

    async fn set_targets(&self, id: &TaskId, targets: &[EntityId]) -> Result<()> {
        self.modify(id, |task| task.targets = targets.to_vec()).await
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.history.remove(id);
        Ok(inner.tasks.remove(id).is_some())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(tasks)
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_run);
        Ok(due)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.tasks.contains_key(&record.task_id) {
            return Err(ClubSyncError::task_not_found(record.task_id));
        }
        inner
            .history
            .entry(record.task_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn history(&self, id: &TaskId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .history
            .get(id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn complete_run(
        &self,
        id: &TaskId,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.modify(id, |task| {
            task.last_run = Some(last_run);
            task.next_run = if task.active { next_run } else { None };
        })
        .await
    }
}

#[async_trait]
impl EntityRegistry for MemoryStore {
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.inner.read().await.entities.get(id).cloned())
    }

    async fn register_entity(&self, entity: &Entity) -> Result<()> {
        self.inner
            .write()
            .await
            .entities
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        let mut entities: Vec<Entity> = inner.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use clubsync_core::task::{CollectionSettings, Outcome, ScheduleWindow};
    use uuid::Uuid;

    fn task(name: &str) -> Task {
        Task::new(
            name,
            "owner-1",
            ScheduleWindow::new(20, 23, &[2, 3], "EST"),
            CollectionSettings::new("chesscom", "members"),
        )
    }

    fn record(task_id: TaskId, at: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::new_v4(),
            task_id,
            timestamp: at,
            outcome: Outcome::Success,
            items_collected: 1,
            entities_processed: 1,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = MemoryStore::new();
        store.create_task(&task("weekly")).await.unwrap();
        let err = store.create_task(&task("weekly")).await.unwrap_err();
        assert!(matches!(err, ClubSyncError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_due_tasks_filters_inactive_and_future() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut due = task("due");
        due.next_run = Some(now - Duration::minutes(1));
        let mut future = task("future");
        future.next_run = Some(now + Duration::hours(1));
        let mut stopped = task("stopped");
        stopped.active = false;

        for t in [&due, &future, &stopped] {
            store.create_task(t).await.unwrap();
        }

        let found = store.due_tasks(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_history_newest_first_and_deleted_with_task() {
        let store = MemoryStore::new();
        let t = task("hist");
        store.create_task(&t).await.unwrap();

        let base = Utc::now();
        for i in 0..5 {
            store
                .append_execution(&record(t.id, base + Duration::minutes(i)))
                .await
                .unwrap();
        }

        let latest = store.history(&t.id, 2).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, base + Duration::minutes(4));
        assert_eq!(latest[1].timestamp, base + Duration::minutes(3));

        assert!(store.delete_task(&t.id).await.unwrap());
        assert!(store.history(&t.id, 10).await.unwrap().is_empty());
        assert!(!store.delete_task(&t.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_run_clears_next_run_for_inactive_task() {
        let store = MemoryStore::new();
        let mut t = task("stopped-mid-run");
        t.active = false;
        store.create_task(&t).await.unwrap();

        let now = Utc::now();
        store
            .complete_run(&t.id, now, Some(now + Duration::days(1)))
            .await
            .unwrap();

        let saved = store.get_task(&t.id).await.unwrap().unwrap();
        assert_eq!(saved.last_run, Some(now));
        assert_eq!(saved.next_run, None);
    }

    #[tokio::test]
    async fn test_narrow_setters_leave_other_fields_alone() {
        let store = MemoryStore::new();
        let t = task("narrow");
        store.create_task(&t).await.unwrap();
        let later = Utc::now() + Duration::days(2);

        store.set_active(&t.id, false, None).await.unwrap();
        store
            .set_targets(&t.id, &[EntityId::new("a"), EntityId::new("b")])
            .await
            .unwrap();
        // Stopped: the window changes but next_run stays clear.
        let window = ScheduleWindow::new(8, 9, &[1], "UTC");
        store.set_window(&t.id, &window, later).await.unwrap();

        let saved = store.get_task(&t.id).await.unwrap().unwrap();
        assert!(!saved.active);
        assert_eq!(saved.next_run, None);
        assert_eq!(saved.window, window);
        assert_eq!(saved.targets.len(), 2);

        store.set_active(&t.id, true, Some(later)).await.unwrap();
        let saved = store.get_task(&t.id).await.unwrap().unwrap();
        assert!(saved.active);
        assert_eq!(saved.next_run, Some(later));
        assert_eq!(saved.targets.len(), 2);

        let missing = TaskId::new();
        assert!(matches!(
            store.set_targets(&missing, &[]).await,
            Err(ClubSyncError::NotFound { .. })
        ));
    }
}
