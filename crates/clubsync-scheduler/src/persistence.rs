//! SQLite-backed persistence for tasks, execution history, entities and the
//! job journal. Survives restarts; one connection guarded by a mutex.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

use clubsync_core::error::{ClubSyncError, Result};
use clubsync_core::task::{
    CollectionSettings, Entity, EntityId, ExecutionRecord, Outcome, ScheduleWindow, Task, TaskId,
};
use clubsync_core::traits::{EntityRegistry, TaskStore};

use crate::queue::{Job, JobJournal, JobOrigin, JobState};

const TASK_COLUMNS: &str = "id, name, description, active, owner_id, start_hour, end_hour, \
     days_of_week, timezone, platform, task_type, frequency_minutes, retry_attempts, \
     retry_delay_minutes, targets, last_run, next_run, created_at";

/// SQLite store implementing [`TaskStore`], [`EntityRegistry`] and [`JobJournal`].
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("open", e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1,
                owner_id TEXT NOT NULL,
                start_hour INTEGER NOT NULL,
                end_hour INTEGER NOT NULL,
                days_of_week TEXT NOT NULL,      -- JSON array, 0 = Sunday
                timezone TEXT NOT NULL,
                platform TEXT NOT NULL,
                task_type TEXT NOT NULL,
                frequency_minutes INTEGER NOT NULL,
                retry_attempts INTEGER NOT NULL,
                retry_delay_minutes INTEGER NOT NULL,
                targets TEXT NOT NULL,           -- JSON array of entity ids
                last_run TEXT,
                next_run TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(active, next_run);

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL,            -- 'success', 'partial', 'error'
                error TEXT,
                items_collected INTEGER NOT NULL,
                entities_processed INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id, timestamp);

            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                platform TEXT NOT NULL,
                external_key TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                origin TEXT NOT NULL,
                state TEXT NOT NULL,             -- 'waiting', 'active', 'failed'
                attempts INTEGER NOT NULL,
                run_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_error TEXT
            );
            ",
            )
            .map_err(|e| db_err("migration", e))
    }

    /// Terminally failed jobs, newest first.
    pub fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, origin, state, attempts, run_at, created_at, last_error
                 FROM jobs WHERE state = 'failed' ORDER BY run_at DESC LIMIT ?1",
            )
            .map_err(|e| db_err("failed jobs", e))?;
        let rows = stmt
            .query_map([limit as i64], raw_job)
            .map_err(|e| db_err("failed jobs", e))?;
        collect_rows(rows, "failed jobs")?
            .into_iter()
            .map(RawJob::into_job)
            .collect()
    }
}

#[async_trait]
impl TaskStore for SchedulerDb {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let row = TaskRow::from_task(task)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                             ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    row.id,
                    task.name,
                    task.description,
                    task.active,
                    task.owner_id,
                    task.window.start_hour,
                    task.window.end_hour,
                    row.days,
                    task.window.timezone,
                    task.settings.platform,
                    task.settings.task_type,
                    task.settings.frequency_minutes,
                    task.settings.retry_attempts,
                    task.settings.retry_delay_minutes,
                    row.targets,
                    task.last_run.map(|t| t.to_rfc3339()),
                    task.next_run.map(|t| t.to_rfc3339()),
                    task.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                if is_constraint(&e) {
                    ClubSyncError::AlreadyExists(format!("task '{}'", task.name))
                } else {
                    db_err("create task", e)
                }
            })?;
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id.to_string()],
                raw_task,
            )
            .optional()
            .map_err(|e| db_err("get task", e))?;
        raw.map(RawTask::into_task).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let row = TaskRow::from_task(task)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET name = ?2, description = ?3, active = ?4, owner_id = ?5,
                    start_hour = ?6, end_hour = ?7, days_of_week = ?8, timezone = ?9,
                    platform = ?10, task_type = ?11, frequency_minutes = ?12,
                    retry_attempts = ?13, retry_delay_minutes = ?14, targets = ?15,
                    last_run = ?16, next_run = ?17
                 WHERE id = ?1",
                params![
                    row.id,
                    task.name,
                    task.description,
                    task.active,
                    task.owner_id,
                    task.window.start_hour,
                    task.window.end_hour,
                    row.days,
                    task.window.timezone,
                    task.settings.platform,
                    task.settings.task_type,
                    task.settings.frequency_minutes,
                    task.settings.retry_attempts,
                    task.settings.retry_delay_minutes,
                    row.targets,
                    task.last_run.map(|t| t.to_rfc3339()),
                    task.next_run.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| {
                if is_constraint(&e) {
                    ClubSyncError::AlreadyExists(format!("task '{}'", task.name))
                } else {
                    db_err("update task", e)
                }
            })?;
        ensure_changed(changed, &task.id)
    }

    async fn set_active(
        &self,
        id: &TaskId,
        active: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET active = ?2, next_run = ?3 WHERE id = ?1",
                params![id.to_string(), active, next_run.map(|t| t.to_rfc3339())],
            )
            .map_err(|e| db_err("set active", e))?;
        ensure_changed(changed, id)
    }

    async fn set_window(
        &self,
        id: &TaskId,
        window: &ScheduleWindow,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        let days = serde_json::to_string(&window.days_of_week)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET start_hour = ?2, end_hour = ?3, days_of_week = ?4,
                    timezone = ?5,
                    next_run = CASE WHEN active = 1 THEN ?6 ELSE next_run END
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    window.start_hour,
                    window.end_hour,
                    days,
                    window.timezone,
                    next_run.to_rfc3339(),
                ],
            )
            .map_err(|e| db_err("set window", e))?;
        ensure_changed(changed, id)
    }

    async fn set_targets(&self, id: &TaskId, targets: &[EntityId]) -> Result<()> {
        let targets = serde_json::to_string(targets)?;
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET targets = ?2 WHERE id = ?1",
                params![id.to_string(), targets],
            )
            .map_err(|e| db_err("set targets", e))?;
        ensure_changed(changed, id)
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(|e| db_err("delete task", e))?;
        tx.execute("DELETE FROM executions WHERE task_id = ?1", [id.to_string()])
            .map_err(|e| db_err("delete history", e))?;
        let removed = tx
            .execute("DELETE FROM tasks WHERE id = ?1", [id.to_string()])
            .map_err(|e| db_err("delete task", e))?;
        tx.commit().map_err(|e| db_err("delete task", e))?;
        Ok(removed > 0)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, name"))
            .map_err(|e| db_err("list tasks", e))?;
        let rows = stmt.query_map([], raw_task).map_err(|e| db_err("list tasks", e))?;
        collect_rows(rows, "list tasks")?
            .into_iter()
            .map(RawTask::into_task)
            .collect()
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        // Timestamps are rfc3339 text; compare parsed values, not strings.
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE active = 1 AND next_run IS NOT NULL"
            ))
            .map_err(|e| db_err("due tasks", e))?;
        let rows = stmt.query_map([], raw_task).map_err(|e| db_err("due tasks", e))?;
        let mut due = Vec::new();
        for raw in collect_rows(rows, "due tasks")? {
            let task = raw.into_task()?;
            if task.is_due(now) {
                due.push(task);
            }
        }
        due.sort_by_key(|t| t.next_run);
        Ok(due)
    }

    async fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO executions
                 (id, task_id, timestamp, status, error, items_collected,
                  entities_processed, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.task_id.to_string(),
                    record.timestamp.to_rfc3339(),
                    record.status().as_str(),
                    record.error(),
                    record.items_collected as i64,
                    record.entities_processed as i64,
                    record.duration_ms as i64,
                ],
            )
            .map_err(|e| {
                if is_constraint(&e) {
                    ClubSyncError::task_not_found(record.task_id)
                } else {
                    db_err("append execution", e)
                }
            })?;
        Ok(())
    }

    async fn history(&self, id: &TaskId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, timestamp, status, error, items_collected,
                        entities_processed, duration_ms
                 FROM executions WHERE task_id = ?1
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| db_err("history", e))?;
        let rows = stmt
            .query_map(params![id.to_string(), limit as i64], |row| {
                Ok(RawExecution {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    status: row.get(3)?,
                    error: row.get(4)?,
                    items_collected: row.get(5)?,
                    entities_processed: row.get(6)?,
                    duration_ms: row.get(7)?,
                })
            })
            .map_err(|e| db_err("history", e))?;
        collect_rows(rows, "history")?
            .into_iter()
            .map(RawExecution::into_record)
            .collect()
    }

    async fn complete_run(
        &self,
        id: &TaskId,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // Conditional on the row's current `active` flag: a stop that landed
        // mid-run wins.
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET last_run = ?2,
                    next_run = CASE WHEN active = 1 THEN ?3 ELSE NULL END
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    last_run.to_rfc3339(),
                    next_run.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| db_err("complete run", e))?;
        ensure_changed(changed, id)
    }
}

#[async_trait]
impl EntityRegistry for SchedulerDb {
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        self.conn()
            .query_row(
                "SELECT id, name, platform, external_key FROM entities WHERE id = ?1",
                [id.as_str()],
                entity_from_row,
            )
            .optional()
            .map_err(|e| db_err("get entity", e))
    }

    async fn register_entity(&self, entity: &Entity) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO entities (id, name, platform, external_key)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    entity.id.as_str(),
                    entity.name,
                    entity.platform,
                    entity.external_key
                ],
            )
            .map_err(|e| db_err("register entity", e))?;
        Ok(())
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, platform, external_key FROM entities ORDER BY id")
            .map_err(|e| db_err("list entities", e))?;
        let rows = stmt
            .query_map([], entity_from_row)
            .map_err(|e| db_err("list entities", e))?;
        collect_rows(rows, "list entities")
    }
}

#[async_trait]
impl JobJournal for SchedulerDb {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let conn = self.conn();
        if matches!(job.state, JobState::Completed | JobState::Cancelled) {
            conn.execute("DELETE FROM jobs WHERE id = ?1", [job.id.to_string()])
                .map_err(|e| db_err("save job", e))?;
            return Ok(());
        }
        conn.execute(
            "INSERT OR REPLACE INTO jobs
             (id, task_id, origin, state, attempts, run_at, created_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.task_id.to_string(),
                job.origin.as_str(),
                job.state.as_str(),
                job.attempts,
                job.run_at.to_rfc3339(),
                job.created_at.to_rfc3339(),
                job.last_error,
            ],
        )
        .map_err(|e| db_err("save job", e))?;
        tracing::debug!("💾 Journaled job {} ({})", job.id, job.state.as_str());
        Ok(())
    }

    async fn pending_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, origin, state, attempts, run_at, created_at, last_error
                 FROM jobs WHERE state IN ('waiting', 'active') ORDER BY run_at",
            )
            .map_err(|e| db_err("pending jobs", e))?;
        let rows = stmt
            .query_map([], raw_job)
            .map_err(|e| db_err("pending jobs", e))?;
        collect_rows(rows, "pending jobs")?
            .into_iter()
            .map(RawJob::into_job)
            .collect()
    }
}

// ─── Row mapping ──────────────────────────────────────────────

/// JSON columns of a task row.
struct TaskRow {
    id: String,
    days: String,
    targets: String,
}

impl TaskRow {
    fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id.to_string(),
            days: serde_json::to_string(&task.window.days_of_week)?,
            targets: serde_json::to_string(&task.targets)?,
        })
    }
}

struct RawTask {
    id: String,
    name: String,
    description: String,
    active: bool,
    owner_id: String,
    start_hour: u32,
    end_hour: u32,
    days: String,
    timezone: String,
    platform: String,
    task_type: String,
    frequency_minutes: u32,
    retry_attempts: u32,
    retry_delay_minutes: u32,
    targets: String,
    last_run: Option<String>,
    next_run: Option<String>,
    created_at: String,
}

fn raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        active: row.get(3)?,
        owner_id: row.get(4)?,
        start_hour: row.get(5)?,
        end_hour: row.get(6)?,
        days: row.get(7)?,
        timezone: row.get(8)?,
        platform: row.get(9)?,
        task_type: row.get(10)?,
        frequency_minutes: row.get(11)?,
        retry_attempts: row.get(12)?,
        retry_delay_minutes: row.get(13)?,
        targets: row.get(14)?,
        last_run: row.get(15)?,
        next_run: row.get(16)?,
        created_at: row.get(17)?,
    })
}

impl RawTask {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id.parse()?,
            name: self.name,
            description: self.description,
            active: self.active,
            owner_id: self.owner_id,
            window: ScheduleWindow {
                start_hour: self.start_hour,
                end_hour: self.end_hour,
                days_of_week: serde_json::from_str(&self.days)?,
                timezone: self.timezone,
            },
            settings: CollectionSettings {
                platform: self.platform,
                task_type: self.task_type,
                frequency_minutes: self.frequency_minutes,
                retry_attempts: self.retry_attempts,
                retry_delay_minutes: self.retry_delay_minutes,
            },
            targets: serde_json::from_str(&self.targets)?,
            last_run: self.last_run.as_deref().map(parse_time).transpose()?,
            next_run: self.next_run.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct RawExecution {
    id: String,
    task_id: String,
    timestamp: String,
    status: String,
    error: Option<String>,
    items_collected: i64,
    entities_processed: i64,
    duration_ms: i64,
}

impl RawExecution {
    fn into_record(self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            id: parse_uuid(&self.id)?,
            task_id: self.task_id.parse()?,
            timestamp: parse_time(&self.timestamp)?,
            outcome: Outcome::from_parts(&self.status, self.error)?,
            items_collected: self.items_collected.max(0) as u64,
            entities_processed: self.entities_processed.max(0) as u64,
            duration_ms: self.duration_ms.max(0) as u64,
        })
    }
}

struct RawJob {
    id: String,
    task_id: String,
    origin: String,
    state: String,
    attempts: u32,
    run_at: String,
    created_at: String,
    last_error: Option<String>,
}

fn raw_job(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        task_id: row.get(1)?,
        origin: row.get(2)?,
        state: row.get(3)?,
        attempts: row.get(4)?,
        run_at: row.get(5)?,
        created_at: row.get(6)?,
        last_error: row.get(7)?,
    })
}

impl RawJob {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: parse_uuid(&self.id)?,
            task_id: self.task_id.parse()?,
            origin: JobOrigin::parse(&self.origin).ok_or_else(|| {
                ClubSyncError::Persistence(format!("Unknown job origin '{}'", self.origin))
            })?,
            state: JobState::parse(&self.state).ok_or_else(|| {
                ClubSyncError::Persistence(format!("Unknown job state '{}'", self.state))
            })?,
            attempts: self.attempts,
            run_at: parse_time(&self.run_at)?,
            created_at: parse_time(&self.created_at)?,
            last_error: self.last_error,
        })
    }
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: EntityId(row.get(0)?),
        name: row.get(1)?,
        platform: row.get(2)?,
        external_key: row.get(3)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>> {
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(|e| db_err(what, e))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ClubSyncError::Persistence(format!("Bad timestamp '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| ClubSyncError::Persistence(format!("Bad id '{s}': {e}")))
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn ensure_changed(changed: usize, id: &TaskId) -> Result<()> {
    if changed == 0 {
        return Err(ClubSyncError::task_not_found(id));
    }
    Ok(())
}

fn db_err(what: &str, e: rusqlite::Error) -> ClubSyncError {
    ClubSyncError::Persistence(format!("{what}: {e}"))
}
