//! Task definitions: the core data model for scheduled collection work.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClubSyncError, Result};

/// Minimum allowed collection frequency.
pub const MIN_FREQUENCY_MINUTES: u32 = 5;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = ClubSyncError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ClubSyncError::Configuration(format!("Invalid task id '{s}': {e}")))
    }
}

/// Identifier of a target entity (a club) in the entity registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recurring day/hour window during which a task may run.
///
/// Days use 0 = Sunday .. 6 = Saturday. Hours are local to `timezone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub days_of_week: BTreeSet<u32>,
    /// IANA name or abbreviation understood by `chrono-tz` ("EST", "Europe/London").
    pub timezone: String,
}

impl ScheduleWindow {
    pub fn new(start_hour: u32, end_hour: u32, days: &[u32], timezone: &str) -> Self {
        Self {
            start_hour,
            end_hour,
            days_of_week: days.iter().copied().collect(),
            timezone: timezone.to_string(),
        }
    }

    /// Parse the timezone label.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|_| {
            ClubSyncError::Configuration(format!("Unknown timezone '{}'", self.timezone))
        })
    }

    /// Reject windows the next-run calculator cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.start_hour > 23 || self.end_hour > 23 {
            return Err(ClubSyncError::Configuration(format!(
                "Hours must be within 0-23 (start={}, end={})",
                self.start_hour, self.end_hour
            )));
        }
        if self.days_of_week.is_empty() {
            return Err(ClubSyncError::Configuration(
                "Schedule window needs at least one day of week".into(),
            ));
        }
        if let Some(day) = self.days_of_week.iter().find(|d| **d > 6) {
            return Err(ClubSyncError::Configuration(format!(
                "Day of week {day} out of range 0-6"
            )));
        }
        self.tz()?;
        Ok(())
    }
}

/// How a task talks to the data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSettings {
    /// Key into the configured data sources ("chesscom", "lichess", ...).
    pub platform: String,
    /// What to collect per entity ("members", "matches", ...).
    pub task_type: String,
    pub frequency_minutes: u32,
    /// Retries after the first failed fetch of an entity.
    pub retry_attempts: u32,
    pub retry_delay_minutes: u32,
}

impl CollectionSettings {
    pub fn new(platform: &str, task_type: &str) -> Self {
        Self {
            platform: platform.to_string(),
            task_type: task_type.to_string(),
            frequency_minutes: 60,
            retry_attempts: 3,
            retry_delay_minutes: 5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            return Err(ClubSyncError::Configuration("Platform is required".into()));
        }
        if self.task_type.trim().is_empty() {
            return Err(ClubSyncError::Configuration("Task type is required".into()));
        }
        if self.frequency_minutes < MIN_FREQUENCY_MINUTES {
            return Err(ClubSyncError::Configuration(format!(
                "Frequency must be at least {MIN_FREQUENCY_MINUTES} minutes (got {})",
                self.frequency_minutes
            )));
        }
        if self.retry_delay_minutes < 1 {
            return Err(ClubSyncError::Configuration(
                "Retry delay must be at least 1 minute".into(),
            ));
        }
        Ok(())
    }
}

/// A configured periodic collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Unique across the store.
    pub name: String,
    pub description: String,
    pub active: bool,
    pub owner_id: String,
    pub window: ScheduleWindow,
    pub settings: CollectionSettings,
    /// Processed in this order on every run.
    pub targets: Vec<EntityId>,
    pub last_run: Option<DateTime<Utc>>,
    /// Always `None` while `active` is false.
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create an active task. `next_run` is left for the caller to compute.
    pub fn new(
        name: &str,
        owner_id: &str,
        window: ScheduleWindow,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: String::new(),
            active: true,
            owner_id: owner_id.to_string(),
            window,
            settings,
            targets: Vec::new(),
            last_run: None,
            next_run: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(|t| EntityId(t.into())).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ClubSyncError::Configuration("Task name is required".into()));
        }
        self.window.validate()?;
        self.settings.validate()
    }

    /// Check if this task should be picked up by the trigger loop.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run.is_some_and(|next| next <= now)
    }
}

/// Status column of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Partial,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one run, tagged by status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Every reachable entity was fetched.
    Success,
    /// A fetch failed after earlier entities were collected.
    Partial { error: String },
    /// A fetch failed before anything was collected.
    Error { error: String },
}

impl Outcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Outcome::Success => ExecutionStatus::Success,
            Outcome::Partial { .. } => ExecutionStatus::Partial,
            Outcome::Error { .. } => ExecutionStatus::Error,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::Partial { error } | Outcome::Error { error } => Some(error),
        }
    }

    /// Rebuild from the stored status column + optional message.
    pub fn from_parts(status: &str, error: Option<String>) -> Result<Self> {
        match status {
            "success" => Ok(Outcome::Success),
            "partial" => Ok(Outcome::Partial {
                error: error.unwrap_or_default(),
            }),
            "error" => Ok(Outcome::Error {
                error: error.unwrap_or_default(),
            }),
            other => Err(ClubSyncError::Persistence(format!(
                "Unknown execution status '{other}'"
            ))),
        }
    }
}

/// One historical outcome of a task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub items_collected: u64,
    pub entities_processed: u64,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn status(&self) -> ExecutionStatus {
        self.outcome.status()
    }

    pub fn error(&self) -> Option<&str> {
        self.outcome.error()
    }
}

/// A target unit a task iterates over (source term: club).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub platform: String,
    /// Identifier the data source understands (slug, team id, ...).
    pub external_key: String,
}
