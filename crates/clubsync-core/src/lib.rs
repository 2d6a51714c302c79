//! # ClubSync Core
//!
//! Shared data model, error taxonomy, configuration and the collaborator
//! contracts (task store, entity registry, data source) the scheduling engine
//! is written against.

pub mod clock;
pub mod config;
pub mod error;
pub mod task;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClubSyncConfig;
pub use error::{ClubSyncError, Result};
pub use task::{
    CollectionSettings, Entity, EntityId, ExecutionRecord, ExecutionStatus, Outcome,
    ScheduleWindow, Task, TaskId,
};
pub use traits::{DataSource, EntityDescriptor, EntityRegistry, TaskStore};
