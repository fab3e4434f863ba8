//! Task manager: versioned task definitions, run routing and scheduling,
//! retry policy, occupancy tracking, history, and the access-control gate
//! in front of every operation.
//!
//! # Main types
//!
//! - [`TaskManager`] — definition store and run scheduler.
//! - [`TaskConfig`] / [`TaskConfigUpdate`] — versioned definitions.
//! - [`TaskRun`] / [`HistoryEntry`] — runs and their attempt history.
//! - [`TaskStarter`] / [`RunCallbacks`] — seam to the external executor.

pub mod config;
pub mod manager;
pub mod run;

pub use config::{ConcurrencyMode, NewTaskConfig, TaskConfig, TaskConfigUpdate};
pub use manager::{
    ManagerTuning, RunCallbacks, TaskManager, TaskStarter, MANAGER_ROOT, SNAPSHOT_FILE,
};
pub use run::{
    AttemptOutcome, HistoryEntry, HistoryQuery, TaskPoolStats, TaskRun, TaskRunStatus, TaskRunView,
};
