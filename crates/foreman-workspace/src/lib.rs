//! Workspace persistence and event streaming.
//!
//! Two concerns live here: the named on-disk [`Workspace`] that holds
//! owner-tagged JSONL definition snapshots, and the rotating [`EventLog`]
//! streams external monitors tail.

pub mod event_log;
pub mod events;
pub mod workspace;

pub use event_log::{read_records, EventLog, EventRecord, LOG_INIT};
pub use workspace::{Workspace, WorkspaceScope};
