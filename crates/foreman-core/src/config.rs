//! Boot-time configuration.
//!
//! A single typed struct passed when the control plane is assembled; there
//! are no mutable process-wide flags. Every field has a serde default so a
//! partial JSON document (or `Default::default()`) yields a working setup.

use serde::{Deserialize, Serialize};

/// Feature switches and tuning knobs for the whole control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub agent_registry: RegistryOptions,
    #[serde(default)]
    pub task_manager: ManagerOptions,
    /// Cadence of the run-dispatch tick.
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    /// Cadence of the stale-pool sweep tick.
    #[serde(default = "default_cleanup_tick_ms")]
    pub cleanup_tick_ms: u64,
    /// How long a run may sit occupied before the manager force-releases
    /// the worker.
    #[serde(default = "default_occupancy_timeout_ms")]
    pub occupancy_timeout_ms: u64,
    /// Ring bound on per-run history.
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,
    /// Concurrent-run cap applied when a task declares no exclusivity.
    #[serde(default = "default_unbounded_concurrency_cap")]
    pub unbounded_concurrency_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryOptions {
    /// When false, config-mutating operations are hidden from the
    /// supervisor surface.
    #[serde(default = "default_true")]
    pub mutable_agent_configs: bool,
    /// When false, the workspace snapshot is not replayed at boot.
    #[serde(default = "default_true")]
    pub restoration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerOptions {
    /// When false, the workspace snapshot is not replayed at boot.
    #[serde(default = "default_true")]
    pub restoration: bool,
}

fn default_true() -> bool {
    true
}

fn default_scheduler_tick_ms() -> u64 {
    100
}

fn default_cleanup_tick_ms() -> u64 {
    1_000
}

fn default_occupancy_timeout_ms() -> u64 {
    30 * 60 * 1_000
}

fn default_max_history_entries() -> usize {
    50
}

fn default_unbounded_concurrency_cap() -> usize {
    100
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            agent_registry: RegistryOptions::default(),
            task_manager: ManagerOptions::default(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            cleanup_tick_ms: default_cleanup_tick_ms(),
            occupancy_timeout_ms: default_occupancy_timeout_ms(),
            max_history_entries: default_max_history_entries(),
            unbounded_concurrency_cap: default_unbounded_concurrency_cap(),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            mutable_agent_configs: true,
            restoration: true,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { restoration: true }
    }
}
