use crate::config::TaskConfig;
use chrono::{DateTime, Utc};
use foreman_core::{AgentId, TaskRunId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Lifecycle of one run. `Removed` only appears in the destroy event; a
/// removed run is gone from the run map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Created,
    Scheduled,
    Executing,
    Waiting,
    Completed,
    Failed,
    Stopped,
    Removed,
}

impl TaskRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskRunStatus::Completed
                | TaskRunStatus::Failed
                | TaskRunStatus::Stopped
                | TaskRunStatus::Removed
        )
    }
}

/// Terminal outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed,
    Failed,
    Stopped,
}

/// One record in a run's history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: AttemptOutcome,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub run_number: u32,
    pub retry_attempt: u32,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    pub execution_time_ms: u64,
}

/// One instantiation of a task definition.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub status: TaskRunStatus,
    pub input: String,
    /// Definition snapshot taken at creation; later config versions do
    /// not affect an existing run.
    pub config: TaskConfig,
    pub occupied_by: Option<AgentId>,
    pub occupied_since: Option<DateTime<Utc>>,
    pub current_retry_attempt: u32,
    pub error_count: u32,
    pub completed_runs: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Identity whose authority queued the run; interval and retry
    /// re-scheduling reuse it.
    pub scheduled_by: Option<String>,
    /// Bumped on every occupation change so stale timeout timers can
    /// detect they fired for an earlier occupation.
    #[serde(skip)]
    pub(crate) occupancy_epoch: u64,
    #[serde(skip)]
    history: VecDeque<HistoryEntry>,
}

impl TaskRun {
    pub fn new(id: TaskRunId, input: String, config: TaskConfig) -> Self {
        Self {
            id,
            status: TaskRunStatus::Created,
            input,
            config,
            occupied_by: None,
            occupied_since: None,
            current_retry_attempt: 0,
            error_count: 0,
            completed_runs: 0,
            last_run_at: None,
            next_run_at: None,
            created_at: Utc::now(),
            scheduled_by: None,
            occupancy_epoch: 0,
            history: VecDeque::new(),
        }
    }

    /// Append an entry, evicting the oldest once the ring is full.
    pub fn push_history(&mut self, entry: HistoryEntry, max_entries: usize) {
        if max_entries > 0 && self.history.len() >= max_entries {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Compact snapshot used in events and listings.
    pub fn view(&self) -> TaskRunView {
        TaskRunView {
            run_id: self.id.clone(),
            status: self.status,
            input: self.input.clone(),
            occupied_by: self.occupied_by.clone(),
            current_retry_attempt: self.current_retry_attempt,
            error_count: self.error_count,
            completed_runs: self.completed_runs,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
        }
    }
}

/// Status snapshot of a run, without config or history.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRunView {
    pub run_id: TaskRunId,
    pub status: TaskRunStatus,
    pub input: String,
    pub occupied_by: Option<AgentId>,
    pub current_retry_attempt: u32,
    pub error_count: u32,
    pub completed_runs: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Options for history reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Keep at most this many entries, preferring the newest.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Return newest entries first.
    #[serde(default)]
    pub newest_first: bool,
}

/// Per-definition run counts, grouped by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPoolStats {
    pub task_type: String,
    pub total: usize,
    pub created: usize,
    pub scheduled: usize,
    pub executing: usize,
    pub waiting: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl TaskPoolStats {
    pub fn count(&mut self, status: TaskRunStatus) {
        self.total += 1;
        match status {
            TaskRunStatus::Created => self.created += 1,
            TaskRunStatus::Scheduled => self.scheduled += 1,
            TaskRunStatus::Executing => self.executing += 1,
            TaskRunStatus::Waiting => self.waiting += 1,
            TaskRunStatus::Completed => self.completed += 1,
            TaskRunStatus::Failed => self.failed += 1,
            TaskRunStatus::Stopped => self.stopped += 1,
            TaskRunStatus::Removed => {}
        }
    }
}
