use foreman_core::{AgentKind, TaskConfigId};
use serde::{Deserialize, Serialize};

/// How many runs of one definition may execute at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Bounded only by the configured cap.
    None,
    /// A single run at a time.
    Exclusive,
}

/// One version of a task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_type: String,
    /// Default input handed to runs created without an explicit one.
    pub input: String,
    pub description: String,
    /// Re-run cadence for successful runs; zero means single-shot.
    pub interval_ms: u64,
    /// Queue a freshly created run without an explicit schedule call.
    pub run_immediately: bool,
    /// Failed attempts retried before the run is given up. `None` means
    /// no retries.
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    /// Bound on total completed attempts; `None` means unbounded.
    pub max_repeats: Option<u32>,
    /// Worker template runs of this definition execute on.
    pub agent_kind: AgentKind,
    pub agent_type: String,
    pub concurrency_mode: ConcurrencyMode,
    pub owner_agent_id: String,
    pub version: u32,
}

impl TaskConfig {
    pub fn config_id(&self) -> TaskConfigId {
        TaskConfigId::new(self.task_type.clone(), self.version)
    }
}

/// Input for creating version 1 of a definition. The owner is supplied
/// separately by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskConfig {
    pub task_type: String,
    pub input: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default)]
    pub run_immediately: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_repeats: Option<u32>,
    pub agent_kind: AgentKind,
    pub agent_type: String,
    #[serde(default = "default_concurrency")]
    pub concurrency_mode: ConcurrencyMode,
}

fn default_concurrency() -> ConcurrencyMode {
    ConcurrencyMode::None
}

impl NewTaskConfig {
    pub(crate) fn into_config(self, owner_agent_id: String, version: u32) -> TaskConfig {
        TaskConfig {
            task_type: self.task_type,
            input: self.input,
            description: self.description,
            interval_ms: self.interval_ms,
            run_immediately: self.run_immediately,
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            max_repeats: self.max_repeats,
            agent_kind: self.agent_kind,
            agent_type: self.agent_type,
            concurrency_mode: self.concurrency_mode,
            owner_agent_id,
            version,
        }
    }
}

/// Explicit per-field overrides producing the next version. Absent fields
/// carry over; the owner never changes through an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfigUpdate {
    pub task_type: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub run_immediately: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<Option<u32>>,
    #[serde(default)]
    pub retry_delay_ms: Option<Option<u64>>,
    #[serde(default)]
    pub max_repeats: Option<Option<u32>>,
    #[serde(default)]
    pub agent_kind: Option<AgentKind>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub concurrency_mode: Option<ConcurrencyMode>,
}

impl TaskConfigUpdate {
    /// An update that changes nothing, as a base for field overrides.
    pub fn for_type(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            input: None,
            description: None,
            interval_ms: None,
            run_immediately: None,
            max_retries: None,
            retry_delay_ms: None,
            max_repeats: None,
            agent_kind: None,
            agent_type: None,
            concurrency_mode: None,
        }
    }

    pub(crate) fn apply(self, previous: &TaskConfig) -> TaskConfig {
        TaskConfig {
            task_type: previous.task_type.clone(),
            input: self.input.unwrap_or_else(|| previous.input.clone()),
            description: self
                .description
                .unwrap_or_else(|| previous.description.clone()),
            interval_ms: self.interval_ms.unwrap_or(previous.interval_ms),
            run_immediately: self.run_immediately.unwrap_or(previous.run_immediately),
            max_retries: self.max_retries.unwrap_or(previous.max_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(previous.retry_delay_ms),
            max_repeats: self.max_repeats.unwrap_or(previous.max_repeats),
            agent_kind: self.agent_kind.unwrap_or(previous.agent_kind),
            agent_type: self
                .agent_type
                .unwrap_or_else(|| previous.agent_type.clone()),
            concurrency_mode: self.concurrency_mode.unwrap_or(previous.concurrency_mode),
            owner_agent_id: previous.owner_agent_id.clone(),
            version: previous.version + 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base() -> TaskConfig {
        NewTaskConfig {
            task_type: "poem_generation".into(),
            input: "write a poem".into(),
            description: String::new(),
            interval_ms: 0,
            run_immediately: true,
            max_retries: Some(2),
            retry_delay_ms: Some(0),
            max_repeats: Some(1),
            agent_kind: AgentKind::Operator,
            agent_type: "poet".into(),
            concurrency_mode: ConcurrencyMode::Exclusive,
        }
        .into_config("supervisor:main[1]:v1".into(), 1)
    }

    #[test]
    fn test_config_id() {
        assert_eq!(base().config_id().to_string(), "task:poem_generation:v1");
    }

    #[test]
    fn test_update_bumps_version_and_keeps_owner() {
        let cfg = base();
        let update = TaskConfigUpdate {
            interval_ms: Some(5_000),
            max_retries: Some(None),
            ..TaskConfigUpdate::for_type("poem_generation")
        };
        let next = update.apply(&cfg);
        assert_eq!(next.version, 2);
        assert_eq!(next.interval_ms, 5_000);
        assert_eq!(next.max_retries, None);
        assert_eq!(next.max_repeats, Some(1));
        assert_eq!(next.owner_agent_id, cfg.owner_agent_id);
    }

    #[test]
    fn test_new_config_serde_defaults() {
        let new: NewTaskConfig = serde_json::from_str(
            r#"{"task_type": "t", "input": "x", "agent_kind": "operator", "agent_type": "poet"}"#,
        )
        .unwrap();
        assert_eq!(new.concurrency_mode, ConcurrencyMode::None);
        assert!(!new.run_immediately);
        assert_eq!(new.max_retries, None);
    }
}
