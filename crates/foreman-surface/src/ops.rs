//! Typed operation surface exposed to the supervisor worker.
//!
//! Each operation is a tagged record keyed by `method` with a typed
//! `params` payload; malformed input fails deserialization before any
//! dispatch happens. Responses carry `{ method, success, data }`, with
//! errors converted to their transport form.

use foreman_core::{AgentId, AgentKind, ForemanError, TaskRunId};
use foreman_manager::{HistoryQuery, NewTaskConfig, TaskConfigUpdate};
use foreman_registry::{AgentConfigUpdate, AgentFilter, NewAgentConfig};
use serde::{Deserialize, Serialize};

/// Operations against the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum RegistryOp {
    GetAvailableTools {
        kind: AgentKind,
    },
    CreateAgentConfig(NewAgentConfig),
    UpdateAgentConfig(AgentConfigUpdate),
    GetAllAgentConfigs,
    GetAgentConfig {
        kind: AgentKind,
        agent_type: String,
    },
    GetAgentConfigVersion {
        kind: AgentKind,
        agent_type: String,
        version: u32,
    },
    GetActiveAgents {
        #[serde(default)]
        filter: AgentFilter,
    },
    GetAgent {
        agent_id: AgentId,
    },
    GetPoolStats {
        kind: AgentKind,
        agent_type: String,
    },
}

impl RegistryOp {
    pub fn method(&self) -> &'static str {
        match self {
            RegistryOp::GetAvailableTools { .. } => "getAvailableTools",
            RegistryOp::CreateAgentConfig(_) => "createAgentConfig",
            RegistryOp::UpdateAgentConfig(_) => "updateAgentConfig",
            RegistryOp::GetAllAgentConfigs => "getAllAgentConfigs",
            RegistryOp::GetAgentConfig { .. } => "getAgentConfig",
            RegistryOp::GetAgentConfigVersion { .. } => "getAgentConfigVersion",
            RegistryOp::GetActiveAgents { .. } => "getActiveAgents",
            RegistryOp::GetAgent { .. } => "getAgent",
            RegistryOp::GetPoolStats { .. } => "getPoolStats",
        }
    }
}

/// Operations against the task manager. Every call is made on behalf of
/// an acting agent and goes through the access-control gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ManagerOp {
    CreateTaskConfig {
        config: NewTaskConfig,
        owner_agent_id: String,
    },
    UpdateTaskConfig(TaskConfigUpdate),
    DestroyTaskConfig {
        task_type: String,
    },
    CreateTaskRun {
        task_type: String,
        #[serde(default)]
        input: Option<String>,
    },
    ScheduleStartTaskRun {
        run_id: TaskRunId,
    },
    StopTaskRun {
        run_id: TaskRunId,
    },
    DestroyTaskRun {
        run_id: TaskRunId,
    },
    GetAllTaskRuns,
    GetTaskRun {
        run_id: TaskRunId,
    },
    GetTaskRunHistory {
        run_id: TaskRunId,
        #[serde(default)]
        query: HistoryQuery,
    },
    GetPoolStats {
        task_type: String,
    },
    IsTaskRunOccupied {
        run_id: TaskRunId,
    },
}

impl ManagerOp {
    pub fn method(&self) -> &'static str {
        match self {
            ManagerOp::CreateTaskConfig { .. } => "createTaskConfig",
            ManagerOp::UpdateTaskConfig(_) => "updateTaskConfig",
            ManagerOp::DestroyTaskConfig { .. } => "destroyTaskConfig",
            ManagerOp::CreateTaskRun { .. } => "createTaskRun",
            ManagerOp::ScheduleStartTaskRun { .. } => "scheduleStartTaskRun",
            ManagerOp::StopTaskRun { .. } => "stopTaskRun",
            ManagerOp::DestroyTaskRun { .. } => "destroyTaskRun",
            ManagerOp::GetAllTaskRuns => "getAllTaskRuns",
            ManagerOp::GetTaskRun { .. } => "getTaskRun",
            ManagerOp::GetTaskRunHistory { .. } => "getTaskRunHistory",
            ManagerOp::GetPoolStats { .. } => "getPoolStats",
            ManagerOp::IsTaskRunOccupied { .. } => "isTaskRunOccupied",
        }
    }
}

/// Transport form of an operation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResponse {
    pub method: String,
    pub success: bool,
    pub data: serde_json::Value,
}

impl OpResponse {
    pub fn ok(method: &str, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                method: method.to_string(),
                success: true,
                data,
            },
            Err(e) => Self::fail(method, &ForemanError::Json(e)),
        }
    }

    pub fn fail(method: &str, error: &ForemanError) -> Self {
        Self {
            method: method.to_string(),
            success: false,
            data: serde_json::json!({
                "kind": error.kind(),
                "message": error.to_string(),
            }),
        }
    }
}
