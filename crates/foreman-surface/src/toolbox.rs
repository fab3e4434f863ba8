use crate::ops::{ManagerOp, OpResponse, RegistryOp};
use foreman_core::{ForemanError, ForemanResult};
use foreman_manager::TaskManager;
use foreman_registry::AgentRegistry;
use tracing::debug;

const REGISTRY_METHODS: &[&str] = &[
    "getAvailableTools",
    "createAgentConfig",
    "updateAgentConfig",
    "getAllAgentConfigs",
    "getAgentConfig",
    "getAgentConfigVersion",
    "getActiveAgents",
    "getAgent",
    "getPoolStats",
];

const MANAGER_METHODS: &[&str] = &[
    "createTaskConfig",
    "updateTaskConfig",
    "destroyTaskConfig",
    "createTaskRun",
    "scheduleStartTaskRun",
    "stopTaskRun",
    "destroyTaskRun",
    "getAllTaskRuns",
    "getTaskRun",
    "getTaskRunHistory",
    "getPoolStats",
    "isTaskRunOccupied",
];

const CONFIG_MUTATING_METHODS: &[&str] = &["createAgentConfig", "updateAgentConfig"];

/// Routes supervisor operations to the registry and the manager, applying
/// the boot-time feature switches.
pub struct SupervisorToolbox {
    registry: AgentRegistry,
    manager: TaskManager,
    mutable_agent_configs: bool,
}

impl SupervisorToolbox {
    pub fn new(registry: AgentRegistry, manager: TaskManager, mutable_agent_configs: bool) -> Self {
        Self {
            registry,
            manager,
            mutable_agent_configs,
        }
    }

    /// Registry methods currently advertised to the supervisor.
    pub fn registry_methods(&self) -> Vec<&'static str> {
        REGISTRY_METHODS
            .iter()
            .copied()
            .filter(|m| self.mutable_agent_configs || !CONFIG_MUTATING_METHODS.contains(m))
            .collect()
    }

    /// Manager methods advertised to the supervisor.
    pub fn manager_methods(&self) -> Vec<&'static str> {
        MANAGER_METHODS.to_vec()
    }

    /// Dispatch one registry operation.
    pub async fn registry_call(&self, op: RegistryOp) -> OpResponse {
        let method = op.method();
        debug!(method, "registry operation");
        match self.dispatch_registry(op).await {
            Ok(data) => OpResponse {
                method: method.to_string(),
                success: true,
                data,
            },
            Err(e) => OpResponse::fail(method, &e),
        }
    }

    /// Dispatch one manager operation on behalf of `acting`.
    pub async fn manager_call(&self, op: ManagerOp, acting: &str) -> OpResponse {
        let method = op.method();
        debug!(method, acting, "manager operation");
        match self.dispatch_manager(op, acting).await {
            Ok(data) => OpResponse {
                method: method.to_string(),
                success: true,
                data,
            },
            Err(e) => OpResponse::fail(method, &e),
        }
    }

    /// Parse and dispatch a raw registry operation.
    pub async fn registry_call_value(&self, value: serde_json::Value) -> OpResponse {
        match serde_json::from_value::<RegistryOp>(value) {
            Ok(op) => self.registry_call(op).await,
            Err(e) => OpResponse::fail("unknown", &ForemanError::Json(e)),
        }
    }

    /// Parse and dispatch a raw manager operation.
    pub async fn manager_call_value(&self, value: serde_json::Value, acting: &str) -> OpResponse {
        match serde_json::from_value::<ManagerOp>(value) {
            Ok(op) => self.manager_call(op, acting).await,
            Err(e) => OpResponse::fail("unknown", &ForemanError::Json(e)),
        }
    }

    async fn dispatch_registry(&self, op: RegistryOp) -> ForemanResult<serde_json::Value> {
        if !self.mutable_agent_configs && CONFIG_MUTATING_METHODS.contains(&op.method()) {
            return Err(ForemanError::IllegalState(format!(
                "method '{}' is not available: agent configs are immutable",
                op.method()
            )));
        }
        let data = match op {
            RegistryOp::GetAvailableTools { kind } => {
                serde_json::to_value(self.registry.available_tools(kind).await)?
            }
            RegistryOp::CreateAgentConfig(config) => {
                serde_json::to_value(self.registry.create_agent_config(config).await?)?
            }
            RegistryOp::UpdateAgentConfig(update) => {
                serde_json::to_value(self.registry.update_agent_config(update).await?)?
            }
            RegistryOp::GetAllAgentConfigs => {
                serde_json::to_value(self.registry.get_all_agent_configs().await)?
            }
            RegistryOp::GetAgentConfig { kind, agent_type } => serde_json::to_value(
                self.registry.get_agent_config(kind, &agent_type, None).await?,
            )?,
            RegistryOp::GetAgentConfigVersion {
                kind,
                agent_type,
                version,
            } => serde_json::to_value(
                self.registry
                    .get_agent_config(kind, &agent_type, Some(version))
                    .await?,
            )?,
            RegistryOp::GetActiveAgents { filter } => {
                serde_json::to_value(self.registry.get_active_agents(&filter).await)?
            }
            RegistryOp::GetAgent { agent_id } => {
                serde_json::to_value(self.registry.get_agent(&agent_id).await?)?
            }
            RegistryOp::GetPoolStats { kind, agent_type } => {
                serde_json::to_value(self.registry.get_pool_stats(kind, &agent_type).await?)?
            }
        };
        Ok(data)
    }

    async fn dispatch_manager(&self, op: ManagerOp, acting: &str) -> ForemanResult<serde_json::Value> {
        let data = match op {
            ManagerOp::CreateTaskConfig {
                config,
                owner_agent_id,
            } => serde_json::to_value(
                self.manager
                    .create_task_config(config, &owner_agent_id, acting)
                    .await?,
            )?,
            ManagerOp::UpdateTaskConfig(update) => {
                serde_json::to_value(self.manager.update_task_config(update, acting).await?)?
            }
            ManagerOp::DestroyTaskConfig { task_type } => {
                self.manager.destroy_task_config(&task_type, acting).await?;
                serde_json::json!({ "task_type": task_type })
            }
            ManagerOp::CreateTaskRun { task_type, input } => {
                serde_json::to_value(self.manager.create_task_run(&task_type, input, acting).await?)?
            }
            ManagerOp::ScheduleStartTaskRun { run_id } => {
                self.manager.schedule_start_task_run(&run_id, acting).await?;
                serde_json::json!({ "run_id": run_id })
            }
            ManagerOp::StopTaskRun { run_id } => {
                self.manager.stop_task_run(&run_id, acting).await?;
                serde_json::json!({ "run_id": run_id })
            }
            ManagerOp::DestroyTaskRun { run_id } => {
                self.manager.destroy_task_run(&run_id, acting).await?;
                serde_json::json!({ "run_id": run_id })
            }
            ManagerOp::GetAllTaskRuns => {
                serde_json::to_value(self.manager.get_all_task_runs(acting).await)?
            }
            ManagerOp::GetTaskRun { run_id } => {
                serde_json::to_value(self.manager.get_task_run(&run_id, acting).await?)?
            }
            ManagerOp::GetTaskRunHistory { run_id, query } => serde_json::to_value(
                self.manager
                    .get_task_run_history(&run_id, &query, acting)
                    .await?,
            )?,
            ManagerOp::GetPoolStats { task_type } => {
                serde_json::to_value(self.manager.get_pool_stats(&task_type, acting).await?)?
            }
            ManagerOp::IsTaskRunOccupied { run_id } => {
                serde_json::to_value(self.manager.is_task_run_occupied(&run_id, acting).await?)?
            }
        };
        Ok(data)
    }
}
