//! Boot assembly for the whole control plane.
//!
//! Everything with init-once semantics (workspace, event streams) is
//! created here and injected; components never reach for process-wide
//! state. The registry⇄manager cycle is broken by binding the registry's
//! observer after the manager exists.

use crate::toolbox::SupervisorToolbox;
use async_trait::async_trait;
use foreman_core::{AgentKind, ControlPlaneConfig, ForemanResult, RegistryObserver};
use foreman_manager::{ManagerTuning, TaskManager, TaskStarter};
use foreman_registry::{AgentLifecycle, AgentRegistry};
use foreman_workspace::{events, EventLog, Workspace};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Observer slot bound after construction, so the registry can be built
/// before the manager that listens to it.
#[derive(Default)]
struct LateObserver {
    manager: OnceLock<TaskManager>,
}

impl LateObserver {
    fn bind(&self, manager: TaskManager) {
        if self.manager.set(manager).is_err() {
            warn!("registry observer was already bound");
        }
    }
}

#[async_trait]
impl RegistryObserver for LateObserver {
    async fn agent_config_created(&self, kind: AgentKind, agent_type: &str) {
        if let Some(manager) = self.manager.get() {
            manager.register_agent_type(kind, agent_type).await;
        }
    }

    async fn agent_available(&self, kind: AgentKind, agent_type: &str, version: u32, count: usize) {
        if let Some(manager) = self.manager.get() {
            manager.agent_available(kind, agent_type, version, count).await;
        }
    }
}

/// The assembled control plane: workspace, event streams, registry,
/// manager, and the supervisor toolbox, with the dispatch loop running.
pub struct ControlPlane {
    workspace: Workspace,
    registry: AgentRegistry,
    manager: TaskManager,
    toolbox: SupervisorToolbox,
    scheduler: tokio::task::JoinHandle<()>,
}

impl ControlPlane {
    /// Open the workspace and logs under `root`, wire the components,
    /// replay persisted definitions per the feature switches, and start
    /// the dispatch loop.
    pub async fn start(
        root: impl AsRef<Path>,
        workspace_name: &str,
        config: ControlPlaneConfig,
        lifecycle: Arc<dyn AgentLifecycle>,
        starter: Arc<dyn TaskStarter>,
    ) -> ForemanResult<Self> {
        let root = root.as_ref();
        let workspace = Workspace::open(root, workspace_name).await?;
        let logs_dir = root.join("logs");
        let agent_events = EventLog::open(&logs_dir, events::AGENT_STREAM).await?;
        let task_events = EventLog::open(&logs_dir, events::TASK_STREAM).await?;

        let observer = Arc::new(LateObserver::default());
        let registry = AgentRegistry::new(
            lifecycle,
            observer.clone(),
            agent_events.clone(),
            workspace.scope("agent_registry"),
            config.cleanup_tick_ms,
        );
        let manager = TaskManager::new(
            Arc::new(registry.clone()),
            starter,
            task_events,
            agent_events,
            workspace.scope("task_manager"),
            ManagerTuning {
                occupancy_timeout_ms: config.occupancy_timeout_ms,
                max_history_entries: config.max_history_entries,
                unbounded_concurrency_cap: config.unbounded_concurrency_cap,
            },
        );
        observer.bind(manager.clone());

        if config.agent_registry.restoration {
            registry.restore().await?;
        }
        if config.task_manager.restoration {
            manager.restore().await?;
        }

        let scheduler = manager.spawn_scheduler(config.scheduler_tick_ms);
        let toolbox = SupervisorToolbox::new(
            registry.clone(),
            manager.clone(),
            config.agent_registry.mutable_agent_configs,
        );
        info!(workspace = workspace_name, "control plane started");

        Ok(Self {
            workspace,
            registry,
            manager,
            toolbox,
            scheduler,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn toolbox(&self) -> &SupervisorToolbox {
        &self.toolbox
    }

    /// Stop the dispatch loop. In-flight worker reports still land.
    pub fn shutdown(&self) {
        self.scheduler.abort();
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.scheduler.abort();
    }
}
