//! The task manager: definition history, run routing, scheduling, retry,
//! occupancy, and history.
//!
//! All state sits behind one lock. Worker release goes through the narrow
//! [`AgentAcquirer`] seam and is always performed after the manager lock is
//! dropped, so the registry may call into the manager (via its observer)
//! without deadlock.

use crate::config::{ConcurrencyMode, NewTaskConfig, TaskConfig, TaskConfigUpdate};
use crate::run::{
    AttemptOutcome, HistoryEntry, HistoryQuery, TaskPoolStats, TaskRun, TaskRunStatus, TaskRunView,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use foreman_access::{Permissions, ResourceRegistry};
use foreman_core::{
    AgentAcquirer, AgentId, AgentKind, ForemanError, ForemanResult, RegistryObserver, TaskConfigId,
    TaskRunId,
};
use foreman_workspace::{events, EventLog, WorkspaceScope};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Root resource gating manager-wide operations; admin agents hold FULL
/// on it.
pub const MANAGER_ROOT: &str = "task_manager";

/// Snapshot file the manager owns inside the workspace.
pub const SNAPSHOT_FILE: &str = "task_manager.jsonl";

/// External executor of runs. The scheduler hands it a run snapshot plus
/// callbacks; the implementation acquires a worker, drives it, and reports
/// the outcome through the callbacks (possibly long after returning).
#[async_trait]
pub trait TaskStarter: Send + Sync {
    async fn on_task_start(&self, run: TaskRun, callbacks: RunCallbacks) -> ForemanResult<()>;
}

/// Tuning knobs owned by the manager.
#[derive(Debug, Clone)]
pub struct ManagerTuning {
    pub occupancy_timeout_ms: u64,
    pub max_history_entries: usize,
    pub unbounded_concurrency_cap: usize,
}

impl Default for ManagerTuning {
    fn default() -> Self {
        Self {
            occupancy_timeout_ms: 30 * 60 * 1_000,
            max_history_entries: 50,
            unbounded_concurrency_cap: 100,
        }
    }
}

struct StartRequest {
    run_id: TaskRunId,
    acting: String,
}

struct ConfigHistory {
    latest: u32,
    versions: BTreeMap<u32, TaskConfig>,
}

struct ManagerState {
    access: ResourceRegistry,
    agent_types: HashSet<(AgentKind, String)>,
    configs: HashMap<String, ConfigHistory>,
    runs: HashMap<TaskRunId, TaskRun>,
    /// Runs ever created per (type, version); the next run number is
    /// `counter + 1`.
    run_counters: HashMap<(String, u32), u32>,
    start_queue: VecDeque<StartRequest>,
    queued: HashSet<TaskRunId>,
    /// Runs parked for lack of workers, oldest first.
    waiting: VecDeque<TaskRunId>,
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    acquirer: Arc<dyn AgentAcquirer>,
    starter: Arc<dyn TaskStarter>,
    task_events: EventLog,
    agent_events: EventLog,
    scope: WorkspaceScope,
    tuning: ManagerTuning,
}

/// Task definition store, run scheduler, and history keeper.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

/// Per-run callback handle passed to the external executor. Reports are
/// ignored once the run has reached a terminal state.
#[derive(Clone)]
pub struct RunCallbacks {
    pub(crate) manager: TaskManager,
    pub(crate) run_id: TaskRunId,
}

impl RunCallbacks {
    pub fn run_id(&self) -> &TaskRunId {
        &self.run_id
    }

    /// No worker could be acquired; the run goes back to waiting and is
    /// revived on the next availability announcement.
    pub async fn awaiting_agent_acquired(&self) {
        self.manager.handle_acquire_failed(&self.run_id).await;
    }

    /// A worker was acquired for the run; the manager records occupancy
    /// and arms the occupancy timeout.
    pub async fn agent_acquired(&self, agent_id: AgentId) {
        self.manager.handle_acquired(&self.run_id, agent_id).await;
    }

    /// The worker finished the attempt successfully.
    pub async fn agent_complete(&self, output: impl Into<String> + Send, agent_id: AgentId) {
        self.manager
            .handle_complete(&self.run_id, output.into(), agent_id)
            .await;
    }

    /// The worker failed the attempt.
    pub async fn agent_error(&self, error: impl Into<String> + Send, agent_id: AgentId) {
        self.manager
            .handle_error(&self.run_id, error.into(), agent_id)
            .await;
    }
}

impl TaskManager {
    pub fn new(
        acquirer: Arc<dyn AgentAcquirer>,
        starter: Arc<dyn TaskStarter>,
        task_events: EventLog,
        agent_events: EventLog,
        scope: WorkspaceScope,
        tuning: ManagerTuning,
    ) -> Self {
        let mut access = ResourceRegistry::new();
        access
            .register_resource(MANAGER_ROOT, MANAGER_ROOT)
            .expect("fresh registry has no root resource");
        Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState {
                    access,
                    agent_types: HashSet::new(),
                    configs: HashMap::new(),
                    runs: HashMap::new(),
                    run_counters: HashMap::new(),
                    start_queue: VecDeque::new(),
                    queued: HashSet::new(),
                    waiting: VecDeque::new(),
                }),
                acquirer,
                starter,
                task_events,
                agent_events,
                scope,
                tuning,
            }),
        }
    }

    /// Grant an identity FULL on the manager root, which overrides every
    /// per-resource check.
    pub async fn register_admin_agent(&self, agent_id: &str) -> ForemanResult<()> {
        let mut state = self.inner.state.lock().await;
        state.access.grant(MANAGER_ROOT, agent_id, Permissions::FULL)?;
        info!(agent_id, "registered admin agent");
        Ok(())
    }

    /// Declare a worker template runs may target. Normally driven by the
    /// registry's observer.
    pub async fn register_agent_type(&self, kind: AgentKind, agent_type: &str) {
        let mut state = self.inner.state.lock().await;
        if state.agent_types.insert((kind, agent_type.to_string())) {
            self.inner.task_events.append(
                events::task::AGENT_TYPE_REGISTER,
                json!({ "kind": kind, "agent_type": agent_type }),
            );
            debug!(kind = %kind, agent_type, "registered agent type");
        }
    }

    /// Write version 1 of a definition.
    pub async fn create_task_config(
        &self,
        new: NewTaskConfig,
        owner_agent_id: &str,
        acting: &str,
    ) -> ForemanResult<TaskConfig> {
        let mut state = self.inner.state.lock().await;
        Self::authorize(&state, MANAGER_ROOT, acting, Permissions::WRITE)?;
        if state.configs.contains_key(&new.task_type) {
            return Err(ForemanError::DuplicateType(format!("task:{}", new.task_type)));
        }
        if !state
            .agent_types
            .contains(&(new.agent_kind, new.agent_type.clone()))
        {
            return Err(ForemanError::UnknownAgentType(format!(
                "{}:{}",
                new.agent_kind, new.agent_type
            )));
        }

        let config = new.into_config(owner_agent_id.to_string(), 1);
        let config_id = config.config_id().to_string();
        state
            .access
            .register_resource(config_id.as_str(), owner_agent_id)?;
        state
            .access
            .grant(&config_id, owner_agent_id, Permissions::READ_EXECUTE)?;
        state
            .configs
            .insert(config.task_type.clone(), ConfigHistory {
                latest: 1,
                versions: BTreeMap::from([(1, config.clone())]),
            });
        self.inner
            .task_events
            .append(events::task::CONFIG_CREATE, json!(config));
        self.persist(&state).await?;
        info!(config_id = %config_id, "task config created");
        Ok(config)
    }

    /// Produce the next version of a definition. Requires READ+WRITE on
    /// the current version's id.
    pub async fn update_task_config(
        &self,
        update: TaskConfigUpdate,
        acting: &str,
    ) -> ForemanResult<TaskConfig> {
        let mut state = self.inner.state.lock().await;
        let history = state
            .configs
            .get(&update.task_type)
            .ok_or_else(|| ForemanError::NotFound(format!("task config task:{}", update.task_type)))?;
        let previous = history
            .versions
            .get(&history.latest)
            .expect("latest version present")
            .clone();
        let current_id = previous.config_id().to_string();
        Self::authorize(&state, &current_id, acting, Permissions::READ_WRITE)?;

        let config = update.apply(&previous);
        if !state
            .agent_types
            .contains(&(config.agent_kind, config.agent_type.clone()))
        {
            return Err(ForemanError::UnknownAgentType(format!(
                "{}:{}",
                config.agent_kind, config.agent_type
            )));
        }

        let config_id = config.config_id().to_string();
        state
            .access
            .register_resource(config_id.as_str(), previous.owner_agent_id.as_str())?;
        state.access.grant(
            &config_id,
            &previous.owner_agent_id,
            Permissions::READ_EXECUTE,
        )?;
        let history = state
            .configs
            .get_mut(&config.task_type)
            .expect("checked above");
        history.latest = config.version;
        history.versions.insert(config.version, config.clone());
        self.inner
            .task_events
            .append(events::task::CONFIG_UPDATE, json!(config));
        self.persist(&state).await?;
        info!(config_id = %config_id, "task config updated");
        Ok(config)
    }

    /// Remove a definition (every version). Requires READ+WRITE on every
    /// version's id, and no non-terminal runs may remain.
    pub async fn destroy_task_config(&self, task_type: &str, acting: &str) -> ForemanResult<()> {
        let mut state = self.inner.state.lock().await;
        let history = state
            .configs
            .get(task_type)
            .ok_or_else(|| ForemanError::NotFound(format!("task config task:{task_type}")))?;
        let version_ids: Vec<String> = history
            .versions
            .keys()
            .map(|v| TaskConfigId::new(task_type, *v).to_string())
            .collect();
        for id in &version_ids {
            Self::authorize(&state, id, acting, Permissions::READ_WRITE)?;
        }
        let active = state
            .runs
            .values()
            .any(|r| r.id.task_type == task_type && !r.status.is_terminal());
        if active {
            return Err(ForemanError::IllegalState(format!(
                "task config task:{task_type} still has active runs"
            )));
        }

        state.configs.remove(task_type);
        for id in &version_ids {
            let _ = state.access.remove_resource(id);
        }
        self.inner.task_events.append(
            events::task::CONFIG_DESTROY,
            json!({ "task_type": task_type, "config_ids": version_ids }),
        );
        self.persist(&state).await?;
        info!(task_type, "task config destroyed");
        Ok(())
    }

    /// A definition version, defaulting to the latest. Access is checked
    /// against the current version's id even when an older version is
    /// requested; old versions carry no separate grants.
    pub async fn get_task_config(
        &self,
        task_type: &str,
        version: Option<u32>,
        acting: &str,
    ) -> ForemanResult<TaskConfig> {
        let state = self.inner.state.lock().await;
        let history = state
            .configs
            .get(task_type)
            .ok_or_else(|| ForemanError::NotFound(format!("task config task:{task_type}")))?;
        let current_id = TaskConfigId::new(task_type, history.latest).to_string();
        Self::authorize(&state, &current_id, acting, Permissions::READ)?;
        let version = version.unwrap_or(history.latest);
        history.versions.get(&version).cloned().ok_or_else(|| {
            ForemanError::NotFound(format!("task config task:{task_type}:v{version}"))
        })
    }

    /// Instantiate a run of the current definition version. The acting
    /// agent needs READ+EXECUTE on the config and receives FULL on the
    /// run.
    pub async fn create_task_run(
        &self,
        task_type: &str,
        input: Option<String>,
        acting: &str,
    ) -> ForemanResult<TaskRun> {
        let mut state = self.inner.state.lock().await;
        let history = state
            .configs
            .get(task_type)
            .ok_or_else(|| ForemanError::NotFound(format!("task config task:{task_type}")))?;
        let config = history
            .versions
            .get(&history.latest)
            .expect("latest version present")
            .clone();
        let config_id = config.config_id().to_string();
        Self::authorize(&state, &config_id, acting, Permissions::READ_EXECUTE)?;

        let counter = state
            .run_counters
            .entry((task_type.to_string(), config.version))
            .or_insert(0);
        *counter += 1;
        let run_id = TaskRunId::new(task_type, *counter, config.version);

        let input = input.unwrap_or_else(|| config.input.clone());
        let run_immediately = config.run_immediately;
        let mut run = TaskRun::new(run_id.clone(), input, config);
        state.access.register_resource(run_id.to_string(), acting)?;
        state
            .access
            .grant(&run_id.to_string(), acting, Permissions::FULL)?;
        self.inner.task_events.append(
            events::task::RUN_CREATE,
            json!({ "run": run.view(), "config_id": config_id }),
        );

        if run_immediately {
            run.status = TaskRunStatus::Scheduled;
            run.scheduled_by = Some(acting.to_string());
            Self::push_queue(&mut state, run_id.clone(), acting.to_string());
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(run.view()));
        }
        state.runs.insert(run_id.clone(), run.clone());
        self.emit_task_pool_change(&state, task_type);
        info!(run_id = %run_id, "task run created");
        Ok(run)
    }

    /// Queue a run for dispatch, subject to the definition's concurrency
    /// limit. A request over the limit is silently ignored.
    pub async fn schedule_start_task_run(
        &self,
        run_id: &TaskRunId,
        acting: &str,
    ) -> ForemanResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.runs.contains_key(run_id) {
            return Err(ForemanError::NotFound(format!("task run {run_id}")));
        }
        Self::authorize(&state, &run_id.to_string(), acting, Permissions::FULL)?;

        let run = state.runs.get(run_id).expect("checked above");
        if run.status == TaskRunStatus::Executing {
            return Err(ForemanError::IllegalState(format!(
                "task run {run_id} is already executing"
            )));
        }
        if state.queued.contains(run_id) {
            return Ok(());
        }
        let limit = self.concurrency_limit(&run.config);
        if Self::queued_count(&state, run_id) >= limit {
            debug!(run_id = %run_id, limit, "start queue saturated, schedule ignored");
            return Ok(());
        }

        let run = state.runs.get_mut(run_id).expect("checked above");
        run.status = TaskRunStatus::Scheduled;
        run.scheduled_by = Some(acting.to_string());
        let view = run.view();
        Self::push_queue(&mut state, run_id.clone(), acting.to_string());
        self.inner
            .task_events
            .append(events::task::RUN_UPDATE, json!(view));
        Ok(())
    }

    /// Stop a run. Cooperative: an executing worker is not interrupted,
    /// but its eventual report will be ignored. Stopping an already
    /// terminal run is a no-op.
    pub async fn stop_task_run(&self, run_id: &TaskRunId, acting: &str) -> ForemanResult<()> {
        let released = {
            let mut state = self.inner.state.lock().await;
            if !state.runs.contains_key(run_id) {
                return Err(ForemanError::NotFound(format!("task run {run_id}")));
            }
            Self::authorize(&state, &run_id.to_string(), acting, Permissions::FULL)?;

            let run = state.runs.get_mut(run_id).expect("checked above");
            if run.status.is_terminal() {
                return Ok(());
            }

            let released = run.occupied_by.take();
            run.occupied_since = None;
            run.occupancy_epoch += 1;
            if let Some(agent) = &released {
                let entry = HistoryEntry {
                    timestamp: Utc::now(),
                    status: AttemptOutcome::Stopped,
                    output: None,
                    error: None,
                    run_number: run.completed_runs + 1,
                    retry_attempt: run.current_retry_attempt,
                    agent_id: Some(agent.clone()),
                    execution_time_ms: Self::elapsed_ms(run),
                };
                run.push_history(entry.clone(), self.inner.tuning.max_history_entries);
                self.emit_history(run_id, agent, &entry);
            }
            run.status = TaskRunStatus::Stopped;
            run.next_run_at = None;
            let view = run.view();
            Self::drop_queue_entries(&mut state, run_id);
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(view));
            self.emit_task_pool_change(&state, &run_id.task_type);
            info!(run_id = %run_id, "task run stopped");
            released
        };
        if let Some(agent) = released {
            self.release_worker(&agent).await;
        }
        Ok(())
    }

    /// Remove a run entirely. Requires WRITE on the run; an executing run
    /// must be stopped first.
    pub async fn destroy_task_run(&self, run_id: &TaskRunId, acting: &str) -> ForemanResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.runs.contains_key(run_id) {
            return Err(ForemanError::NotFound(format!("task run {run_id}")));
        }
        Self::authorize(&state, &run_id.to_string(), acting, Permissions::WRITE)?;
        let run = state.runs.get(run_id).expect("checked above");
        if run.status == TaskRunStatus::Executing {
            return Err(ForemanError::IllegalState(format!(
                "task run {run_id} is executing; stop it first"
            )));
        }

        let mut run = state.runs.remove(run_id).expect("checked above");
        run.status = TaskRunStatus::Removed;
        Self::drop_queue_entries(&mut state, run_id);
        let _ = state.access.remove_resource(&run_id.to_string());
        self.inner
            .task_events
            .append(events::task::RUN_DESTROY, json!(run.view()));
        self.emit_task_pool_change(&state, &run_id.task_type);
        info!(run_id = %run_id, "task run destroyed");
        Ok(())
    }

    /// Replace the pending input of a non-executing run.
    pub async fn update_task_run(
        &self,
        run_id: &TaskRunId,
        input: String,
        acting: &str,
    ) -> ForemanResult<TaskRun> {
        let mut state = self.inner.state.lock().await;
        if !state.runs.contains_key(run_id) {
            return Err(ForemanError::NotFound(format!("task run {run_id}")));
        }
        Self::authorize(&state, &run_id.to_string(), acting, Permissions::WRITE)?;
        let run = state.runs.get_mut(run_id).expect("checked above");
        if run.status == TaskRunStatus::Executing {
            return Err(ForemanError::IllegalState(format!(
                "task run {run_id} is executing"
            )));
        }
        run.input = input;
        let updated = run.clone();
        self.inner
            .task_events
            .append(events::task::RUN_UPDATE, json!(updated.view()));
        Ok(updated)
    }

    /// Every run the acting agent may read.
    pub async fn get_all_task_runs(&self, acting: &str) -> Vec<TaskRunView> {
        let state = self.inner.state.lock().await;
        let mut views: Vec<TaskRunView> = state
            .runs
            .values()
            .filter(|r| {
                Self::authorize(&state, &r.id.to_string(), acting, Permissions::READ).is_ok()
            })
            .map(|r| r.view())
            .collect();
        views.sort_by_key(|v| v.run_id.to_string());
        views
    }

    pub async fn get_task_run(&self, run_id: &TaskRunId, acting: &str) -> ForemanResult<TaskRun> {
        let state = self.inner.state.lock().await;
        let run = state
            .runs
            .get(run_id)
            .ok_or_else(|| ForemanError::NotFound(format!("task run {run_id}")))?;
        Self::authorize(&state, &run_id.to_string(), acting, Permissions::READ)?;
        Ok(run.clone())
    }

    pub async fn get_task_run_history(
        &self,
        run_id: &TaskRunId,
        query: &HistoryQuery,
        acting: &str,
    ) -> ForemanResult<Vec<HistoryEntry>> {
        let state = self.inner.state.lock().await;
        let run = state
            .runs
            .get(run_id)
            .ok_or_else(|| ForemanError::NotFound(format!("task run {run_id}")))?;
        Self::authorize(&state, &run_id.to_string(), acting, Permissions::READ)?;

        let mut entries: Vec<HistoryEntry> = run.history().cloned().collect();
        if query.newest_first {
            entries.reverse();
        }
        if let Some(limit) = query.limit {
            if query.newest_first {
                entries.truncate(limit);
            } else if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }
        Ok(entries)
    }

    /// Run counts per status for one definition. Requires READ on the
    /// manager root.
    pub async fn get_pool_stats(&self, task_type: &str, acting: &str) -> ForemanResult<TaskPoolStats> {
        let state = self.inner.state.lock().await;
        Self::authorize(&state, MANAGER_ROOT, acting, Permissions::READ)?;
        if !state.configs.contains_key(task_type) {
            return Err(ForemanError::NotFound(format!("task config task:{task_type}")));
        }
        Ok(Self::stats_for(&state, task_type))
    }

    pub async fn is_task_run_occupied(
        &self,
        run_id: &TaskRunId,
        acting: &str,
    ) -> ForemanResult<bool> {
        let state = self.inner.state.lock().await;
        let run = state
            .runs
            .get(run_id)
            .ok_or_else(|| ForemanError::NotFound(format!("task run {run_id}")))?;
        Self::authorize(&state, &run_id.to_string(), acting, Permissions::READ)?;
        Ok(run.occupied_by.is_some())
    }

    /// Workers of (kind, type) became available: move up to `count` of
    /// the oldest matching waiting runs back onto the start queue.
    pub async fn agent_available(
        &self,
        kind: AgentKind,
        agent_type: &str,
        _version: u32,
        count: usize,
    ) {
        let mut state = self.inner.state.lock().await;
        let mut moved = Vec::new();
        let mut kept = VecDeque::new();
        while let Some(id) = state.waiting.pop_front() {
            let Some(run) = state.runs.get(&id) else {
                continue;
            };
            if run.status != TaskRunStatus::Waiting {
                continue;
            }
            if moved.len() < count
                && run.config.agent_kind == kind
                && run.config.agent_type == agent_type
            {
                moved.push(id);
            } else {
                kept.push_back(id);
            }
        }
        state.waiting = kept;

        for run_id in moved {
            let Some(run) = state.runs.get_mut(&run_id) else {
                continue;
            };
            run.status = TaskRunStatus::Scheduled;
            let acting = run
                .scheduled_by
                .clone()
                .unwrap_or_else(|| run.config.owner_agent_id.clone());
            let view = run.view();
            Self::push_queue(&mut state, run_id, acting);
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(view));
        }
    }

    /// Dispatch at most one queued run. The background loop calls this on
    /// every tick; tests call it directly.
    pub async fn scheduler_pass(&self) -> ForemanResult<bool> {
        let dispatch = {
            let mut state = self.inner.state.lock().await;
            let request = loop {
                match state.start_queue.pop_front() {
                    Some(req) => {
                        state.queued.remove(&req.run_id);
                        if state
                            .runs
                            .get(&req.run_id)
                            .map(|r| r.status == TaskRunStatus::Scheduled)
                            .unwrap_or(false)
                        {
                            break Some(req);
                        }
                        // Destroyed or re-routed since queueing; skip.
                    }
                    None => break None,
                }
            };
            let Some(request) = request else {
                return Ok(false);
            };

            if let Err(e) = Self::authorize(
                &state,
                &request.run_id.to_string(),
                &request.acting,
                Permissions::FULL,
            ) {
                warn!(run_id = %request.run_id, error = %e, "scheduled start rejected");
                return Ok(true);
            }

            let run = state.runs.get(&request.run_id).expect("checked above");
            let limit = self.concurrency_limit(&run.config);
            if Self::executing_count(&state, &request.run_id) >= limit {
                let run = state.runs.get_mut(&request.run_id).expect("checked above");
                run.status = TaskRunStatus::Waiting;
                let view = run.view();
                if !state.waiting.contains(&request.run_id) {
                    state.waiting.push_back(request.run_id.clone());
                }
                self.inner
                    .task_events
                    .append(events::task::RUN_UPDATE, json!(view));
                debug!(run_id = %request.run_id, "run parked, concurrency limit reached");
                return Ok(true);
            }

            let now = Utc::now();
            let run = state.runs.get_mut(&request.run_id).expect("checked above");
            run.status = TaskRunStatus::Executing;
            run.last_run_at = Some(now);
            let repeats_left = run
                .config
                .max_repeats
                .map(|m| run.completed_runs + 1 < m)
                .unwrap_or(true);
            run.next_run_at = if run.config.interval_ms > 0 && repeats_left {
                Some(now + ChronoDuration::milliseconds(run.config.interval_ms as i64))
            } else {
                None
            };
            let snapshot = run.clone();
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(snapshot.view()));
            self.emit_task_pool_change(&state, &request.run_id.task_type);
            snapshot
        };

        let run_id = dispatch.id.clone();
        let callbacks = RunCallbacks {
            manager: self.clone(),
            run_id: run_id.clone(),
        };
        if let Err(e) = self.inner.starter.on_task_start(dispatch, callbacks).await {
            warn!(run_id = %run_id, error = %e, "task start failed, re-parking run");
            let mut state = self.inner.state.lock().await;
            if let Some(run) = state.runs.get_mut(&run_id) {
                if run.status == TaskRunStatus::Executing {
                    run.status = TaskRunStatus::Waiting;
                    let view = run.view();
                    if !state.waiting.contains(&run_id) {
                        state.waiting.push_back(run_id.clone());
                    }
                    self.inner
                        .task_events
                        .append(events::task::RUN_UPDATE, json!(view));
                }
            }
        }
        Ok(true)
    }

    /// Spawn the periodic dispatch loop.
    pub fn spawn_scheduler(&self, tick_ms: u64) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(e) = manager.scheduler_pass().await {
                    warn!(error = %e, "scheduler pass failed");
                }
            }
        })
    }

    /// Force-release a run's occupancy regardless of what the worker does
    /// later. Returns whether anything was released.
    pub async fn expire_occupancy(&self, run_id: &TaskRunId) -> ForemanResult<bool> {
        self.force_release(run_id, None).await
    }

    /// Replay the workspace snapshot. Runs are never persisted, so only
    /// definitions come back.
    pub async fn restore(&self) -> ForemanResult<()> {
        let configs: Vec<TaskConfig> = self.inner.scope.read_snapshot(SNAPSHOT_FILE).await?;
        let mut state = self.inner.state.lock().await;
        for config in configs {
            if !state
                .agent_types
                .contains(&(config.agent_kind, config.agent_type.clone()))
            {
                warn!(
                    config_id = %config.config_id(),
                    agent_type = %config.agent_type,
                    "skipping restored config with unregistered agent type"
                );
                continue;
            }
            let config_id = config.config_id().to_string();
            if state.access.contains(&config_id) {
                continue;
            }
            state
                .access
                .register_resource(config_id.as_str(), config.owner_agent_id.as_str())?;
            state.access.grant(
                &config_id,
                config.owner_agent_id.clone(),
                Permissions::READ_EXECUTE,
            )?;
            self.inner
                .task_events
                .append(events::task::CONFIG_CREATE, json!(config));
            info!(config_id = %config_id, "restored task config");
            state.configs.insert(config.task_type.clone(), ConfigHistory {
                latest: config.version,
                versions: BTreeMap::from([(config.version, config)]),
            });
        }
        Ok(())
    }

    // --- run lifecycle callbacks ---

    pub(crate) async fn handle_acquire_failed(&self, run_id: &TaskRunId) {
        let mut state = self.inner.state.lock().await;
        let Some(run) = state.runs.get_mut(run_id) else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        run.status = TaskRunStatus::Waiting;
        let view = run.view();
        Self::drop_queue_entries(&mut state, run_id);
        if !state.waiting.contains(run_id) {
            state.waiting.push_back(run_id.clone());
        }
        self.inner
            .task_events
            .append(events::task::RUN_UPDATE, json!(view));
        debug!(run_id = %run_id, "no worker available, run parked");
    }

    pub(crate) async fn handle_acquired(&self, run_id: &TaskRunId, agent_id: AgentId) {
        let epoch = {
            let mut state = self.inner.state.lock().await;
            let live = matches!(state.runs.get(run_id), Some(run) if !run.status.is_terminal());
            if !live {
                None
            } else {
                let run = state.runs.get_mut(run_id).expect("checked above");
                run.occupied_by = Some(agent_id.clone());
                run.occupied_since = Some(Utc::now());
                run.occupancy_epoch += 1;
                let epoch = run.occupancy_epoch;
                let view = run.view();
                let _ = state
                    .access
                    .grant(&run_id.to_string(), agent_id.to_string(), Permissions::FULL);
                self.inner.agent_events.append(
                    events::agent::ASSIGNMENT_ASSIGN,
                    json!({ "run_id": run_id, "agent_id": agent_id }),
                );
                self.inner
                    .task_events
                    .append(events::task::RUN_UPDATE, json!(view));
                Some(epoch)
            }
        };

        let Some(epoch) = epoch else {
            // The run was stopped (or removed) before the acquisition
            // landed; hand the worker straight back.
            debug!(run_id = %run_id, "ignoring acquisition for terminal run");
            self.release_worker(&agent_id).await;
            return;
        };

        if self.inner.tuning.occupancy_timeout_ms > 0 {
            let manager = self.clone();
            let run_id = run_id.clone();
            let timeout = self.inner.tuning.occupancy_timeout_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout)).await;
                if let Ok(true) = manager.force_release(&run_id, Some(epoch)).await {
                    warn!(run_id = %run_id, "occupancy timeout exceeded, worker force-released");
                }
            });
        }
    }

    pub(crate) async fn handle_complete(&self, run_id: &TaskRunId, output: String, agent_id: AgentId) {
        let (released, requeue_delay) = {
            let mut state = self.inner.state.lock().await;
            let Some(run) = state.runs.get_mut(run_id) else {
                return;
            };
            if run.status.is_terminal() {
                debug!(run_id = %run_id, "ignoring late completion report");
                return;
            }

            run.completed_runs += 1;
            let entry = HistoryEntry {
                timestamp: Utc::now(),
                status: AttemptOutcome::Completed,
                output: Some(output),
                error: None,
                run_number: run.completed_runs,
                retry_attempt: run.current_retry_attempt,
                agent_id: Some(agent_id.clone()),
                execution_time_ms: Self::elapsed_ms(run),
            };
            run.push_history(entry.clone(), self.inner.tuning.max_history_entries);
            run.current_retry_attempt = 0;
            run.occupied_by = None;
            run.occupied_since = None;
            run.occupancy_epoch += 1;

            let done = match run.config.max_repeats {
                Some(max) => run.completed_runs >= max,
                None => run.config.interval_ms == 0,
            };
            let requeue_delay = if done {
                run.status = TaskRunStatus::Completed;
                run.next_run_at = None;
                None
            } else {
                run.status = TaskRunStatus::Waiting;
                run.next_run_at
                    .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            };

            let view = run.view();
            self.emit_unassign(run_id, &agent_id);
            self.emit_history(run_id, &agent_id, &entry);
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(view));
            self.emit_task_pool_change(&state, &run_id.task_type);
            info!(run_id = %run_id, completed_runs = view.completed_runs, "task run attempt completed");
            (agent_id, requeue_delay)
        };

        self.release_worker(&released).await;
        if let Some(delay) = requeue_delay {
            self.arm_requeue(run_id.clone(), delay);
        }
    }

    pub(crate) async fn handle_error(&self, run_id: &TaskRunId, error: String, agent_id: AgentId) {
        let (released, retry_delay) = {
            let mut state = self.inner.state.lock().await;
            let Some(run) = state.runs.get_mut(run_id) else {
                return;
            };
            if run.status.is_terminal() {
                debug!(run_id = %run_id, "ignoring late failure report");
                return;
            }

            run.error_count += 1;
            run.completed_runs += 1;
            let entry = HistoryEntry {
                timestamp: Utc::now(),
                status: AttemptOutcome::Failed,
                output: None,
                error: Some(error),
                run_number: run.completed_runs,
                retry_attempt: run.current_retry_attempt,
                agent_id: Some(agent_id.clone()),
                execution_time_ms: Self::elapsed_ms(run),
            };
            run.push_history(entry.clone(), self.inner.tuning.max_history_entries);
            run.occupied_by = None;
            run.occupied_since = None;
            run.occupancy_epoch += 1;

            let retries_left = run
                .config
                .max_retries
                .map(|max| run.current_retry_attempt < max)
                .unwrap_or(false);
            let retry_delay = if retries_left {
                run.current_retry_attempt += 1;
                run.status = TaskRunStatus::Waiting;
                Some(Duration::from_millis(
                    run.config.retry_delay_ms.unwrap_or(0),
                ))
            } else {
                run.status = TaskRunStatus::Failed;
                run.next_run_at = None;
                None
            };

            let view = run.view();
            self.emit_unassign(run_id, &agent_id);
            self.emit_history(run_id, &agent_id, &entry);
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(view));
            self.emit_task_pool_change(&state, &run_id.task_type);
            warn!(
                run_id = %run_id,
                retry_attempt = view.current_retry_attempt,
                retrying = retry_delay.is_some(),
                "task run attempt failed"
            );
            (agent_id, retry_delay)
        };

        self.release_worker(&released).await;
        if let Some(delay) = retry_delay {
            self.arm_requeue(run_id.clone(), delay);
        }
    }

    // --- internals ---

    async fn force_release(
        &self,
        run_id: &TaskRunId,
        expected_epoch: Option<u64>,
    ) -> ForemanResult<bool> {
        let released = {
            let mut state = self.inner.state.lock().await;
            let Some(run) = state.runs.get_mut(run_id) else {
                return Ok(false);
            };
            if let Some(expected) = expected_epoch {
                if run.occupancy_epoch != expected {
                    return Ok(false);
                }
            }
            let Some(agent) = run.occupied_by.take() else {
                return Ok(false);
            };
            run.occupied_since = None;
            run.occupancy_epoch += 1;
            let entry = HistoryEntry {
                timestamp: Utc::now(),
                status: AttemptOutcome::Stopped,
                output: None,
                error: Some("occupancy timeout exceeded".into()),
                run_number: run.completed_runs + 1,
                retry_attempt: run.current_retry_attempt,
                agent_id: Some(agent.clone()),
                execution_time_ms: Self::elapsed_ms(run),
            };
            run.push_history(entry.clone(), self.inner.tuning.max_history_entries);
            run.status = TaskRunStatus::Stopped;
            run.next_run_at = None;
            let view = run.view();
            Self::drop_queue_entries(&mut state, run_id);
            self.emit_unassign(run_id, &agent);
            self.emit_history(run_id, &agent, &entry);
            self.inner
                .task_events
                .append(events::task::RUN_UPDATE, json!(view));
            self.emit_task_pool_change(&state, &run_id.task_type);
            agent
        };
        self.release_worker(&released).await;
        Ok(true)
    }

    /// Root-override authorization: the required bits on the manager root
    /// satisfy any per-resource check.
    fn authorize(
        state: &ManagerState,
        resource: &str,
        principal: &str,
        required: Permissions,
    ) -> ForemanResult<()> {
        if resource != MANAGER_ROOT
            && state
                .access
                .permissions_of(MANAGER_ROOT, principal)
                .contains(required)
        {
            return Ok(());
        }
        state.access.check(resource, principal, required)
    }

    fn concurrency_limit(&self, config: &TaskConfig) -> usize {
        match config.concurrency_mode {
            ConcurrencyMode::Exclusive => 1,
            ConcurrencyMode::None => self.inner.tuning.unbounded_concurrency_cap,
        }
    }

    /// Executing runs of the same (type, version), excluding the run
    /// itself. Gates dispatch.
    fn executing_count(state: &ManagerState, run_id: &TaskRunId) -> usize {
        state
            .runs
            .values()
            .filter(|r| {
                r.id != *run_id
                    && r.id.task_type == run_id.task_type
                    && r.id.version == run_id.version
                    && r.status == TaskRunStatus::Executing
            })
            .count()
    }

    /// Queued runs of the same (type, version), excluding the run itself.
    /// Gates schedule requests.
    fn queued_count(state: &ManagerState, run_id: &TaskRunId) -> usize {
        state
            .queued
            .iter()
            .filter(|id| {
                *id != run_id
                    && id.task_type == run_id.task_type
                    && id.version == run_id.version
            })
            .count()
    }

    fn push_queue(state: &mut ManagerState, run_id: TaskRunId, acting: String) {
        if state.queued.insert(run_id.clone()) {
            state.start_queue.push_back(StartRequest { run_id, acting });
        }
    }

    fn drop_queue_entries(state: &mut ManagerState, run_id: &TaskRunId) {
        state.start_queue.retain(|req| &req.run_id != run_id);
        state.queued.remove(run_id);
        state.waiting.retain(|id| id != run_id);
    }

    fn elapsed_ms(run: &TaskRun) -> u64 {
        run.last_run_at
            .map(|at| (Utc::now() - at).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    fn emit_unassign(&self, run_id: &TaskRunId, agent_id: &AgentId) {
        self.inner.agent_events.append(
            events::agent::ASSIGNMENT_UNASSIGN,
            json!({ "run_id": run_id, "agent_id": agent_id }),
        );
    }

    fn emit_history(&self, run_id: &TaskRunId, agent_id: &AgentId, entry: &HistoryEntry) {
        self.inner.agent_events.append(
            events::agent::ASSIGNMENT_HISTORY_ENTRY,
            json!({ "run_id": run_id, "agent_id": agent_id, "entry": entry }),
        );
        self.inner.task_events.append(
            events::task::HISTORY_ENTRY_CREATE,
            json!({ "run_id": run_id, "entry": entry }),
        );
    }

    fn emit_task_pool_change(&self, state: &ManagerState, task_type: &str) {
        self.inner
            .task_events
            .append(events::task::POOL_CHANGE, json!(Self::stats_for(state, task_type)));
    }

    fn stats_for(state: &ManagerState, task_type: &str) -> TaskPoolStats {
        let mut stats = TaskPoolStats {
            task_type: task_type.to_string(),
            ..Default::default()
        };
        for run in state.runs.values() {
            if run.id.task_type == task_type {
                stats.count(run.status);
            }
        }
        stats
    }

    async fn release_worker(&self, agent_id: &AgentId) {
        if let Err(e) = self.inner.acquirer.release(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "worker release failed");
        }
    }

    fn arm_requeue(&self, run_id: TaskRunId, delay: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            manager.requeue_if_waiting(&run_id).await;
        });
    }

    /// Put a waiting run back on the start queue (interval and retry
    /// timers land here).
    pub(crate) async fn requeue_if_waiting(&self, run_id: &TaskRunId) {
        let mut state = self.inner.state.lock().await;
        let Some(run) = state.runs.get_mut(run_id) else {
            return;
        };
        if run.status != TaskRunStatus::Waiting {
            return;
        }
        run.status = TaskRunStatus::Scheduled;
        let acting = run
            .scheduled_by
            .clone()
            .unwrap_or_else(|| run.config.owner_agent_id.clone());
        let view = run.view();
        state.waiting.retain(|id| id != run_id);
        Self::push_queue(&mut state, run_id.clone(), acting);
        self.inner
            .task_events
            .append(events::task::RUN_UPDATE, json!(view));
    }

    /// Persist the current definition set (latest versions) to the
    /// workspace.
    async fn persist(&self, state: &ManagerState) -> ForemanResult<()> {
        let mut snapshot: Vec<TaskConfig> = state
            .configs
            .values()
            .filter_map(|h| h.versions.get(&h.latest).cloned())
            .collect();
        snapshot.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        self.inner.scope.write_snapshot(SNAPSHOT_FILE, &snapshot).await
    }
}

#[async_trait]
impl RegistryObserver for TaskManager {
    async fn agent_config_created(&self, kind: AgentKind, agent_type: &str) {
        self.register_agent_type(kind, agent_type).await;
    }

    async fn agent_available(&self, kind: AgentKind, agent_type: &str, version: u32, count: usize) {
        TaskManager::agent_available(self, kind, agent_type, version, count).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foreman_core::Worker;
    use foreman_workspace::Workspace;

    const ADMIN: &str = "supervisor:main[1]:v1";
    const OWNER: &str = "supervisor:aux[1]:v1";

    struct StubWorker {
        id: AgentId,
    }

    impl Worker for StubWorker {
        fn agent_id(&self) -> &AgentId {
            &self.id
        }
    }

    #[derive(Default)]
    struct MockAcquirer {
        released: std::sync::Mutex<Vec<AgentId>>,
    }

    #[async_trait]
    impl AgentAcquirer for MockAcquirer {
        async fn acquire(
            &self,
            kind: AgentKind,
            agent_type: &str,
            version: Option<u32>,
        ) -> ForemanResult<(AgentId, Arc<dyn Worker>)> {
            let id = AgentId::new(kind, agent_type, 1, version.unwrap_or(1));
            Ok((id.clone(), Arc::new(StubWorker { id })))
        }

        async fn release(&self, id: &AgentId) -> ForemanResult<()> {
            self.released.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    /// Starter that leaves the run executing; tests drive the callbacks.
    struct IdleStarter;

    #[async_trait]
    impl TaskStarter for IdleStarter {
        async fn on_task_start(&self, _run: TaskRun, _callbacks: RunCallbacks) -> ForemanResult<()> {
            Ok(())
        }
    }

    async fn setup() -> (TaskManager, Arc<MockAcquirer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), "test").await.unwrap();
        let task_events = EventLog::open(dir.path().join("logs"), events::TASK_STREAM)
            .await
            .unwrap();
        let agent_events = EventLog::open(dir.path().join("logs"), events::AGENT_STREAM)
            .await
            .unwrap();
        let acquirer = Arc::new(MockAcquirer::default());
        let manager = TaskManager::new(
            acquirer.clone(),
            Arc::new(IdleStarter),
            task_events,
            agent_events,
            ws.scope(MANAGER_ROOT),
            ManagerTuning {
                occupancy_timeout_ms: 0,
                ..ManagerTuning::default()
            },
        );
        manager.register_admin_agent(ADMIN).await.unwrap();
        manager.register_agent_type(AgentKind::Operator, "poet").await;
        (manager, acquirer, dir)
    }

    fn poem_config() -> NewTaskConfig {
        NewTaskConfig {
            task_type: "poem_generation".into(),
            input: "write a poem".into(),
            description: String::new(),
            interval_ms: 0,
            run_immediately: false,
            max_retries: None,
            retry_delay_ms: None,
            max_repeats: Some(1),
            agent_kind: AgentKind::Operator,
            agent_type: "poet".into(),
            concurrency_mode: ConcurrencyMode::None,
        }
    }

    fn worker(n: u32) -> AgentId {
        AgentId::new(AgentKind::Operator, "poet", n, 1)
    }

    fn callbacks(manager: &TaskManager, run_id: &TaskRunId) -> RunCallbacks {
        RunCallbacks {
            manager: manager.clone(),
            run_id: run_id.clone(),
        }
    }

    /// Drive a queued run into Executing and report a worker acquisition.
    async fn start_occupied(manager: &TaskManager, run_id: &TaskRunId, agent: &AgentId) {
        assert!(manager.scheduler_pass().await.unwrap());
        callbacks(manager, run_id).agent_acquired(agent.clone()).await;
    }

    #[tokio::test]
    async fn test_create_config_requires_root_write() {
        let (manager, _, _dir) = setup().await;
        let err = manager
            .create_task_config(poem_config(), OWNER, "operator:poet[1]:v1")
            .await;
        assert!(matches!(err, Err(ForemanError::PermissionDenied(_))));
        assert!(manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_agent_type() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        assert!(matches!(
            manager.create_task_config(poem_config(), OWNER, ADMIN).await,
            Err(ForemanError::DuplicateType(_))
        ));

        let mut unknown = poem_config();
        unknown.task_type = "translation".into();
        unknown.agent_type = "translator".into();
        assert!(matches!(
            manager.create_task_config(unknown, OWNER, ADMIN).await,
            Err(ForemanError::UnknownAgentType(_))
        ));
    }

    #[tokio::test]
    async fn test_update_denied_leaves_state_unchanged() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();

        let update = TaskConfigUpdate {
            interval_ms: Some(9),
            ..TaskConfigUpdate::for_type("poem_generation")
        };
        // The owner holds READ+EXECUTE, not READ+WRITE.
        let intruder = "operator:poet[1]:v1";
        assert!(matches!(
            manager.update_task_config(update.clone(), intruder).await,
            Err(ForemanError::PermissionDenied(_))
        ));

        let updated = manager.update_task_config(update, ADMIN).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.interval_ms, 9);
    }

    #[tokio::test]
    async fn test_get_task_config_versions() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        manager
            .update_task_config(
                TaskConfigUpdate {
                    interval_ms: Some(7),
                    ..TaskConfigUpdate::for_type("poem_generation")
                },
                ADMIN,
            )
            .await
            .unwrap();

        let latest = manager
            .get_task_config("poem_generation", None, ADMIN)
            .await
            .unwrap();
        assert_eq!(latest.version, 2);

        // The owner's grant on the current id also covers older versions.
        let old = manager
            .get_task_config("poem_generation", Some(1), OWNER)
            .await
            .unwrap();
        assert_eq!(old.version, 1);

        assert!(matches!(
            manager
                .get_task_config("poem_generation", None, "operator:poet[1]:v1")
                .await,
            Err(ForemanError::PermissionDenied(_))
        ));
        assert!(matches!(
            manager.get_task_config("poem_generation", Some(9), ADMIN).await,
            Err(ForemanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_numbering_and_creator_rights() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();

        let r1 = manager
            .create_task_run("poem_generation", Some("bee".into()), ADMIN)
            .await
            .unwrap();
        let r2 = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        assert_eq!(r1.id.to_string(), "task:poem_generation[1]:v1");
        assert_eq!(r2.id.to_string(), "task:poem_generation[2]:v1");
        assert_eq!(r1.input, "bee");
        assert_eq!(r2.input, "write a poem");

        // The creator holds FULL on the run.
        manager.schedule_start_task_run(&r1.id, ADMIN).await.unwrap();
        let run = manager.get_task_run(&r1.id, ADMIN).await.unwrap();
        assert_eq!(run.status, TaskRunStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_one_shot_completes_with_history() {
        let (manager, acquirer, _dir) = setup().await;
        let mut cfg = poem_config();
        cfg.run_immediately = true;
        manager.create_task_config(cfg, OWNER, ADMIN).await.unwrap();
        let run = manager
            .create_task_run("poem_generation", Some("bee".into()), ADMIN)
            .await
            .unwrap();
        assert_eq!(run.status, TaskRunStatus::Scheduled);

        let agent = worker(1);
        start_occupied(&manager, &run.id, &agent).await;
        assert!(manager.is_task_run_occupied(&run.id, ADMIN).await.unwrap());

        callbacks(&manager, &run.id)
            .agent_complete("a poem about a bee", agent.clone())
            .await;

        let done = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(done.status, TaskRunStatus::Completed);
        assert_eq!(done.completed_runs, 1);
        assert!(done.occupied_by.is_none());

        let history = manager
            .get_task_run_history(&run.id, &HistoryQuery::default(), ADMIN)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttemptOutcome::Completed);
        assert_eq!(history[0].run_number, 1);
        assert_eq!(history[0].output.as_deref(), Some("a poem about a bee"));
        assert_eq!(history[0].agent_id, Some(agent.clone()));

        // The worker went back to the registry.
        assert_eq!(acquirer.released.lock().unwrap().as_slice(), &[agent]);
    }

    #[tokio::test]
    async fn test_retry_ladder_then_success() {
        let (manager, _, _dir) = setup().await;
        let mut cfg = poem_config();
        cfg.max_retries = Some(2);
        cfg.retry_delay_ms = Some(0);
        manager.create_task_config(cfg, OWNER, ADMIN).await.unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();

        let agent = worker(1);
        for attempt in 0..2u32 {
            start_occupied(&manager, &run.id, &agent).await;
            callbacks(&manager, &run.id)
                .agent_error("rhyme engine offline", agent.clone())
                .await;
            let state = manager.get_task_run(&run.id, ADMIN).await.unwrap();
            assert_eq!(state.current_retry_attempt, attempt + 1);
            // The retry timer re-queues; make it deterministic here.
            manager.requeue_if_waiting(&run.id).await;
        }

        start_occupied(&manager, &run.id, &agent).await;
        callbacks(&manager, &run.id)
            .agent_complete("third time lucky", agent.clone())
            .await;

        let done = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(done.status, TaskRunStatus::Completed);
        assert_eq!(done.error_count, 2);
        assert_eq!(done.completed_runs, 3);

        let history = manager
            .get_task_run_history(&run.id, &HistoryQuery::default(), ADMIN)
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].status, AttemptOutcome::Failed);
        assert_eq!(history[0].retry_attempt, 0);
        assert_eq!(history[1].status, AttemptOutcome::Failed);
        assert_eq!(history[1].retry_attempt, 1);
        assert_eq!(history[2].status, AttemptOutcome::Completed);
        assert_eq!(history[2].retry_attempt, 2);
    }

    #[tokio::test]
    async fn test_no_retries_when_unset() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();

        let agent = worker(1);
        start_occupied(&manager, &run.id, &agent).await;
        callbacks(&manager, &run.id)
            .agent_error("boom", agent.clone())
            .await;

        let failed = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(failed.status, TaskRunStatus::Failed);
        assert_eq!(failed.error_count, 1);
    }

    #[tokio::test]
    async fn test_exclusive_second_run_parked_waiting() {
        let (manager, _, _dir) = setup().await;
        let mut cfg = poem_config();
        cfg.concurrency_mode = ConcurrencyMode::Exclusive;
        cfg.max_repeats = None;
        manager.create_task_config(cfg, OWNER, ADMIN).await.unwrap();

        let r1 = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        let r2 = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();

        manager.schedule_start_task_run(&r1.id, ADMIN).await.unwrap();
        let agent = worker(1);
        start_occupied(&manager, &r1.id, &agent).await;

        manager.schedule_start_task_run(&r2.id, ADMIN).await.unwrap();
        assert!(manager.scheduler_pass().await.unwrap());
        let parked = manager.get_task_run(&r2.id, ADMIN).await.unwrap();
        assert_eq!(parked.status, TaskRunStatus::Waiting);

        // A third schedule request while one is already queued is ignored.
        let r3 = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&r2.id, ADMIN).await.unwrap();
        manager.schedule_start_task_run(&r3.id, ADMIN).await.unwrap();
        let third = manager.get_task_run(&r3.id, ADMIN).await.unwrap();
        assert_eq!(third.status, TaskRunStatus::Created);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_worker() {
        let (manager, acquirer, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();
        let agent = worker(1);
        start_occupied(&manager, &run.id, &agent).await;

        manager.stop_task_run(&run.id, ADMIN).await.unwrap();
        let stopped = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(stopped.status, TaskRunStatus::Stopped);
        assert!(stopped.occupied_by.is_none());
        assert_eq!(acquirer.released.lock().unwrap().len(), 1);

        // Second stop is a no-op.
        manager.stop_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(acquirer.released.lock().unwrap().len(), 1);

        // A late completion report is ignored.
        callbacks(&manager, &run.id)
            .agent_complete("too late", agent)
            .await;
        let still = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(still.status, TaskRunStatus::Stopped);
        assert_eq!(still.completed_runs, 0);
    }

    #[tokio::test]
    async fn test_occupancy_force_release_ignores_late_report() {
        let (manager, acquirer, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();
        let agent = worker(1);
        start_occupied(&manager, &run.id, &agent).await;

        assert!(manager.expire_occupancy(&run.id).await.unwrap());
        assert_eq!(acquirer.released.lock().unwrap().len(), 1);
        let run_after = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(run_after.status, TaskRunStatus::Stopped);

        callbacks(&manager, &run.id)
            .agent_complete("ghost result", agent)
            .await;
        let still = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(still.completed_runs, 0);

        // Nothing left to release.
        assert!(!manager.expire_occupancy(&run.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_run_rules() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();
        let agent = worker(1);
        start_occupied(&manager, &run.id, &agent).await;

        assert!(matches!(
            manager.destroy_task_run(&run.id, ADMIN).await,
            Err(ForemanError::IllegalState(_))
        ));

        manager.stop_task_run(&run.id, ADMIN).await.unwrap();
        manager.destroy_task_run(&run.id, ADMIN).await.unwrap();
        assert!(matches!(
            manager.get_task_run(&run.id, ADMIN).await,
            Err(ForemanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_failure_parks_then_availability_revives() {
        let (manager, _, _dir) = setup().await;
        let mut cfg = poem_config();
        cfg.max_repeats = None;
        manager.create_task_config(cfg, OWNER, ADMIN).await.unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();
        assert!(manager.scheduler_pass().await.unwrap());

        callbacks(&manager, &run.id).awaiting_agent_acquired().await;
        let parked = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(parked.status, TaskRunStatus::Waiting);

        // A worker of another type changes nothing.
        manager
            .agent_available(AgentKind::Operator, "critic", 1, 1)
            .await;
        let still = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(still.status, TaskRunStatus::Waiting);

        manager
            .agent_available(AgentKind::Operator, "poet", 1, 1)
            .await;
        let revived = manager.get_task_run(&run.id, ADMIN).await.unwrap();
        assert_eq!(revived.status, TaskRunStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_destroy_config_requires_no_active_runs() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();

        assert!(matches!(
            manager.destroy_task_config("poem_generation", ADMIN).await,
            Err(ForemanError::IllegalState(_))
        ));

        manager.stop_task_run(&run.id, ADMIN).await.unwrap();
        manager
            .destroy_task_config("poem_generation", ADMIN)
            .await
            .unwrap();
        assert!(matches!(
            manager.create_task_run("poem_generation", None, ADMIN).await,
            Err(ForemanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_query_options() {
        let (manager, _, _dir) = setup().await;
        let mut cfg = poem_config();
        cfg.max_retries = Some(10);
        cfg.retry_delay_ms = Some(0);
        cfg.max_repeats = None;
        cfg.interval_ms = 1;
        manager.create_task_config(cfg, OWNER, ADMIN).await.unwrap();
        let run = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&run.id, ADMIN).await.unwrap();

        let agent = worker(1);
        for _ in 0..3 {
            start_occupied(&manager, &run.id, &agent).await;
            callbacks(&manager, &run.id)
                .agent_error("nope", agent.clone())
                .await;
            manager.requeue_if_waiting(&run.id).await;
        }

        let newest = manager
            .get_task_run_history(
                &run.id,
                &HistoryQuery {
                    limit: Some(2),
                    newest_first: true,
                },
                ADMIN,
            )
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].run_number, 3);
        assert_eq!(newest[1].run_number, 2);

        let oldest = manager
            .get_task_run_history(
                &run.id,
                &HistoryQuery {
                    limit: Some(2),
                    newest_first: false,
                },
                ADMIN,
            )
            .await
            .unwrap();
        assert_eq!(oldest[0].run_number, 2);
        assert_eq!(oldest[1].run_number, 3);
    }

    #[tokio::test]
    async fn test_pool_stats_and_listing_visibility() {
        let (manager, _, _dir) = setup().await;
        manager
            .create_task_config(poem_config(), OWNER, ADMIN)
            .await
            .unwrap();
        manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        let r2 = manager
            .create_task_run("poem_generation", None, ADMIN)
            .await
            .unwrap();
        manager.schedule_start_task_run(&r2.id, ADMIN).await.unwrap();

        let stats = manager.get_pool_stats("poem_generation", ADMIN).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.scheduled, 1);

        // A stranger sees nothing; the admin sees both runs.
        assert!(manager.get_all_task_runs("operator:poet[9]:v1").await.is_empty());
        assert_eq!(manager.get_all_task_runs(ADMIN).await.len(), 2);
    }

    async fn build_manager(logs: std::path::PathBuf, ws: &Workspace) -> TaskManager {
        let task_events = EventLog::open(&logs, events::TASK_STREAM).await.unwrap();
        let agent_events = EventLog::open(&logs, events::AGENT_STREAM).await.unwrap();
        TaskManager::new(
            Arc::new(MockAcquirer::default()),
            Arc::new(IdleStarter),
            task_events,
            agent_events,
            ws.scope(MANAGER_ROOT),
            ManagerTuning::default(),
        )
    }

    #[tokio::test]
    async fn test_persist_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), "test").await.unwrap();
        let logs = dir.path().join("logs");

        {
            let manager = build_manager(logs.clone(), &ws).await;
            manager.register_admin_agent(ADMIN).await.unwrap();
            manager.register_agent_type(AgentKind::Operator, "poet").await;
            manager
                .create_task_config(poem_config(), OWNER, ADMIN)
                .await
                .unwrap();
            let mut second = poem_config();
            second.task_type = "haiku_generation".into();
            manager
                .create_task_config(second, OWNER, ADMIN)
                .await
                .unwrap();
            // A run that must NOT come back.
            manager
                .create_task_run("poem_generation", None, ADMIN)
                .await
                .unwrap();
        }

        let manager = build_manager(logs, &ws).await;
        manager.register_admin_agent(ADMIN).await.unwrap();
        manager.register_agent_type(AgentKind::Operator, "poet").await;
        manager.restore().await.unwrap();

        // Both configs are back and usable; runs are gone.
        assert!(manager.get_all_task_runs(ADMIN).await.is_empty());
        let run = manager
            .create_task_run("haiku_generation", None, ADMIN)
            .await
            .unwrap();
        assert_eq!(run.id.to_string(), "task:haiku_generation[1]:v1");
        // The owner's grant on the config survives restoration.
        assert!(manager
            .create_task_run("poem_generation", None, OWNER)
            .await
            .is_ok());
    }
}
