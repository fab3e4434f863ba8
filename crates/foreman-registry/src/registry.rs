//! The agent registry: versioned template store plus live instance pools.
//!
//! One logical lock guards all registry state; lifecycle callbacks are
//! awaited while it is held (they are required not to call back into the
//! registry), observer notifications fire only after it is dropped so the
//! task manager can take its own lock freely.

use crate::config::{AgentConfig, AgentConfigUpdate, NewAgentConfig};
use crate::pool::{ActiveAgent, AgentFilter, PoolStats, VersionPool, VersionPoolStats};
use crate::tools::{ToolDescriptor, ToolFactory, ToolFactoryRegistry};
use async_trait::async_trait;
use foreman_core::{
    AgentAcquirer, AgentConfigId, AgentId, AgentKind, ForemanError, ForemanResult,
    RegistryObserver, Worker,
};
use foreman_workspace::{events, EventLog, WorkspaceScope};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Snapshot file the registry owns inside the workspace.
pub const SNAPSHOT_FILE: &str = "agent_registry.jsonl";

/// Materializes and tears down worker instances. Implemented by the worker
/// runtime outside the control plane.
///
/// Implementations must not call back into the registry; callbacks are
/// awaited while registry state is locked.
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    /// Bring up a worker for `id` from `config`. Failure aborts the
    /// registry operation that requested the instance.
    async fn on_create(&self, config: &AgentConfig, id: &AgentId) -> ForemanResult<Arc<dyn Worker>>;

    /// Tear a worker down. Failures are logged and swallowed.
    async fn on_destroy(&self, worker: Arc<dyn Worker>) -> ForemanResult<()>;
}

type PoolKey = (AgentKind, String);

struct ConfigHistory {
    latest: u32,
    versions: BTreeMap<u32, AgentConfig>,
}

struct RegistryState {
    tools: ToolFactoryRegistry,
    configs: HashMap<PoolKey, ConfigHistory>,
    pools: HashMap<PoolKey, BTreeMap<u32, VersionPool>>,
    /// (kind, type, version) triples waiting for the stale sweep.
    stale: BTreeSet<(AgentKind, String, u32)>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    lifecycle: Arc<dyn AgentLifecycle>,
    observer: Arc<dyn RegistryObserver>,
    events: EventLog,
    scope: WorkspaceScope,
    cleanup_tick_ms: u64,
    cleanup_running: AtomicBool,
}

/// Versioned configuration store and instance pool broker for workers.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

impl AgentRegistry {
    pub fn new(
        lifecycle: Arc<dyn AgentLifecycle>,
        observer: Arc<dyn RegistryObserver>,
        events: EventLog,
        scope: WorkspaceScope,
        cleanup_tick_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    tools: ToolFactoryRegistry::new(),
                    configs: HashMap::new(),
                    pools: HashMap::new(),
                    stale: BTreeSet::new(),
                }),
                lifecycle,
                observer,
                events,
                scope,
                cleanup_tick_ms,
                cleanup_running: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the tool catalog source for a kind. One binding per kind.
    pub async fn register_tools_factory(
        &self,
        kind: AgentKind,
        factory: Arc<dyn ToolFactory>,
    ) -> ForemanResult<()> {
        let mut state = self.inner.state.lock().await;
        state.tools.register(kind, factory)?;
        let tools = state.tools.descriptors(kind).unwrap_or_default();
        self.inner.events.append(
            events::agent::AVAILABLE_TOOLS_REGISTER,
            json!({ "kind": kind, "tools": tools }),
        );
        Ok(())
    }

    /// Tool catalog for a kind, empty when no factory is bound.
    pub async fn available_tools(&self, kind: AgentKind) -> Vec<ToolDescriptor> {
        let state = self.inner.state.lock().await;
        state.tools.descriptors(kind).unwrap_or_default()
    }

    /// Materialize version 1 of a (kind, type) template.
    pub async fn create_agent_config(&self, new: NewAgentConfig) -> ForemanResult<AgentConfig> {
        let (config, available) = {
            let mut state = self.inner.state.lock().await;
            let key = (new.kind, new.agent_type.clone());
            if state.configs.contains_key(&key) {
                return Err(ForemanError::DuplicateType(format!(
                    "{}:{}",
                    new.kind, new.agent_type
                )));
            }
            state.tools.validate(new.kind, &new.tools)?;

            let config = new.into_config(1);
            state.configs.insert(
                key.clone(),
                ConfigHistory {
                    latest: 1,
                    versions: BTreeMap::from([(1, config.clone())]),
                },
            );
            state
                .pools
                .entry(key.clone())
                .or_default()
                .insert(1, VersionPool::new());
            self.inner
                .events
                .append(events::agent::CONFIG_CREATE, json!(config));

            if let Err(e) = self.populate_pool(&mut state, &config).await {
                // No partial state: the half-populated version is torn down
                // before the error surfaces.
                self.discard_version(&mut state, &key, 1).await;
                state.configs.remove(&key);
                state.pools.remove(&key);
                self.inner.events.append(
                    events::agent::CONFIG_DESTROY,
                    json!({ "config_id": config.config_id() }),
                );
                return Err(e);
            }

            self.persist(&state).await?;
            let available = Self::available_count(&state, &key, 1);
            info!(config_id = %config.config_id(), "agent config created");
            (config, available)
        };

        self.inner
            .observer
            .agent_config_created(config.kind, &config.agent_type)
            .await;
        if available > 0 {
            self.inner
                .observer
                .agent_available(config.kind, &config.agent_type, 1, available)
                .await;
        }
        Ok(config)
    }

    /// Produce the next version of an existing template. Prior versions
    /// stay live until their instances drain; the stale sweep retires
    /// them.
    pub async fn update_agent_config(&self, update: AgentConfigUpdate) -> ForemanResult<AgentConfig> {
        let (config, available, has_stale) = {
            let mut state = self.inner.state.lock().await;
            let key = (update.kind, update.agent_type.clone());
            if !state.configs.contains_key(&key) {
                return Err(ForemanError::NotFound(format!(
                    "agent config {}:{}",
                    update.kind, update.agent_type
                )));
            }
            if let Some(tools) = &update.tools {
                state.tools.validate(update.kind, tools)?;
            }

            let history = state.configs.get_mut(&key).expect("checked above");
            let previous = history
                .versions
                .get(&history.latest)
                .expect("latest version present")
                .clone();
            let config = update.apply(&previous);
            let version = config.version;
            history.latest = version;
            history.versions.insert(version, config.clone());
            state
                .pools
                .entry(key.clone())
                .or_default()
                .insert(version, VersionPool::new());
            self.inner
                .events
                .append(events::agent::CONFIG_UPDATE, json!(config));

            if let Err(e) = self.populate_pool(&mut state, &config).await {
                self.discard_version(&mut state, &key, version).await;
                let history = state.configs.get_mut(&key).expect("checked above");
                history.versions.remove(&version);
                history.latest = previous.version;
                if let Some(pools) = state.pools.get_mut(&key) {
                    pools.remove(&version);
                }
                return Err(e);
            }

            Self::mark_stale_versions(&mut state);
            self.persist(&state).await?;
            let available = Self::available_count(&state, &key, version);
            info!(config_id = %config.config_id(), "agent config updated");
            (config, available, !state.stale.is_empty())
        };

        if available > 0 {
            self.inner
                .observer
                .agent_available(config.kind, &config.agent_type, config.version, available)
                .await;
        }
        if has_stale {
            self.spawn_cleanup_job();
        }
        Ok(config)
    }

    /// Check out a worker of (kind, type). A free instance is preferred;
    /// under capacity a new one is created; otherwise the pool is
    /// exhausted.
    pub async fn acquire_agent(
        &self,
        kind: AgentKind,
        agent_type: &str,
        version: Option<u32>,
    ) -> ForemanResult<(AgentId, Arc<dyn Worker>)> {
        let mut state = self.inner.state.lock().await;
        let key = (kind, agent_type.to_string());
        let history = state
            .configs
            .get(&key)
            .ok_or_else(|| ForemanError::NotFound(format!("agent config {kind}:{agent_type}")))?;
        let version = version.unwrap_or(history.latest);
        let config = history
            .versions
            .get(&version)
            .ok_or_else(|| {
                ForemanError::NotFound(format!("agent config {kind}:{agent_type}:v{version}"))
            })?
            .clone();

        let pool = state
            .pools
            .get_mut(&key)
            .and_then(|p| p.get_mut(&version))
            .ok_or_else(|| {
                ForemanError::NotFound(format!("pool {kind}:{agent_type}:v{version}"))
            })?;

        if let Some(id) = pool.take_free() {
            let worker = pool.agents.get(&id).expect("free id is live").worker.clone();
            self.inner
                .events
                .append(events::agent::ACQUIRE, json!({ "agent_id": id }));
            self.emit_pool_change(&state, &key);
            debug!(agent_id = %id, "acquired pooled agent");
            return Ok((id, worker));
        }

        if config.max_pool_size > 0 && pool.live_count() >= config.max_pool_size {
            return Err(ForemanError::PoolExhausted(format!(
                "{kind}:{agent_type}:v{version} has {} of {} instances in use",
                pool.live_count(),
                config.max_pool_size
            )));
        }

        let id = AgentId::new(kind, agent_type, pool.created_count + 1, version);
        let worker = self.inner.lifecycle.on_create(&config, &id).await?;
        let pool = state
            .pools
            .get_mut(&key)
            .and_then(|p| p.get_mut(&version))
            .expect("pool present");
        pool.created_count += 1;
        pool.insert(id.clone(), worker.clone(), true);
        self.inner
            .events
            .append(events::agent::CREATE, json!({ "agent_id": id, "config_id": config.config_id() }));
        self.inner
            .events
            .append(events::agent::ACQUIRE, json!({ "agent_id": id }));
        self.emit_pool_change(&state, &key);
        info!(agent_id = %id, "created agent on demand");
        Ok((id, worker))
    }

    /// Return a checked-out worker. Latest-version instances go back to
    /// the free queue; stale-version (or pool-disabled) instances are
    /// destroyed, retiring their version once the live set drains.
    pub async fn release_agent(&self, id: &AgentId) -> ForemanResult<()> {
        let (kind, agent_type, available, has_stale) = {
            let mut state = self.inner.state.lock().await;
            let key = (id.kind, id.agent_type.clone());
            let history = state
                .configs
                .get(&key)
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?;
            let latest = history.latest;
            let config = history
                .versions
                .get(&id.version)
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?
                .clone();

            let pool = state
                .pools
                .get_mut(&key)
                .and_then(|p| p.get_mut(&id.version))
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?;
            let in_use = pool
                .agents
                .get(id)
                .map(|a| a.in_use)
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?;
            if !in_use {
                return Err(ForemanError::NotFound(format!(
                    "agent {id} is not checked out"
                )));
            }

            let mut available = 0;
            if id.version == latest && config.pooling_enabled() {
                pool.mark_free(id);
                self.inner
                    .events
                    .append(events::agent::RELEASE, json!({ "agent_id": id }));
                available = 1;
            } else {
                let removed = pool.remove(id).expect("checked above");
                self.inner
                    .events
                    .append(events::agent::RELEASE, json!({ "agent_id": id }));
                self.destroy_worker(removed.worker).await;
                self.inner
                    .events
                    .append(events::agent::DESTROY, json!({ "agent_id": id }));
                if id.version != latest {
                    self.retire_if_drained(&mut state, &key, id.version).await?;
                }
            }

            Self::mark_stale_versions(&mut state);
            self.emit_pool_change(&state, &key);
            (id.kind, id.agent_type.clone(), available, !state.stale.is_empty())
        };

        if available > 0 {
            self.inner
                .observer
                .agent_available(kind, &agent_type, id.version, available)
                .await;
        }
        if has_stale {
            self.spawn_cleanup_job();
        }
        Ok(())
    }

    /// Latest version of every registered template.
    pub async fn get_all_agent_configs(&self) -> Vec<AgentConfig> {
        let state = self.inner.state.lock().await;
        let mut configs: Vec<AgentConfig> = state
            .configs
            .values()
            .filter_map(|h| h.versions.get(&h.latest).cloned())
            .collect();
        configs.sort_by(|a, b| {
            (a.kind.to_string(), &a.agent_type).cmp(&(b.kind.to_string(), &b.agent_type))
        });
        configs
    }

    /// A specific version of a template, defaulting to the latest.
    pub async fn get_agent_config(
        &self,
        kind: AgentKind,
        agent_type: &str,
        version: Option<u32>,
    ) -> ForemanResult<AgentConfig> {
        let state = self.inner.state.lock().await;
        let history = state
            .configs
            .get(&(kind, agent_type.to_string()))
            .ok_or_else(|| ForemanError::NotFound(format!("agent config {kind}:{agent_type}")))?;
        let version = version.unwrap_or(history.latest);
        history.versions.get(&version).cloned().ok_or_else(|| {
            ForemanError::NotFound(format!("agent config {kind}:{agent_type}:v{version}"))
        })
    }

    /// Live instances matching the filter, across all pools.
    pub async fn get_active_agents(&self, filter: &AgentFilter) -> Vec<ActiveAgent> {
        let state = self.inner.state.lock().await;
        let mut agents: Vec<ActiveAgent> = state
            .pools
            .values()
            .flat_map(|versions| versions.values())
            .flat_map(|pool| {
                pool.agents.iter().map(|(id, a)| ActiveAgent {
                    agent_id: id.clone(),
                    in_use: a.in_use,
                })
            })
            .filter(|a| filter.matches(a))
            .collect();
        agents.sort_by_key(|a| a.agent_id.to_string());
        agents
    }

    /// One live instance by id.
    pub async fn get_agent(&self, id: &AgentId) -> ForemanResult<ActiveAgent> {
        let state = self.inner.state.lock().await;
        state
            .pools
            .get(&(id.kind, id.agent_type.clone()))
            .and_then(|p| p.get(&id.version))
            .and_then(|pool| pool.agents.get(id))
            .map(|a| ActiveAgent {
                agent_id: id.clone(),
                in_use: a.in_use,
            })
            .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))
    }

    /// Aggregate + per-version pool snapshot for a (kind, type).
    pub async fn get_pool_stats(&self, kind: AgentKind, agent_type: &str) -> ForemanResult<PoolStats> {
        let state = self.inner.state.lock().await;
        let key = (kind, agent_type.to_string());
        if !state.configs.contains_key(&key) {
            return Err(ForemanError::NotFound(format!(
                "agent config {kind}:{agent_type}"
            )));
        }
        Ok(Self::stats_for(&state, &key))
    }

    /// One sweep over the marked stale versions: destroy idle instances,
    /// retire fully drained versions. Returns true when the sweep made
    /// progress. The background job calls this once per tick; tests call
    /// it directly.
    pub async fn cleanup_pass(&self) -> ForemanResult<bool> {
        let mut state = self.inner.state.lock().await;
        let marked: Vec<(AgentKind, String, u32)> = state.stale.iter().cloned().collect();
        let mut progress = false;

        for entry in marked {
            let key = (entry.0, entry.1.clone());
            let version = entry.2;
            let idle = match state.pools.get(&key).and_then(|p| p.get(&version)) {
                Some(pool) => pool.idle_ids(),
                None => {
                    state.stale.remove(&entry);
                    continue;
                }
            };

            for id in idle {
                let removed = state
                    .pools
                    .get_mut(&key)
                    .and_then(|p| p.get_mut(&version))
                    .and_then(|pool| pool.remove(&id));
                if let Some(removed) = removed {
                    self.destroy_worker(removed.worker).await;
                    self.inner
                        .events
                        .append(events::agent::DESTROY, json!({ "agent_id": id }));
                    progress = true;
                }
            }

            if self.retire_if_drained(&mut state, &key, version).await? {
                state.stale.remove(&entry);
                progress = true;
            }
            self.emit_pool_change(&state, &key);
        }
        Ok(progress)
    }

    /// Whether any stale versions are still marked.
    pub async fn has_stale_versions(&self) -> bool {
        !self.inner.state.lock().await.stale.is_empty()
    }

    /// Replay the workspace snapshot. Pools start empty; instances are
    /// never persisted.
    pub async fn restore(&self) -> ForemanResult<()> {
        let configs: Vec<AgentConfig> = self.inner.scope.read_snapshot(SNAPSHOT_FILE).await?;
        let mut announced = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            for config in configs {
                let key = (config.kind, config.agent_type.clone());
                state
                    .pools
                    .entry(key.clone())
                    .or_default()
                    .insert(config.version, VersionPool::new());
                self.inner
                    .events
                    .append(events::agent::CONFIG_CREATE, json!(config));
                info!(config_id = %config.config_id(), "restored agent config");
                let history = state.configs.entry(key.clone()).or_insert(ConfigHistory {
                    latest: config.version,
                    versions: BTreeMap::new(),
                });
                history.latest = history.latest.max(config.version);
                history.versions.insert(config.version, config);
                if !announced.contains(&key) {
                    announced.push(key);
                }
            }
        }
        for (kind, agent_type) in announced {
            self.inner
                .observer
                .agent_config_created(kind, &agent_type)
                .await;
        }
        Ok(())
    }

    // --- internals ---

    /// Pre-create instances up to `max_pool_size` when the config asks
    /// for it. Caller handles rollback on failure.
    async fn populate_pool(
        &self,
        state: &mut RegistryState,
        config: &AgentConfig,
    ) -> ForemanResult<()> {
        if !config.auto_populate_pool || config.max_pool_size == 0 {
            return Ok(());
        }
        let key = (config.kind, config.agent_type.clone());
        loop {
            let pool = state
                .pools
                .get_mut(&key)
                .and_then(|p| p.get_mut(&config.version))
                .expect("pool initialized before population");
            if pool.live_count() >= config.max_pool_size {
                break;
            }
            let id = AgentId::new(
                config.kind,
                config.agent_type.clone(),
                pool.created_count + 1,
                config.version,
            );
            let worker = self.inner.lifecycle.on_create(config, &id).await?;
            let pool = state
                .pools
                .get_mut(&key)
                .and_then(|p| p.get_mut(&config.version))
                .expect("pool initialized before population");
            pool.created_count += 1;
            pool.insert(id.clone(), worker, false);
            self.inner.events.append(
                events::agent::CREATE,
                json!({ "agent_id": id, "config_id": config.config_id() }),
            );
        }
        self.emit_pool_change(state, &key);
        Ok(())
    }

    /// Destroy every instance of a version that failed mid-population.
    async fn discard_version(&self, state: &mut RegistryState, key: &PoolKey, version: u32) {
        let ids: Vec<AgentId> = state
            .pools
            .get_mut(key)
            .and_then(|p| p.get_mut(&version))
            .map(|pool| pool.agents.keys().cloned().collect())
            .unwrap_or_default();
        for id in ids {
            let removed = state
                .pools
                .get_mut(key)
                .and_then(|p| p.get_mut(&version))
                .and_then(|pool| pool.remove(&id));
            if let Some(removed) = removed {
                self.destroy_worker(removed.worker).await;
                self.inner
                    .events
                    .append(events::agent::DESTROY, json!({ "agent_id": id }));
            }
        }
    }

    /// Remove a drained non-latest version record and its config entry.
    async fn retire_if_drained(
        &self,
        state: &mut RegistryState,
        key: &PoolKey,
        version: u32,
    ) -> ForemanResult<bool> {
        let latest = match state.configs.get(key) {
            Some(h) => h.latest,
            None => return Ok(false),
        };
        if version == latest {
            return Ok(false);
        }
        let drained = state
            .pools
            .get(key)
            .and_then(|p| p.get(&version))
            .map(|pool| pool.live_count() == 0)
            .unwrap_or(false);
        if !drained {
            return Ok(false);
        }

        if let Some(pools) = state.pools.get_mut(key) {
            pools.remove(&version);
        }
        if let Some(history) = state.configs.get_mut(key) {
            history.versions.remove(&version);
        }
        self.inner.events.append(
            events::agent::CONFIG_DESTROY,
            json!({ "config_id": AgentConfigId::new(key.0, key.1.clone(), version) }),
        );
        self.persist(state).await?;
        info!(kind = %key.0, agent_type = %key.1, version, "retired stale agent config version");
        Ok(true)
    }

    async fn destroy_worker(&self, worker: Arc<dyn Worker>) {
        let id = worker.agent_id().clone();
        if let Err(e) = self.inner.lifecycle.on_destroy(worker).await {
            warn!(agent_id = %id, error = %e, "agent teardown failed");
        }
    }

    /// Mark every non-latest version that still has live instances.
    fn mark_stale_versions(state: &mut RegistryState) {
        let mut marked = Vec::new();
        for (key, history) in &state.configs {
            let Some(versions) = state.pools.get(key) else {
                continue;
            };
            for (&version, pool) in versions {
                if version != history.latest && pool.live_count() > 0 {
                    marked.push((key.0, key.1.clone(), version));
                }
            }
        }
        state.stale.extend(marked);
    }

    fn available_count(state: &RegistryState, key: &PoolKey, version: u32) -> usize {
        let Some(history) = state.configs.get(key) else {
            return 0;
        };
        let Some(config) = history.versions.get(&version) else {
            return 0;
        };
        let Some(pool) = state.pools.get(key).and_then(|p| p.get(&version)) else {
            return 0;
        };
        if config.max_pool_size == 0 {
            // On-demand: capacity is unbounded, report a single slot.
            1
        } else {
            pool.free_count() + (config.max_pool_size - pool.live_count().min(config.max_pool_size))
        }
    }

    fn stats_for(state: &RegistryState, key: &PoolKey) -> PoolStats {
        let mut stats = PoolStats {
            kind: key.0,
            agent_type: key.1.clone(),
            total_live: 0,
            total_free: 0,
            total_in_use: 0,
            versions: Vec::new(),
        };
        let history = state.configs.get(key);
        if let Some(versions) = state.pools.get(key) {
            for (&version, pool) in versions {
                let max_pool_size = history
                    .and_then(|h| h.versions.get(&version))
                    .map(|c| c.max_pool_size)
                    .unwrap_or(0);
                stats.total_live += pool.live_count();
                stats.total_free += pool.free_count();
                stats.total_in_use += pool.in_use_count();
                stats.versions.push(VersionPoolStats {
                    version,
                    live: pool.live_count(),
                    free: pool.free_count(),
                    in_use: pool.in_use_count(),
                    max_pool_size,
                });
            }
        }
        stats
    }

    fn emit_pool_change(&self, state: &RegistryState, key: &PoolKey) {
        self.inner
            .events
            .append(events::agent::POOL_CHANGE, json!(Self::stats_for(state, key)));
    }

    /// Rewrite the full config set (latest versions) to the workspace.
    async fn persist(&self, state: &RegistryState) -> ForemanResult<()> {
        let mut snapshot: Vec<AgentConfig> = state
            .configs
            .values()
            .filter_map(|h| h.versions.get(&h.latest).cloned())
            .collect();
        snapshot.sort_by(|a, b| {
            (a.kind.to_string(), &a.agent_type).cmp(&(b.kind.to_string(), &b.agent_type))
        });
        self.inner.scope.write_snapshot(SNAPSHOT_FILE, &snapshot).await
    }

    /// Start the background sweep unless one is already running. The job
    /// exits when the marked set drains or a pass makes no progress.
    fn spawn_cleanup_job(&self) {
        if self.inner.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(registry.inner.cleanup_tick_ms)).await;
                let progress = match registry.cleanup_pass().await {
                    Ok(progress) => progress,
                    Err(e) => {
                        warn!(error = %e, "stale pool sweep failed");
                        break;
                    }
                };
                if !registry.has_stale_versions().await || !progress {
                    break;
                }
            }
            registry.inner.cleanup_running.store(false, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl AgentAcquirer for AgentRegistry {
    async fn acquire(
        &self,
        kind: AgentKind,
        agent_type: &str,
        version: Option<u32>,
    ) -> ForemanResult<(AgentId, Arc<dyn Worker>)> {
        self.acquire_agent(kind, agent_type, version).await
    }

    async fn release(&self, id: &AgentId) -> ForemanResult<()> {
        self.release_agent(id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::tools::StaticToolFactory;
    use foreman_workspace::Workspace;
    use std::sync::atomic::AtomicUsize;

    struct MockWorker {
        id: AgentId,
    }

    impl Worker for MockWorker {
        fn agent_id(&self) -> &AgentId {
            &self.id
        }
    }

    struct MockLifecycle {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail_creates: AtomicBool,
    }

    impl MockLifecycle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                fail_creates: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl AgentLifecycle for MockLifecycle {
        async fn on_create(
            &self,
            _config: &AgentConfig,
            id: &AgentId,
        ) -> ForemanResult<Arc<dyn Worker>> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(ForemanError::IllegalState("runtime down".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockWorker { id: id.clone() }))
        }

        async fn on_destroy(&self, _worker: Arc<dyn Worker>) -> ForemanResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RegistryObserver for RecordingObserver {
        async fn agent_config_created(&self, kind: AgentKind, agent_type: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("created {kind}:{agent_type}"));
        }

        async fn agent_available(
            &self,
            kind: AgentKind,
            agent_type: &str,
            version: u32,
            count: usize,
        ) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("available {kind}:{agent_type}:v{version} x{count}"));
        }
    }

    async fn setup() -> (
        AgentRegistry,
        Arc<MockLifecycle>,
        Arc<RecordingObserver>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), "test").await.unwrap();
        let events = EventLog::open(dir.path().join("logs"), events::AGENT_STREAM)
            .await
            .unwrap();
        let lifecycle = MockLifecycle::new();
        let observer = Arc::new(RecordingObserver::default());
        let registry = AgentRegistry::new(
            lifecycle.clone(),
            observer.clone(),
            events,
            ws.scope("agent_registry"),
            10,
        );
        (registry, lifecycle, observer, dir)
    }

    fn poet(max_pool_size: usize, auto_populate_pool: bool) -> NewAgentConfig {
        NewAgentConfig {
            kind: AgentKind::Operator,
            agent_type: "poet".into(),
            instructions: "write poems".into(),
            description: "a poet".into(),
            tools: vec![],
            max_pool_size,
            auto_populate_pool,
        }
    }

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let (registry, _, observer, _dir) = setup().await;
        let cfg = registry.create_agent_config(poet(2, false)).await.unwrap();
        assert_eq!(cfg.version, 1);
        assert!(matches!(
            registry.create_agent_config(poet(2, false)).await,
            Err(ForemanError::DuplicateType(_))
        ));
        let calls = observer.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "created operator:poet"));
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let (registry, _, _, _dir) = setup().await;
        registry
            .register_tools_factory(
                AgentKind::Operator,
                Arc::new(StaticToolFactory::new(vec![ToolDescriptor::new(
                    "rhyme", "",
                )])),
            )
            .await
            .unwrap();

        let mut bad = poet(1, false);
        bad.tools = vec!["chainsaw".into()];
        assert!(matches!(
            registry.create_agent_config(bad).await,
            Err(ForemanError::UnknownTool(_))
        ));

        let mut good = poet(1, false);
        good.tools = vec!["rhyme".into()];
        assert!(registry.create_agent_config(good).await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_saturates_then_drains() {
        let (registry, lifecycle, _, _dir) = setup().await;
        registry.create_agent_config(poet(2, false)).await.unwrap();

        let (a1, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        let (a2, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        assert_eq!(a1.num, 1);
        assert_eq!(a2.num, 2);
        assert_eq!(lifecycle.created.load(Ordering::SeqCst), 2);

        assert!(matches!(
            registry.acquire_agent(AgentKind::Operator, "poet", None).await,
            Err(ForemanError::PoolExhausted(_))
        ));

        registry.release_agent(&a1).await.unwrap();
        let stats = registry
            .get_pool_stats(AgentKind::Operator, "poet")
            .await
            .unwrap();
        assert_eq!(stats.total_free, 1);
        assert_eq!(stats.total_in_use, 1);

        // The freed instance comes back instead of a new one.
        let (a4, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        assert_eq!(a4, a1);
        assert_eq!(lifecycle.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_twice_is_not_found() {
        let (registry, _, _, _dir) = setup().await;
        registry.create_agent_config(poet(1, false)).await.unwrap();
        let (id, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        registry.release_agent(&id).await.unwrap();
        assert!(matches!(
            registry.release_agent(&id).await,
            Err(ForemanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_pool_size_creates_on_demand_and_destroys() {
        let (registry, lifecycle, _, _dir) = setup().await;
        registry.create_agent_config(poet(0, false)).await.unwrap();

        let (a1, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        let (a2, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        assert_ne!(a1, a2);
        assert_eq!(lifecycle.created.load(Ordering::SeqCst), 2);

        registry.release_agent(&a1).await.unwrap();
        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert!(registry.get_agent(&a1).await.is_err());

        // Numbers are never reused.
        let (a3, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        assert_eq!(a3.num, 3);
    }

    #[tokio::test]
    async fn test_auto_populate_fills_pool() {
        let (registry, lifecycle, _, _dir) = setup().await;
        registry.create_agent_config(poet(3, true)).await.unwrap();
        assert_eq!(lifecycle.created.load(Ordering::SeqCst), 3);

        let stats = registry
            .get_pool_stats(AgentKind::Operator, "poet")
            .await
            .unwrap();
        assert_eq!(stats.total_live, 3);
        assert_eq!(stats.total_free, 3);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_partial_state() {
        let (registry, lifecycle, _, _dir) = setup().await;
        lifecycle.fail_creates.store(true, Ordering::SeqCst);
        assert!(registry.create_agent_config(poet(2, true)).await.is_err());
        assert!(registry
            .get_agent_config(AgentKind::Operator, "poet", None)
            .await
            .is_err());

        // A later create of the same type succeeds cleanly.
        lifecycle.fail_creates.store(false, Ordering::SeqCst);
        assert!(registry.create_agent_config(poet(2, true)).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_retires_stale_version() {
        let (registry, lifecycle, _, _dir) = setup().await;
        registry.create_agent_config(poet(1, true)).await.unwrap();

        let update = AgentConfigUpdate {
            instructions: Some("write limericks".into()),
            ..AgentConfigUpdate::for_type(AgentKind::Operator, "poet")
        };
        let v2 = registry.update_agent_config(update).await.unwrap();
        assert_eq!(v2.version, 2);

        // The idle v1 instance is swept and the version retired.
        registry.cleanup_pass().await.unwrap();
        assert!(!registry.has_stale_versions().await);
        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            registry
                .get_agent_config(AgentKind::Operator, "poet", Some(1))
                .await,
            Err(ForemanError::NotFound(_))
        ));
        assert_eq!(
            registry
                .get_agent_config(AgentKind::Operator, "poet", None)
                .await
                .unwrap()
                .version,
            2
        );
    }

    #[tokio::test]
    async fn test_in_use_stale_instance_survives_sweep_until_release() {
        let (registry, _, _, _dir) = setup().await;
        registry.create_agent_config(poet(1, false)).await.unwrap();
        let (id, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();

        registry
            .update_agent_config(AgentConfigUpdate::for_type(AgentKind::Operator, "poet"))
            .await
            .unwrap();

        // The in-use v1 instance cannot be destroyed yet.
        registry.cleanup_pass().await.unwrap();
        assert!(registry.get_agent(&id).await.is_ok());

        // Releasing a stale-version instance destroys it and retires v1.
        registry.release_agent(&id).await.unwrap();
        assert!(registry.get_agent(&id).await.is_err());
        assert!(matches!(
            registry
                .get_agent_config(AgentKind::Operator, "poet", Some(1))
                .await,
            Err(ForemanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_acquire_specific_version() {
        let (registry, _, _, _dir) = setup().await;
        registry.create_agent_config(poet(2, false)).await.unwrap();
        let (v1_agent, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        registry
            .update_agent_config(AgentConfigUpdate::for_type(AgentKind::Operator, "poet"))
            .await
            .unwrap();

        let (v2_agent, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        assert_eq!(v2_agent.version, 2);

        let (again, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", Some(1))
            .await
            .unwrap();
        assert_eq!(again.version, 1);
        assert_ne!(again, v1_agent);
    }

    #[tokio::test]
    async fn test_observer_sees_release_availability() {
        let (registry, _, observer, _dir) = setup().await;
        registry.create_agent_config(poet(1, false)).await.unwrap();
        let (id, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        registry.release_agent(&id).await.unwrap();

        let calls = observer.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "available operator:poet:v1 x1"));
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path(), "test").await.unwrap();
        {
            let events = EventLog::open(dir.path().join("logs"), events::AGENT_STREAM)
                .await
                .unwrap();
            let registry = AgentRegistry::new(
                MockLifecycle::new(),
                Arc::new(RecordingObserver::default()),
                events,
                ws.scope("agent_registry"),
                10,
            );
            registry.create_agent_config(poet(2, false)).await.unwrap();
            registry
                .update_agent_config(AgentConfigUpdate::for_type(AgentKind::Operator, "poet"))
                .await
                .unwrap();
        }

        let events = EventLog::open(dir.path().join("logs"), events::AGENT_STREAM)
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let restored = AgentRegistry::new(
            MockLifecycle::new(),
            observer.clone(),
            events,
            ws.scope("agent_registry"),
            10,
        );
        restored.restore().await.unwrap();

        let cfg = restored
            .get_agent_config(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        assert_eq!(cfg.version, 2);
        // Pools come back empty; instances are ephemeral.
        let stats = restored
            .get_pool_stats(AgentKind::Operator, "poet")
            .await
            .unwrap();
        assert_eq!(stats.total_live, 0);
        // The type is re-announced so task routing can re-register it.
        let calls = observer.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "created operator:poet"));
    }

    #[tokio::test]
    async fn test_events_trace_acquire_release() {
        let (registry, _, _, _dir) = setup().await;
        registry.create_agent_config(poet(1, false)).await.unwrap();
        let (id, _) = registry
            .acquire_agent(AgentKind::Operator, "poet", None)
            .await
            .unwrap();
        registry.release_agent(&id).await.unwrap();

        let log = registry.inner.events.clone();
        log.flush().await;
        let records = foreman_workspace::read_records(log.path()).await.unwrap();
        let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
        assert!(kinds.contains(&"agent_config_create"));
        assert!(kinds.contains(&"agent_create"));
        assert!(kinds.contains(&"agent_acquire"));
        assert!(kinds.contains(&"agent_release"));
        // Acquire precedes release in the stream.
        let acquire_at = kinds.iter().position(|k| *k == "agent_acquire").unwrap();
        let release_at = kinds.iter().position(|k| *k == "agent_release").unwrap();
        assert!(acquire_at < release_at);
    }
}
