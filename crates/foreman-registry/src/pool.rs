//! In-memory pool bookkeeping for one (kind, type, version).
//!
//! Invariants the registry leans on: the free queue only holds ids present
//! in the live map, a live instance is either in the free queue or marked
//! in-use, and `created_count` never decreases while any id derived from
//! it is alive (instance numbers are never reused).

use foreman_core::{AgentId, AgentKind, Worker};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub(crate) struct PooledAgent {
    pub worker: Arc<dyn Worker>,
    pub in_use: bool,
}

#[derive(Default)]
pub(crate) struct VersionPool {
    /// Total instances ever created for this version; the next instance
    /// number is `created_count + 1`.
    pub created_count: u32,
    pub agents: HashMap<AgentId, PooledAgent>,
    /// Free instances in insertion order; the front is acquired first.
    pub free: VecDeque<AgentId>,
}

impl VersionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.agents.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.agents.len() - self.free.len()
    }

    /// Take the oldest free instance and mark it in use.
    pub fn take_free(&mut self) -> Option<AgentId> {
        let id = self.free.pop_front()?;
        if let Some(agent) = self.agents.get_mut(&id) {
            agent.in_use = true;
        }
        Some(id)
    }

    /// Insert a freshly created instance.
    pub fn insert(&mut self, id: AgentId, worker: Arc<dyn Worker>, in_use: bool) {
        if !in_use {
            self.free.push_back(id.clone());
        }
        self.agents.insert(id, PooledAgent { worker, in_use });
    }

    /// Return an in-use instance to the free queue.
    pub fn mark_free(&mut self, id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.in_use = false;
            self.free.push_back(id.clone());
        }
    }

    /// Remove an instance entirely (free or in use).
    pub fn remove(&mut self, id: &AgentId) -> Option<PooledAgent> {
        self.free.retain(|f| f != id);
        self.agents.remove(id)
    }

    /// Ids of every instance not currently in use.
    pub fn idle_ids(&self) -> Vec<AgentId> {
        self.free.iter().cloned().collect()
    }
}

/// Per-version slice of [`PoolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct VersionPoolStats {
    pub version: u32,
    pub live: usize,
    pub free: usize,
    pub in_use: usize,
    pub max_pool_size: usize,
}

/// Aggregate pool snapshot for one (kind, type), with the per-version
/// breakdown monitors chart.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub kind: AgentKind,
    pub agent_type: String,
    pub total_live: usize,
    pub total_free: usize,
    pub total_in_use: usize,
    pub versions: Vec<VersionPoolStats>,
}

/// Query view of one live instance.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveAgent {
    pub agent_id: AgentId,
    pub in_use: bool,
}

/// Filter for [`ActiveAgent`] listings; unset fields match everything.
#[derive(Debug, Clone, Default, serde::Deserialize, Serialize)]
pub struct AgentFilter {
    #[serde(default)]
    pub kind: Option<AgentKind>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub in_use: Option<bool>,
}

impl AgentFilter {
    pub fn matches(&self, agent: &ActiveAgent) -> bool {
        if let Some(kind) = self.kind {
            if agent.agent_id.kind != kind {
                return false;
            }
        }
        if let Some(agent_type) = &self.agent_type {
            if &agent.agent_id.agent_type != agent_type {
                return false;
            }
        }
        if let Some(in_use) = self.in_use {
            if agent.in_use != in_use {
                return false;
            }
        }
        true
    }
}
