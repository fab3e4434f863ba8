//! Trait seams between the control-plane components and their
//! collaborators.
//!
//! The registry and the task manager never reference each other's types:
//! the registry announces through a [`RegistryObserver`] supplied at
//! construction, and the manager reaches workers only through the narrow
//! [`AgentAcquirer`] interface.

use crate::error::ForemanResult;
use crate::id::{AgentId, AgentKind};
use async_trait::async_trait;
use std::sync::Arc;

/// A live worker instance. The runtime that materializes workers lives
/// outside the control plane; the pool only stores the handle and hands it
/// back on acquire.
pub trait Worker: Send + Sync {
    fn agent_id(&self) -> &AgentId;
}

/// Callback surface the registry notifies as configuration and pool state
/// change. The task manager implements this.
#[async_trait]
pub trait RegistryObserver: Send + Sync {
    /// A new (kind, type) became available as a worker template.
    async fn agent_config_created(&self, kind: AgentKind, agent_type: &str);

    /// `count` workers of (kind, type, version) can now be acquired.
    /// Fired on release and on config creation.
    async fn agent_available(&self, kind: AgentKind, agent_type: &str, version: u32, count: usize);
}

/// The slice of the registry the task manager (and the external run
/// executor) is allowed to see.
#[async_trait]
pub trait AgentAcquirer: Send + Sync {
    /// Check out a free worker of (kind, type), creating one on demand if
    /// the pool has headroom. `version` defaults to the latest config.
    async fn acquire(
        &self,
        kind: AgentKind,
        agent_type: &str,
        version: Option<u32>,
    ) -> ForemanResult<(AgentId, Arc<dyn Worker>)>;

    /// Return a checked-out worker to its pool (or destroy it if its
    /// version went stale).
    async fn release(&self, id: &AgentId) -> ForemanResult<()>;
}
