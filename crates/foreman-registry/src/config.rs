use foreman_core::{AgentConfigId, AgentKind};
use serde::{Deserialize, Serialize};

/// One version of an agent template.
///
/// Versions are assigned by the registry: creation materializes version 1
/// and every update appends the next version. Instances carry the version
/// they were created against, so older versions linger until their last
/// instance is destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub kind: AgentKind,
    pub agent_type: String,
    /// System instructions handed to the worker runtime.
    pub instructions: String,
    pub description: String,
    /// Names of tools from the kind's factory. Empty means no tools.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Upper bound on live instances per version. Zero disables pooling:
    /// every acquire creates on demand and every release destroys.
    pub max_pool_size: usize,
    /// Pre-create instances up to `max_pool_size` when the version is
    /// materialized.
    pub auto_populate_pool: bool,
    pub version: u32,
}

impl AgentConfig {
    pub fn config_id(&self) -> AgentConfigId {
        AgentConfigId::new(self.kind, self.agent_type.clone(), self.version)
    }

    pub fn pooling_enabled(&self) -> bool {
        self.max_pool_size > 0
    }
}

/// Input for creating version 1 of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgentConfig {
    pub kind: AgentKind,
    pub agent_type: String,
    pub instructions: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_pool_size: usize,
    #[serde(default)]
    pub auto_populate_pool: bool,
}

impl NewAgentConfig {
    pub(crate) fn into_config(self, version: u32) -> AgentConfig {
        AgentConfig {
            kind: self.kind,
            agent_type: self.agent_type,
            instructions: self.instructions,
            description: self.description,
            tools: self.tools,
            max_pool_size: self.max_pool_size,
            auto_populate_pool: self.auto_populate_pool,
            version,
        }
    }
}

/// Explicit per-field overrides applied on top of the latest version to
/// produce the next one. Absent fields are carried over unchanged; there
/// is no recursive merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigUpdate {
    pub kind: AgentKind,
    pub agent_type: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub max_pool_size: Option<usize>,
    #[serde(default)]
    pub auto_populate_pool: Option<bool>,
}

impl AgentConfigUpdate {
    /// An update that changes nothing, as a base for field overrides.
    pub fn for_type(kind: AgentKind, agent_type: impl Into<String>) -> Self {
        Self {
            kind,
            agent_type: agent_type.into(),
            instructions: None,
            description: None,
            tools: None,
            max_pool_size: None,
            auto_populate_pool: None,
        }
    }

    pub(crate) fn apply(self, previous: &AgentConfig) -> AgentConfig {
        AgentConfig {
            kind: previous.kind,
            agent_type: previous.agent_type.clone(),
            instructions: self.instructions.unwrap_or_else(|| previous.instructions.clone()),
            description: self.description.unwrap_or_else(|| previous.description.clone()),
            tools: self.tools.unwrap_or_else(|| previous.tools.clone()),
            max_pool_size: self.max_pool_size.unwrap_or(previous.max_pool_size),
            auto_populate_pool: self
                .auto_populate_pool
                .unwrap_or(previous.auto_populate_pool),
            version: previous.version + 1,
        }
    }
}
