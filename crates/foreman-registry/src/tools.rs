use foreman_core::{AgentKind, ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Name and description of one tool a worker kind may be equipped with.
/// The constructors themselves belong to the worker runtime; the control
/// plane only needs the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Source of the tool catalog for one agent kind.
pub trait ToolFactory: Send + Sync {
    fn tools(&self) -> Vec<ToolDescriptor>;
}

/// A fixed catalog, handy for kinds whose tool set is known up front.
pub struct StaticToolFactory {
    descriptors: Vec<ToolDescriptor>,
}

impl StaticToolFactory {
    pub fn new(descriptors: Vec<ToolDescriptor>) -> Self {
        Self { descriptors }
    }
}

impl ToolFactory for StaticToolFactory {
    fn tools(&self) -> Vec<ToolDescriptor> {
        self.descriptors.clone()
    }
}

/// Per-kind directory of tool factories.
#[derive(Default)]
pub struct ToolFactoryRegistry {
    factories: HashMap<AgentKind, Arc<dyn ToolFactory>>,
}

impl ToolFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a factory to a kind. A kind can be bound once.
    pub fn register(&mut self, kind: AgentKind, factory: Arc<dyn ToolFactory>) -> ForemanResult<()> {
        if self.factories.contains_key(&kind) {
            return Err(ForemanError::IllegalState(format!(
                "tools factory for kind '{kind}' is already registered"
            )));
        }
        info!(kind = %kind, tools = factory.tools().len(), "registered tools factory");
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub fn is_registered(&self, kind: AgentKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Catalog for a kind; `None` when no factory is bound.
    pub fn descriptors(&self, kind: AgentKind) -> Option<Vec<ToolDescriptor>> {
        self.factories.get(&kind).map(|f| f.tools())
    }

    /// Verify that every requested tool name exists in the kind's catalog.
    /// An empty request is always valid and means "no tools".
    pub fn validate(&self, kind: AgentKind, requested: &[String]) -> ForemanResult<()> {
        if requested.is_empty() {
            return Ok(());
        }
        let catalog = self.descriptors(kind).ok_or_else(|| {
            ForemanError::UnknownTool(format!("no tools factory registered for kind '{kind}'"))
        })?;
        for name in requested {
            if !catalog.iter().any(|t| &t.name == name) {
                return Err(ForemanError::UnknownTool(name.clone()));
            }
        }
        Ok(())
    }
}
