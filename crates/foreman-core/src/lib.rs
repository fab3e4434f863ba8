//! Shared vocabulary of the foreman control plane: structured identifiers,
//! error kinds, boot configuration, and the trait seams that decouple the
//! agent registry from the task manager.

pub mod config;
pub mod contract;
pub mod error;
pub mod id;

pub use config::{ControlPlaneConfig, ManagerOptions, RegistryOptions};
pub use contract::{AgentAcquirer, RegistryObserver, Worker};
pub use error::{ForemanError, ForemanResult};
pub use id::{AgentConfigId, AgentId, AgentKind, TaskConfigId, TaskRunId};
