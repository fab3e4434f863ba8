//! Agent registry: versioned worker templates, per-version instance
//! pools with acquire/release semantics, tool catalogs, and deferred
//! retirement of stale versions.
//!
//! # Main types
//!
//! - [`AgentRegistry`] — configuration store and pool broker.
//! - [`AgentConfig`] / [`AgentConfigUpdate`] — versioned templates.
//! - [`AgentLifecycle`] — seam to the external worker runtime.
//! - [`ToolFactoryRegistry`] — per-kind tool catalogs.

pub mod config;
pub mod pool;
pub mod registry;
pub mod tools;

pub use config::{AgentConfig, AgentConfigUpdate, NewAgentConfig};
pub use pool::{ActiveAgent, AgentFilter, PoolStats, VersionPoolStats};
pub use registry::{AgentLifecycle, AgentRegistry, SNAPSHOT_FILE};
pub use tools::{StaticToolFactory, ToolDescriptor, ToolFactory, ToolFactoryRegistry};
