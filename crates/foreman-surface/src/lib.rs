//! Supervisor-facing surface of the control plane: the typed operation
//! set, the dispatch toolbox with feature switches, and the boot wiring
//! that assembles workspace, event streams, registry, and manager.

pub mod control;
pub mod ops;
pub mod toolbox;

pub use control::ControlPlane;
pub use ops::{ManagerOp, OpResponse, RegistryOp};
pub use toolbox::SupervisorToolbox;
