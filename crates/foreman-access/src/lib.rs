//! Resource-level access control.
//!
//! A flat `(resource, principal) → permission bits` table used by the task
//! manager to gate every operation. Authentication is out of scope; the
//! table authorizes identities that are already trusted to be who they
//! claim.

pub mod permissions;
pub mod registry;

pub use permissions::Permissions;
pub use registry::ResourceRegistry;
