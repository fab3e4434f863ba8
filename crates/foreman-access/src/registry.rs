use crate::permissions::Permissions;
use foreman_core::{ForemanError, ForemanResult};
use std::collections::HashMap;
use tracing::warn;

/// A guarded resource: an owner plus per-principal permission bits.
#[derive(Debug, Clone)]
struct Resource {
    owner: String,
    grants: HashMap<String, Permissions>,
}

/// Maps `(resource id, principal id)` to permission bits.
///
/// Principals are acting identities already assumed authentic; this layer
/// only answers "may principal P do X to resource R". Checks have no side
/// effects, so a denied operation leaves every table untouched.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, Resource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh resource. Registering an existing id is an error;
    /// destruction must be explicit.
    pub fn register_resource(
        &mut self,
        resource: impl Into<String>,
        owner: impl Into<String>,
    ) -> ForemanResult<()> {
        let resource = resource.into();
        if self.resources.contains_key(&resource) {
            return Err(ForemanError::IllegalState(format!(
                "resource '{resource}' is already registered"
            )));
        }
        self.resources.insert(
            resource,
            Resource {
                owner: owner.into(),
                grants: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Remove a resource and every principal entry attached to it.
    pub fn remove_resource(&mut self, resource: &str) -> ForemanResult<()> {
        self.resources
            .remove(resource)
            .map(|_| ())
            .ok_or_else(|| ForemanError::NotFound(format!("resource '{resource}'")))
    }

    /// Grant bits to a principal, merging with any prior grant.
    pub fn grant(
        &mut self,
        resource: &str,
        principal: impl Into<String>,
        perms: Permissions,
    ) -> ForemanResult<()> {
        let entry = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| ForemanError::NotFound(format!("resource '{resource}'")))?;
        let slot = entry
            .grants
            .entry(principal.into())
            .or_insert(Permissions::NONE);
        *slot = slot.union(perms);
        Ok(())
    }

    /// Drop specific bits from a principal's grant; an emptied grant is
    /// removed entirely.
    pub fn revoke(
        &mut self,
        resource: &str,
        principal: &str,
        perms: Permissions,
    ) -> ForemanResult<()> {
        let entry = self
            .resources
            .get_mut(resource)
            .ok_or_else(|| ForemanError::NotFound(format!("resource '{resource}'")))?;
        if let Some(slot) = entry.grants.get_mut(principal) {
            *slot = slot.difference(perms);
            if slot.is_empty() {
                entry.grants.remove(principal);
            }
        }
        Ok(())
    }

    /// Fail with `PermissionDenied` unless the principal holds all the
    /// required bits on the resource.
    pub fn check(
        &self,
        resource: &str,
        principal: &str,
        required: Permissions,
    ) -> ForemanResult<()> {
        if !self.resources.contains_key(resource) {
            return Err(ForemanError::NotFound(format!("resource '{resource}'")));
        }
        if self.permissions_of(resource, principal).contains(required) {
            Ok(())
        } else {
            warn!(resource, principal, required = %required, "access denied");
            Err(ForemanError::PermissionDenied(format!(
                "'{principal}' lacks {required} on '{resource}'"
            )))
        }
    }

    /// The bits a principal currently holds on a resource (NONE when the
    /// resource or grant is absent).
    pub fn permissions_of(&self, resource: &str, principal: &str) -> Permissions {
        self.resources
            .get(resource)
            .and_then(|r| r.grants.get(principal))
            .copied()
            .unwrap_or(Permissions::NONE)
    }

    pub fn owner_of(&self, resource: &str) -> Option<&str> {
        self.resources.get(resource).map(|r| r.owner.as_str())
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_check() {
        let mut reg = ResourceRegistry::new();
        reg.register_resource("task:poem:v1", "operator:poet[1]:v1")
            .unwrap();
        reg.grant("task:poem:v1", "supervisor:main[1]:v1", Permissions::READ_EXECUTE)
            .unwrap();

        assert!(reg
            .check("task:poem:v1", "supervisor:main[1]:v1", Permissions::READ)
            .is_ok());
        assert!(matches!(
            reg.check("task:poem:v1", "supervisor:main[1]:v1", Permissions::WRITE),
            Err(ForemanError::PermissionDenied(_))
        ));
        assert!(matches!(
            reg.check("task:poem:v1", "operator:other[1]:v1", Permissions::READ),
            Err(ForemanError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut reg = ResourceRegistry::new();
        reg.register_resource("r", "o").unwrap();
        assert!(matches!(
            reg.register_resource("r", "o"),
            Err(ForemanError::IllegalState(_))
        ));
    }

    #[test]
    fn test_unknown_resource_is_not_found() {
        let reg = ResourceRegistry::new();
        assert!(matches!(
            reg.check("ghost", "p", Permissions::READ),
            Err(ForemanError::NotFound(_))
        ));
    }

    #[test]
    fn test_grants_merge() {
        let mut reg = ResourceRegistry::new();
        reg.register_resource("r", "o").unwrap();
        reg.grant("r", "p", Permissions::READ).unwrap();
        reg.grant("r", "p", Permissions::EXECUTE).unwrap();
        assert_eq!(reg.permissions_of("r", "p"), Permissions::READ_EXECUTE);
    }

    #[test]
    fn test_revoke() {
        let mut reg = ResourceRegistry::new();
        reg.register_resource("r", "o").unwrap();
        reg.grant("r", "p", Permissions::FULL).unwrap();
        reg.revoke("r", "p", Permissions::WRITE).unwrap();
        assert_eq!(reg.permissions_of("r", "p"), Permissions::READ_EXECUTE);
        reg.revoke("r", "p", Permissions::FULL).unwrap();
        assert_eq!(reg.permissions_of("r", "p"), Permissions::NONE);
    }

    #[test]
    fn test_remove_resource_drops_grants() {
        let mut reg = ResourceRegistry::new();
        reg.register_resource("r", "o").unwrap();
        reg.grant("r", "p", Permissions::FULL).unwrap();
        reg.remove_resource("r").unwrap();

        assert!(!reg.contains("r"));
        assert!(matches!(
            reg.check("r", "p", Permissions::READ),
            Err(ForemanError::NotFound(_))
        ));
        assert!(matches!(
            reg.remove_resource("r"),
            Err(ForemanError::NotFound(_))
        ));
    }
}
