//! Policy store collaborator interface.

use std::path::Path;

use querygate_core::{ConfigError, PolicyFile, PolicySet, Role};

/// Errors from a policy store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyStoreError {
    #[error("policy store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid policy record: {0}")]
    InvalidRecord(String),
}

/// Source of policy records, keyed by organization, connection and role.
///
/// Implementations return every record set stored for the key; the
/// compiler picks the effective one.
pub trait PolicyStore: Send + Sync {
    fn find(
        &self,
        organization_id: &str,
        connection_id: &str,
        role: Role,
    ) -> Result<Vec<PolicySet>, PolicyStoreError>;
}

/// Policy store backed by records held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPolicyStore {
    sets: Vec<PolicySet>,
}

impl InMemoryPolicyStore {
    pub fn new(sets: Vec<PolicySet>) -> Self {
        Self { sets }
    }

    /// Load records from a YAML or JSON policy file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::from(PolicyFile::from_file(path)?))
    }

    pub fn insert(&mut self, set: PolicySet) {
        self.sets.push(set);
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl From<PolicyFile> for InMemoryPolicyStore {
    fn from(file: PolicyFile) -> Self {
        Self::new(file.policies)
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn find(
        &self,
        organization_id: &str,
        connection_id: &str,
        role: Role,
    ) -> Result<Vec<PolicySet>, PolicyStoreError> {
        Ok(self
            .sets
            .iter()
            .filter(|set| set.matches(organization_id, connection_id, role))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_matches_key() {
        let mut store = InMemoryPolicyStore::default();
        store.insert(PolicySet::new("acme", "wh", Role::Analyst));
        store.insert(PolicySet::new("acme", "wh", Role::Viewer));
        store.insert(PolicySet::new("other", "wh", Role::Analyst));

        let found = store.find("acme", "wh", Role::Analyst).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].role, Role::Analyst);
        assert!(store.find("acme", "lake", Role::Analyst).unwrap().is_empty());
    }

    #[test]
    fn test_from_policy_file() {
        let file = PolicyFile::from_yaml(
            r#"
policies:
  - organization_id: acme
    connection_id: wh
    role: viewer
"#,
        )
        .unwrap();
        let store = InMemoryPolicyStore::from(file);
        assert_eq!(store.len(), 1);
    }
}
