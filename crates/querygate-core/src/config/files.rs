//! Policy and catalog file loading.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::ConfigError;
use crate::catalog::Catalog;
use crate::permission::PolicySet;

/// A file of policy records, as exported by the admin tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicySet>,
}

impl PolicyFile {
    /// Load policy records from a YAML (or `.json`) file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        if is_json(path) {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Parse policy records from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }
}

/// Load a catalog snapshot from a YAML (or `.json`) file.
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Catalog, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let catalog = if is_json(path) {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(catalog)
}

pub(crate) fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Role;
    use std::io::Write;

    #[test]
    fn test_policy_file_from_yaml() {
        let file = PolicyFile::from_yaml(
            r#"
policies:
  - organization_id: acme
    connection_id: warehouse
    role: analyst
    updated_at: 2024-05-01T12:00:00Z
    tables:
      - table_name: users
        column_permissions:
          - column_name: ssn
            accessible: false
"#,
        )
        .unwrap();

        assert_eq!(file.policies.len(), 1);
        let set = &file.policies[0];
        assert!(set.matches("acme", "warehouse", Role::Analyst));
        assert_eq!(set.tables[0].table_name, "users");
    }

    #[test]
    fn test_load_catalog_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "tables:\n  - name: users\n    columns:\n      - name: id\n        type: integer"
        )
        .unwrap();

        let catalog = load_catalog(file.path()).unwrap();
        assert!(catalog.has_column("users", "id"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_catalog("/nonexistent/catalog.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
