//! CLI command implementations for querygate.

pub mod check;
pub mod extract;
pub mod mask;
pub mod safety;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;

use querygate_core::{Catalog, GuardConfig, Principal, Role, config::load_catalog};
use querygate_policy::{AuthError, InMemoryPolicyStore, QueryGuard};

/// JSON printed to stdout, and whether the query was allowed.
#[derive(Debug)]
pub struct Outcome {
    pub output: Value,
    pub allowed: bool,
}

impl Outcome {
    pub fn allowed(output: Value) -> Self {
        Self {
            output,
            allowed: true,
        }
    }

    pub fn denied(err: &AuthError) -> Self {
        Self {
            output: json!({
                "allowed": false,
                "kind": err.kind(),
                "message": err.to_string(),
            }),
            allowed: false,
        }
    }
}

/// The principal a query runs as.
#[derive(Args, Debug, Clone)]
pub struct PrincipalArgs {
    #[arg(long = "user-id", env = "QUERYGATE_USER_ID")]
    pub user_id: String,

    #[arg(long, default_value = "")]
    pub email: String,

    /// Display name
    #[arg(long, default_value = "")]
    pub name: String,

    /// admin, analyst or viewer
    #[arg(long)]
    pub role: Role,

    /// Organization id
    #[arg(long, env = "QUERYGATE_ORG")]
    pub org: String,

    /// Database connection id the policies are keyed by
    #[arg(long, env = "QUERYGATE_CONNECTION")]
    pub connection: String,
}

impl PrincipalArgs {
    pub fn principal(&self) -> Principal {
        Principal::new(&self.user_id, self.role, &self.org)
            .with_email(&self.email)
            .with_display_name(&self.name)
    }
}

/// Policy, catalog and guard configuration files.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Policy records (YAML or JSON)
    #[arg(long, env = "QUERYGATE_POLICIES")]
    pub policies: PathBuf,

    /// Schema catalog (YAML or JSON)
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Guard configuration (YAML or JSON)
    #[arg(long, env = "QUERYGATE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl SourceArgs {
    pub fn guard(&self) -> Result<QueryGuard> {
        let config = match &self.config {
            Some(path) => GuardConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => GuardConfig::default(),
        };
        let store = InMemoryPolicyStore::from_file(&self.policies)
            .with_context(|| format!("Failed to load policies {}", self.policies.display()))?;
        tracing::debug!(records = store.len(), "Loaded policy records");
        Ok(QueryGuard::new(config, Arc::new(store)))
    }

    pub fn catalog(&self) -> Result<Option<Catalog>> {
        self.catalog
            .as_ref()
            .map(|path| {
                load_catalog(path)
                    .with_context(|| format!("Failed to load catalog {}", path.display()))
            })
            .transpose()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub const POLICIES: &str = r#"
policies:
  - organization_id: acme
    connection_id: warehouse
    role: analyst
    tables:
      - table_name: users
        column_permissions:
          - column_name: ssn
            accessible: false
          - column_name: email
            masked: true
            mask_type: partial
      - table_name: orders
        data_scope: user_related
        user_relation_fields:
          user_id_col: user_id
"#;

    pub fn file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    pub fn principal(role: Role) -> PrincipalArgs {
        PrincipalArgs {
            user_id: "u-1".into(),
            email: "ann@acme.io".into(),
            name: "Ann".into(),
            role,
            org: "acme".into(),
            connection: "warehouse".into(),
        }
    }

    pub fn sources(policies: &NamedTempFile) -> SourceArgs {
        SourceArgs {
            policies: policies.path().to_path_buf(),
            catalog: None,
            config: None,
        }
    }
}
