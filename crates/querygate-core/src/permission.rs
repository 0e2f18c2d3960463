//! Table and column permission records.
//!
//! These are authored by administrators through external tooling and stored
//! per `(organization, connection, role)`. The authorization pipeline only
//! ever reads them.
//!
//! # Example (YAML)
//!
//! ```yaml
//! organization_id: acme
//! connection_id: warehouse
//! role: analyst
//! updated_at: 2024-05-01T12:00:00Z
//! tables:
//!   - table_name: users
//!     allowed_operations: [select]
//!     data_scope: user_related
//!     user_relation_fields:
//!       user_id_col: id
//!     column_permissions:
//!       - column_name: ssn
//!         accessible: false
//!       - column_name: email
//!         masked: true
//!         mask_type: partial
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::principal::Role;

/// Statement operations a table permission can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Select => write!(f, "SELECT"),
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Which rows of a table a role may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// No row narrowing.
    #[default]
    All,
    /// Only rows related to the requesting principal.
    UserRelated,
}

/// How a masked column is obfuscated in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    /// One-way digest, stable per distinct value.
    Hash,
    /// Reveal a short prefix/suffix, redact the middle.
    Partial,
    /// Replace with a fixed redaction marker.
    #[default]
    Full,
}

/// Access rule for a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPermission {
    pub column_name: String,
    #[serde(default = "default_true")]
    pub accessible: bool,
    #[serde(default)]
    pub masked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_type: Option<MaskType>,
}

impl ColumnPermission {
    /// An accessible, unmasked column.
    pub fn allowed(column: impl Into<String>) -> Self {
        Self {
            column_name: column.into(),
            accessible: true,
            masked: false,
            mask_type: None,
        }
    }

    /// A column that may never be referenced.
    pub fn denied(column: impl Into<String>) -> Self {
        Self {
            accessible: false,
            ..Self::allowed(column)
        }
    }

    /// An accessible column whose values are masked in results.
    pub fn masked(column: impl Into<String>, mask_type: MaskType) -> Self {
        Self {
            masked: true,
            mask_type: Some(mask_type),
            ..Self::allowed(column)
        }
    }

    /// The mask applied to this column, if any. `masked` without an explicit
    /// type falls back to a full redaction.
    pub fn effective_mask(&self) -> Option<MaskType> {
        if self.masked {
            Some(self.mask_type.unwrap_or_default())
        } else {
            None
        }
    }
}

/// Columns that link a row to the requesting principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRelationFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name_col: Option<String>,
}

impl UserRelationFields {
    pub fn is_empty(&self) -> bool {
        self.user_id_col.is_none() && self.user_email_col.is_none() && self.user_name_col.is_none()
    }
}

/// Access rule for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePermission {
    pub table_name: String,
    #[serde(default = "default_operations")]
    pub allowed_operations: BTreeSet<Operation>,
    #[serde(default)]
    pub column_permissions: Vec<ColumnPermission>,
    #[serde(default)]
    pub data_scope: DataScope,
    /// Administrator-authored predicate with `{{user_id}}`, `{{user_email}}`,
    /// `{{user_name}}`, `{{user_role}}` and `{{table}}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_level_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_relation_fields: Option<UserRelationFields>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl TablePermission {
    /// A read-only, enabled permission with no column rules.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table_name: table.into(),
            allowed_operations: default_operations(),
            column_permissions: Vec::new(),
            data_scope: DataScope::All,
            row_level_filter: None,
            user_relation_fields: None,
            enabled: true,
        }
    }

    pub fn with_column(mut self, column: ColumnPermission) -> Self {
        self.column_permissions.push(column);
        self
    }

    pub fn with_operations(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.allowed_operations = ops.into_iter().collect();
        self
    }

    /// Scope rows with an administrator-authored filter template.
    pub fn with_row_filter(mut self, template: impl Into<String>) -> Self {
        self.data_scope = DataScope::UserRelated;
        self.row_level_filter = Some(template.into());
        self
    }

    /// Scope rows by matching principal attributes against columns.
    pub fn with_user_relation(mut self, fields: UserRelationFields) -> Self {
        self.data_scope = DataScope::UserRelated;
        self.user_relation_fields = Some(fields);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn allows(&self, operation: Operation) -> bool {
        self.allowed_operations.contains(&operation)
    }
}

/// All table permissions for one `(organization, connection, role)` triple.
///
/// Several versions may exist; the one with the latest `updated_at` is the
/// effective record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    pub organization_id: String,
    pub connection_id: String,
    pub role: Role,
    #[serde(default = "default_updated_at")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tables: Vec<TablePermission>,
}

impl PolicySet {
    pub fn new(
        organization_id: impl Into<String>,
        connection_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            connection_id: connection_id.into(),
            role,
            updated_at: default_updated_at(),
            tables: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: TablePermission) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// Whether this set belongs to the given key.
    pub fn matches(&self, organization_id: &str, connection_id: &str, role: Role) -> bool {
        self.organization_id == organization_id
            && self.connection_id == connection_id
            && self.role == role
    }
}

fn default_true() -> bool {
    true
}

fn default_operations() -> BTreeSet<Operation> {
    BTreeSet::from([Operation::Select])
}

fn default_updated_at() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}
