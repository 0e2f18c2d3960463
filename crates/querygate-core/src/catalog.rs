//! Schema catalog types.
//!
//! The catalog is supplied by an external schema provider and is read-only for
//! the duration of an authorization decision.

use serde::{Deserialize, Serialize};

use crate::normalize_table_name;

/// A single column in a catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_foreign_key: bool,
}

impl Column {
    /// Create a nullable, non-key column of the given type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            is_foreign_key: false,
        }
    }

    /// Mark this column as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }
}

/// A table and its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Case-insensitive column membership.
    pub fn has_column(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column))
    }
}

/// Ordered list of tables known for a database connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    tables: Vec<Table>,
}

impl Catalog {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    /// All tables in catalog order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Look up a table by name, ignoring case and any schema prefix.
    pub fn table(&self, name: &str) -> Option<&Table> {
        let wanted = normalize_table_name(name);
        self.tables
            .iter()
            .find(|t| normalize_table_name(&t.name) == wanted)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Whether `table` exists and has `column`.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.has_column(column))
            .unwrap_or(false)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::new(vec![
            Table::new(
                "Users",
                vec![
                    Column::new("id", "integer").primary_key(),
                    Column::new("email", "text"),
                ],
            ),
            Table::new("orders", vec![Column::new("user_id", "integer")]),
        ])
    }

    #[test]
    fn test_table_lookup_is_case_insensitive() {
        let catalog = catalog();
        assert!(catalog.has_table("users"));
        assert!(catalog.has_table("public.USERS"));
        assert!(!catalog.has_table("payments"));
    }

    #[test]
    fn test_column_lookup() {
        let catalog = catalog();
        assert!(catalog.has_column("users", "EMAIL"));
        assert!(!catalog.has_column("users", "user_id"));
        assert!(!catalog.has_column("missing", "id"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let catalog: Catalog = serde_json::from_str(
            r#"{"tables":[{"name":"t","columns":[{"name":"a","type":"text"}]}]}"#,
        )
        .unwrap();
        let column = &catalog.tables()[0].columns[0];
        assert!(column.nullable);
        assert!(!column.is_primary_key);
    }
}
