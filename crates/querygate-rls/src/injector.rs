//! Row-level filter injection.
//!
//! Tables whose permission has `data_scope = user_related` are narrowed to
//! the caller's own rows. The predicate comes from the table's
//! `row_level_filter` template when it yields one, otherwise from the
//! `user_relation_fields` column mapping.

use std::sync::LazyLock;

use querygate_core::{DataScope, Principal, TablePermission, UserRelationFields, normalize_table_name};
use regex::Regex;

use crate::error::RlsError;
use crate::extractor::{Extraction, FilterAnchor, ReferenceExtractor, TextExtractor};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}").expect("placeholder pattern"));

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Injects row filters into SQL statements.
#[derive(Debug, Clone, Default)]
pub struct RlsInjector<E = TextExtractor> {
    extractor: E,
}

impl RlsInjector<TextExtractor> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<E: ReferenceExtractor> RlsInjector<E> {
    /// Use a different reference extractor.
    pub fn with_extractor(extractor: E) -> Self {
        Self { extractor }
    }

    /// Narrow every occurrence of `table` in `sql` for `principal`.
    pub fn inject(
        &self,
        sql: &str,
        table: &str,
        permission: &TablePermission,
        principal: &Principal,
    ) -> Result<InjectionResult, RlsError> {
        let extraction = self.extractor.extract(sql)?;
        let key = normalize_table_name(table);
        Ok(self.inject_extracted(sql, &extraction, principal, |name| {
            (name == key).then_some(permission)
        }))
    }

    /// Narrow every user-related table of an already extracted statement.
    ///
    /// `lookup` maps a normalised table name to its permission. `sql` must
    /// be the exact text `extraction` was produced from.
    pub fn inject_extracted<'p>(
        &self,
        sql: &str,
        extraction: &Extraction,
        principal: &Principal,
        lookup: impl Fn(&str) -> Option<&'p TablePermission>,
    ) -> InjectionResult {
        let mut edits: Vec<(usize, String)> = Vec::new();
        let mut tables_scoped = Vec::new();
        let mut tables_skipped = Vec::new();
        let mut predicates_added = Vec::new();

        for scope in extraction.scopes().iter().filter(|s| !s.inherits_tables) {
            let mut predicates = Vec::new();
            for table in &scope.tables {
                let key = table.key();
                let Some(permission) = lookup(&key) else {
                    continue;
                };
                if permission.data_scope != DataScope::UserRelated {
                    continue;
                }
                match build_filter(permission, principal, table.exposed()) {
                    Some(predicate) => {
                        tracing::debug!(table = %key, predicate = %predicate, "Adding row filter");
                        predicates.push(predicate);
                        tables_scoped.push(key);
                    }
                    None => {
                        tracing::warn!(table = %key, "No usable row filter; table is not narrowed");
                        tables_skipped.push(key);
                    }
                }
            }
            if predicates.is_empty() {
                continue;
            }

            let conjunction = predicates
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" AND ");
            match scope.filter_anchor {
                Some(FilterAnchor::Where { start, end }) => {
                    edits.push((start, "(".to_string()));
                    edits.push((end, format!(") AND {conjunction}")));
                }
                Some(FilterAnchor::Append { at }) => {
                    edits.push((at, format!(" WHERE {conjunction}")));
                }
                None => {
                    tracing::warn!(
                        tables = ?scope.tables.iter().map(|t| t.key()).collect::<Vec<_>>(),
                        "Statement has no place for a row filter"
                    );
                    tables_skipped.extend(scope.tables.iter().map(|t| t.key()));
                    continue;
                }
            }
            predicates_added.extend(predicates);
        }

        edits.sort_by(|a, b| b.0.cmp(&a.0));
        let mut rewritten_sql = sql.to_string();
        for (at, text) in edits {
            rewritten_sql.insert_str(at, &text);
        }

        InjectionResult {
            original_sql: sql.to_string(),
            rewritten_sql,
            tables_scoped,
            tables_skipped,
            predicates_added,
        }
    }
}

/// Result of row filter injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionResult {
    /// Original SQL.
    pub original_sql: String,
    /// Rewritten SQL with row filters.
    pub rewritten_sql: String,
    /// Tables that were narrowed.
    pub tables_scoped: Vec<String>,
    /// User-related tables for which no filter could be built.
    pub tables_skipped: Vec<String>,
    /// Predicates that were added.
    pub predicates_added: Vec<String>,
}

/// Build the row filter for one table occurrence, or `None` when neither the
/// template nor the relation fields yield one.
pub fn build_filter(
    permission: &TablePermission,
    principal: &Principal,
    exposed_name: &str,
) -> Option<String> {
    if permission.data_scope != DataScope::UserRelated {
        return None;
    }
    if let Some(filter) = permission
        .row_level_filter
        .as_deref()
        .and_then(|template| render_template(template, principal, exposed_name))
    {
        return Some(filter);
    }
    permission
        .user_relation_fields
        .as_ref()
        .and_then(|fields| relation_predicate(fields, principal, exposed_name))
}

/// Substitute `{{user_id}}`, `{{user_email}}`, `{{user_name}}`,
/// `{{user_role}}` and `{{table}}` in a filter template.
///
/// The template itself is inserted as written. Substituted values have their
/// single quotes doubled. Unknown placeholders make the template unusable.
pub fn render_template(template: &str, principal: &Principal, exposed_name: &str) -> Option<String> {
    let mut unknown = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match name {
            "user_id" => escape_literal(&principal.id),
            "user_email" => escape_literal(&principal.email),
            "user_name" => escape_literal(&principal.display_name),
            "user_role" => principal.role.as_str().to_string(),
            "table" => exposed_name.to_string(),
            other => {
                unknown = Some(other.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = unknown {
        tracing::warn!(placeholder = %name, "Unknown placeholder in row filter template");
        return None;
    }
    let rendered = rendered.trim();
    (!rendered.is_empty()).then(|| rendered.to_string())
}

fn relation_predicate(
    fields: &UserRelationFields,
    principal: &Principal,
    exposed_name: &str,
) -> Option<String> {
    let pairs = [
        (fields.user_id_col.as_deref(), principal.id.as_str()),
        (fields.user_email_col.as_deref(), principal.email.as_str()),
        (fields.user_name_col.as_deref(), principal.display_name.as_str()),
    ];

    let mut terms = Vec::new();
    for (column, value) in pairs {
        let Some(column) = column else {
            continue;
        };
        if !IDENTIFIER.is_match(column) {
            tracing::warn!(column = %column, "Ignoring user relation column that is not a plain identifier");
            continue;
        }
        if value.is_empty() {
            continue;
        }
        terms.push(format!("{}.{} = '{}'", exposed_name, column, escape_literal(value)));
    }
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use querygate_core::Role;

    fn principal() -> Principal {
        Principal::new("u-42", Role::Viewer, "acme")
            .with_email("ann@example.com")
            .with_display_name("Ann")
    }

    fn owned_orders() -> TablePermission {
        TablePermission::new("orders").with_user_relation(UserRelationFields {
            user_id_col: Some("owner_id".to_string()),
            user_email_col: None,
            user_name_col: None,
        })
    }

    #[test]
    fn test_inject_without_where() {
        let result = RlsInjector::new()
            .inject("SELECT * FROM orders", "orders", &owned_orders(), &principal())
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "SELECT * FROM orders WHERE (orders.owner_id = 'u-42')"
        );
        assert_eq!(result.tables_scoped, vec!["orders"]);
        assert_eq!(result.predicates_added, vec!["orders.owner_id = 'u-42'"]);
    }

    #[test]
    fn test_inject_wraps_existing_where() {
        let result = RlsInjector::new()
            .inject(
                "SELECT id FROM orders o WHERE o.status = 'open' OR o.id = 1 ORDER BY id",
                "orders",
                &owned_orders(),
                &principal(),
            )
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "SELECT id FROM orders o WHERE (o.status = 'open' OR o.id = 1) AND (o.owner_id = 'u-42') ORDER BY id"
        );
    }

    #[test]
    fn test_inject_before_group_by() {
        let result = RlsInjector::new()
            .inject(
                "SELECT status, count(*) FROM orders GROUP BY status LIMIT 5",
                "orders",
                &owned_orders(),
                &principal(),
            )
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "SELECT status, count(*) FROM orders WHERE (orders.owner_id = 'u-42') GROUP BY status LIMIT 5"
        );
    }

    #[test]
    fn test_inject_every_union_operand_and_subquery() {
        let sql = "SELECT id FROM orders UNION SELECT id FROM archive \
                   WHERE id IN (SELECT id FROM orders)";
        let extraction = TextExtractor::new().extract(sql).unwrap();
        let permission = owned_orders();
        let result = RlsInjector::new().inject_extracted(sql, &extraction, &principal(), |t| {
            (t == "orders").then_some(&permission)
        });
        assert_eq!(
            result.rewritten_sql,
            "SELECT id FROM orders WHERE (orders.owner_id = 'u-42') UNION SELECT id FROM archive \
             WHERE id IN (SELECT id FROM orders WHERE (orders.owner_id = 'u-42'))"
        );
        assert_eq!(result.tables_scoped.len(), 2);
    }

    #[test]
    fn test_template_takes_priority() {
        let permission = owned_orders().with_row_filter("{{table}}.tenant = '{{user_email}}'");
        let result = RlsInjector::new()
            .inject("SELECT * FROM orders AS o", "orders", &permission, &principal())
            .unwrap();
        assert_eq!(
            result.rewritten_sql,
            "SELECT * FROM orders AS o WHERE (o.tenant = 'ann@example.com')"
        );
    }

    #[test]
    fn test_template_values_are_quote_escaped() {
        let who = Principal::new("x' OR '1'='1", Role::Viewer, "acme");
        let rendered = render_template("owner = '{{user_id}}'", &who, "t").unwrap();
        assert_eq!(rendered, "owner = 'x'' OR ''1''=''1'");
    }

    #[test]
    fn test_unknown_placeholder_falls_back_to_relation_fields() {
        let permission = owned_orders().with_row_filter("owner = '{{tenant}}'");
        let filter = build_filter(&permission, &principal(), "orders");
        assert_eq!(filter.as_deref(), Some("orders.owner_id = 'u-42'"));
    }

    #[test]
    fn test_relation_fields_or_together() {
        let permission = TablePermission::new("tickets").with_user_relation(UserRelationFields {
            user_id_col: Some("assignee".to_string()),
            user_email_col: Some("reporter_email".to_string()),
            user_name_col: Some("bad column;".to_string()),
        });
        let filter = build_filter(&permission, &principal(), "t").unwrap();
        assert_eq!(
            filter,
            "t.assignee = 'u-42' OR t.reporter_email = 'ann@example.com'"
        );
    }

    #[test]
    fn test_no_usable_filter_leaves_sql_unchanged() {
        let permission = TablePermission::new("orders").with_row_filter("   ");
        let result = RlsInjector::new()
            .inject("SELECT * FROM orders", "orders", &permission, &principal())
            .unwrap();
        assert_eq!(result.rewritten_sql, "SELECT * FROM orders");
        assert_eq!(result.tables_skipped, vec!["orders"]);
    }

    #[test]
    fn test_all_scope_is_untouched() {
        let permission = TablePermission::new("orders");
        let result = RlsInjector::new()
            .inject("SELECT * FROM orders", "orders", &permission, &principal())
            .unwrap();
        assert_eq!(result.rewritten_sql, "SELECT * FROM orders");
        assert!(result.tables_scoped.is_empty());
        assert!(result.tables_skipped.is_empty());
    }
}
