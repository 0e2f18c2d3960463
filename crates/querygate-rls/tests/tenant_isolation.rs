//! Row filters keep every read path inside the caller's rows.

use pretty_assertions::assert_eq;
use querygate_core::{Principal, Role, TablePermission, UserRelationFields};
use querygate_rls::{InjectionResult, ReferenceExtractor, RlsInjector, TextExtractor};

fn principal() -> Principal {
    Principal::new("u-42", Role::Analyst, "acme").with_email("ann@example.com")
}

fn owned(table: &str, column: &str) -> TablePermission {
    TablePermission::new(table).with_user_relation(UserRelationFields {
        user_id_col: Some(column.to_string()),
        user_email_col: None,
        user_name_col: None,
    })
}

fn scoped(sql: &str, who: &Principal) -> InjectionResult {
    let orders = owned("orders", "owner_id");
    let invoices = owned("invoices", "customer_id");
    let catalog = TablePermission::new("products");
    let extraction = TextExtractor::new().extract(sql).unwrap();
    RlsInjector::new().inject_extracted(sql, &extraction, who, |table| match table {
        "orders" => Some(&orders),
        "invoices" => Some(&invoices),
        "products" => Some(&catalog),
        _ => None,
    })
}

#[test]
fn every_joined_table_is_narrowed() {
    let result = scoped(
        "SELECT o.id, i.total FROM orders o JOIN invoices i ON i.order_id = o.id",
        &principal(),
    );
    assert_eq!(
        result.rewritten_sql,
        "SELECT o.id, i.total FROM orders o JOIN invoices i ON i.order_id = o.id \
         WHERE (o.owner_id = 'u-42') AND (i.customer_id = 'u-42')"
    );
    assert_eq!(result.tables_scoped, vec!["orders", "invoices"]);
}

#[test]
fn shared_tables_are_left_alone() {
    let result = scoped(
        "SELECT p.name FROM products p JOIN orders o ON o.product_id = p.id",
        &principal(),
    );
    assert_eq!(
        result.rewritten_sql,
        "SELECT p.name FROM products p JOIN orders o ON o.product_id = p.id \
         WHERE (o.owner_id = 'u-42')"
    );
    assert_eq!(result.tables_scoped, vec!["orders"]);
}

#[test]
fn derived_tables_are_narrowed_inside() {
    let result = scoped("SELECT d.id FROM (SELECT id FROM orders) d", &principal());
    assert_eq!(
        result.rewritten_sql,
        "SELECT d.id FROM (SELECT id FROM orders WHERE (orders.owner_id = 'u-42')) d"
    );
}

#[test]
fn or_in_caller_condition_cannot_widen() {
    let result = scoped("SELECT id FROM orders WHERE 1 = 1 OR owner_id <> ''", &principal());
    assert_eq!(
        result.rewritten_sql,
        "SELECT id FROM orders WHERE (1 = 1 OR owner_id <> '') AND (orders.owner_id = 'u-42')"
    );
}

#[test]
fn trailing_semicolon_stays_last() {
    let result = scoped("SELECT id FROM orders;", &principal());
    assert_eq!(
        result.rewritten_sql,
        "SELECT id FROM orders WHERE (orders.owner_id = 'u-42');"
    );
}

#[test]
fn principal_values_cannot_break_out_of_literal() {
    let who = Principal::new("x' OR '1'='1", Role::Analyst, "acme");
    let result = scoped("SELECT id FROM orders", &who);
    assert_eq!(
        result.predicates_added,
        vec!["orders.owner_id = 'x'' OR ''1''=''1'"]
    );
}

#[test]
fn schema_qualified_names_are_matched() {
    let result = scoped("SELECT id FROM public.orders", &principal());
    assert_eq!(result.tables_scoped, vec!["orders"]);
    assert!(result.rewritten_sql.ends_with("owner_id = 'u-42')"));
}

#[test]
fn original_sql_is_reported() {
    let sql = "SELECT id FROM orders";
    let result = scoped(sql, &principal());
    assert_eq!(result.original_sql, sql);
    assert!(result.tables_skipped.is_empty());
}
