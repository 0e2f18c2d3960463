use std::sync::Arc;

use pretty_assertions::assert_eq;
use querygate_core::{
    Catalog, Column, ColumnPermission, GuardConfig, LimitsConfig, MaskType, Operation, PolicySet,
    Principal, QueryResult, Role, Table, TablePermission,
};
use querygate_policy::{
    AuthError, AuthErrorKind, AuthorizeRequest, InMemoryPolicyStore, QueryGuard, mask_result,
};
use serde_json::json;

fn store() -> InMemoryPolicyStore {
    let users = TablePermission::new("users")
        .with_column(ColumnPermission::allowed("id"))
        .with_column(ColumnPermission::denied("ssn"))
        .with_column(ColumnPermission::denied("range"))
        .with_column(ColumnPermission::masked("email", MaskType::Partial));
    let orders = TablePermission::new("orders").with_row_filter("{{table}}.user_id = '{{user_id}}'");
    let products =
        TablePermission::new("products").with_operations([Operation::Select, Operation::Update]);

    InMemoryPolicyStore::new(vec![
        PolicySet::new("acme", "warehouse", Role::Analyst)
            .with_table(users)
            .with_table(orders)
            .with_table(products),
        PolicySet::new("acme", "warehouse", Role::Admin).with_table(
            TablePermission::new("users").with_column(ColumnPermission::masked("email", MaskType::Hash)),
        ),
    ])
}

fn catalog() -> Catalog {
    Catalog::new(vec![
        Table::new(
            "users",
            vec![
                Column::new("id", "int").primary_key(),
                Column::new("email", "text"),
                Column::new("ssn", "text"),
                Column::new("name", "text"),
            ],
        ),
        Table::new(
            "orders",
            vec![
                Column::new("id", "int").primary_key(),
                Column::new("user_id", "int"),
                Column::new("total", "numeric"),
                Column::new("status", "text"),
            ],
        ),
        Table::new(
            "products",
            vec![
                Column::new("id", "int").primary_key(),
                Column::new("name", "text"),
                Column::new("price", "numeric"),
            ],
        ),
    ])
}

fn guard() -> QueryGuard {
    QueryGuard::new(GuardConfig::default(), Arc::new(store()))
}

fn analyst() -> Principal {
    Principal::new("u-1", Role::Analyst, "acme").with_email("ann@acme.io")
}

fn admin() -> Principal {
    Principal::new("root", Role::Admin, "acme")
}

fn run(sql: &str) -> Result<String, AuthError> {
    guard()
        .authorize_and_rewrite(sql, &analyst(), "warehouse", Some(&catalog()))
        .map(|q| q.sql)
}

fn kind(sql: &str) -> AuthErrorKind {
    run(sql).unwrap_err().kind()
}

fn ssn_blocked() -> AuthError {
    AuthError::ColumnAccessBlocked {
        columns: vec!["users.ssn".into()],
    }
}

#[test]
fn missing_policy_always_denies() {
    let viewer = Principal::new("v-1", Role::Viewer, "acme");
    for sql in [
        "SELECT 1",
        "SELECT id FROM products",
        "SELECT * FROM users",
        "SHOW TABLES",
        "SELECT id FROM products UNION SELECT id FROM users",
    ] {
        let err = guard()
            .authorize_and_rewrite(sql, &viewer, "warehouse", None)
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::PolicyMissing {
                role: Role::Viewer,
                connection_id: "warehouse".into()
            },
            "{sql}"
        );
    }

    let err = guard()
        .authorize_and_rewrite("SELECT 1", &analyst(), "lake", None)
        .unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::PolicyMissing);
}

#[test]
fn wildcards_blocked_on_tables_with_denied_columns() {
    let star = AuthError::SelectStarBlocked {
        table: "users".into(),
    };
    assert_eq!(run("SELECT * FROM users").unwrap_err(), star);
    assert_eq!(run("SELECT users.* FROM users").unwrap_err(), star);
    assert_eq!(run("SELECT u.* FROM users u").unwrap_err(), star);
    assert!(run("SELECT id, email, name FROM users").is_ok());
    assert!(run("SELECT * FROM products").is_ok());
}

#[test]
fn denied_column_blocked_in_every_clause() {
    for sql in [
        "SELECT ssn FROM users",
        "SELECT id FROM users WHERE ssn = 'x'",
        "SELECT u.id FROM users u JOIN products p ON p.name = u.ssn",
        "SELECT count(*) FROM users GROUP BY ssn",
        "SELECT name FROM users GROUP BY name HAVING count(ssn) > 1",
        "SELECT id FROM users ORDER BY ssn",
    ] {
        assert_eq!(run(sql).unwrap_err(), ssn_blocked(), "{sql}");
    }
}

#[test]
fn documented_scenarios() {
    assert_eq!(run("SELECT ssn FROM users").unwrap_err(), ssn_blocked());
    assert_eq!(
        run("SELECT id FROM users WHERE ssn='x'").unwrap_err(),
        ssn_blocked()
    );
    assert_eq!(run("SELECT id FROM users").unwrap(), "SELECT id FROM users");
    assert_eq!(
        run("SELECT u.id FROM users u JOIN orders o ON u.id = o.user_id WHERE u.ssn = 'x'")
            .unwrap_err(),
        ssn_blocked()
    );
}

#[test]
fn select_alias_in_order_by_is_not_a_column() {
    assert!(run("SELECT id AS x FROM users ORDER BY x").is_ok());
}

#[test]
fn order_by_binds_to_last_union_segment() {
    assert!(run("SELECT name FROM products UNION SELECT email AS name FROM users ORDER BY name").is_ok());
    assert_eq!(
        run("SELECT name AS ssn FROM products UNION SELECT id FROM users ORDER BY ssn").unwrap_err(),
        ssn_blocked()
    );
}

#[test]
fn ambiguous_column_deny_wins() {
    let result = guard().authorize_and_rewrite(
        "SELECT ssn FROM products, users",
        &analyst(),
        "warehouse",
        None,
    );
    assert_eq!(result.unwrap_err(), ssn_blocked());
}

#[test]
fn row_filter_injected() {
    assert_eq!(
        run("SELECT id, total FROM orders WHERE status = 'open' OR total > 100").unwrap(),
        "SELECT id, total FROM orders WHERE (status = 'open' OR total > 100) AND (orders.user_id = 'u-1')"
    );
    assert_eq!(
        run("SELECT o.id FROM orders o ORDER BY o.id").unwrap(),
        "SELECT o.id FROM orders o WHERE (o.user_id = 'u-1') ORDER BY o.id"
    );
}

#[test]
fn row_filter_reaches_every_scope() {
    let query = guard()
        .authorize_and_rewrite(
            "SELECT id FROM orders UNION ALL SELECT id FROM orders",
            &analyst(),
            "warehouse",
            None,
        )
        .unwrap();
    assert_eq!(query.predicates_added.len(), 2);
    assert_eq!(query.tables_scoped, vec!["orders", "orders"]);

    assert_eq!(
        run("SELECT name FROM products WHERE id IN (SELECT id FROM orders)").unwrap(),
        "SELECT name FROM products WHERE id IN (SELECT id FROM orders WHERE (orders.user_id = 'u-1'))"
    );
}

#[test]
fn comments_stripped_before_rewrite() {
    assert_eq!(
        run("SELECT id FROM orders -- all of them").unwrap(),
        "SELECT id FROM orders WHERE (orders.user_id = 'u-1')"
    );
}

#[test]
fn ungranted_tables_blocked() {
    let result = guard().authorize_and_rewrite(
        "SELECT i.id FROM invoices i JOIN products p ON p.id = i.id",
        &analyst(),
        "warehouse",
        None,
    );
    assert_eq!(
        result.unwrap_err(),
        AuthError::TableAccessBlocked {
            tables: vec!["invoices".into()]
        }
    );
}

#[test]
fn unknown_names_rejected_by_schema() {
    assert_eq!(
        run("SELECT phone FROM users").unwrap_err(),
        AuthError::SchemaViolation {
            invalid_tables: vec![],
            invalid_columns: vec!["phone".into()],
        }
    );
    assert_eq!(kind("SELECT p.sku FROM products p"), AuthErrorKind::SchemaViolation);
}

#[test]
fn access_decided_before_schema() {
    assert_eq!(
        run("SELECT id FROM invoices").unwrap_err(),
        AuthError::TableAccessBlocked {
            tables: vec!["invoices".into()]
        }
    );

    let viewer = Principal::new("v-1", Role::Viewer, "acme");
    let err = guard()
        .authorize_and_rewrite("SELECT nope FROM secret_tbl", &viewer, "warehouse", Some(&catalog()))
        .unwrap_err();
    assert_eq!(err.kind(), AuthErrorKind::PolicyMissing);
}

#[test]
fn derived_alias_does_not_hide_a_real_table() {
    assert_eq!(
        run("SELECT u.ssn FROM (SELECT 1 AS a) users, users u").unwrap_err(),
        ssn_blocked()
    );

    let err = guard()
        .authorize_and_rewrite(
            "SELECT s.secret FROM (SELECT 1 AS a) secrets, secrets s",
            &analyst(),
            "warehouse",
            None,
        )
        .unwrap_err();
    assert_eq!(
        err,
        AuthError::TableAccessBlocked {
            tables: vec!["secrets".into()]
        }
    );

    let sql = run("SELECT o.total FROM (SELECT 1 AS a) orders, orders o").unwrap();
    assert!(sql.contains("(o.user_id = 'u-1')"), "{sql}");
}

#[test]
fn keyword_named_column_still_enforced() {
    assert_eq!(
        run("SELECT range FROM users").unwrap_err(),
        AuthError::ColumnAccessBlocked {
            columns: vec!["users.range".into()]
        }
    );
    assert!(
        run("SELECT id, row_number() OVER (ORDER BY id ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW) FROM users")
            .is_ok()
    );
}

#[test]
fn hash_comment_cannot_hide_columns() {
    assert_eq!(kind("SELECT id # '\n, ssn FROM users -- '"), AuthErrorKind::Unparseable);
}

#[test]
fn safety_errors_come_first() {
    assert_eq!(kind("SELECT id FROM users; SELECT ssn FROM users"), AuthErrorKind::MultiStatementRejected);
    assert_eq!(kind("DELETE FROM orders"), AuthErrorKind::ForbiddenOperation);
    assert_eq!(kind("   "), AuthErrorKind::EmptyQuery);
    assert_eq!(
        kind("SELECT id FROM users WHERE name = 'a\\' OR ssn = ''"),
        AuthErrorKind::Unparseable
    );
}

#[test]
fn privileged_mode_checks_operation_grants() {
    let principal = analyst();
    let update = AuthorizeRequest::new("UPDATE products SET price = 1 WHERE id = 2", &principal, "warehouse")
        .allow_all_ops(true);
    let query = guard().authorize(&update).unwrap();
    assert_eq!(query.operation, Operation::Update);

    let update_orders = AuthorizeRequest::new("UPDATE orders SET total = 0", &principal, "warehouse")
        .allow_all_ops(true);
    assert_eq!(
        guard().authorize(&update_orders).unwrap_err(),
        AuthError::TableAccessBlocked {
            tables: vec!["orders".into()]
        }
    );

    let drop = AuthorizeRequest::new("DROP TABLE products", &principal, "warehouse").allow_all_ops(true);
    assert_eq!(guard().authorize(&drop).unwrap_err().kind(), AuthErrorKind::ForbiddenOperation);
}

#[test]
fn limits_appended_and_clamped() {
    let config = GuardConfig {
        limits: LimitsConfig {
            default_limit: Some(100),
            max_limit: 500,
        },
        ..GuardConfig::default()
    };
    let guard = QueryGuard::new(config, Arc::new(store()));
    let principal = analyst();

    let query = guard
        .authorize_and_rewrite("SELECT id FROM products;", &principal, "warehouse", None)
        .unwrap();
    assert_eq!(query.sql, "SELECT id FROM products LIMIT 100;");

    let request = AuthorizeRequest::new("SELECT id FROM products", &principal, "warehouse")
        .with_limit(Some(10_000));
    assert_eq!(guard.authorize(&request).unwrap().sql, "SELECT id FROM products LIMIT 500");

    let query = guard
        .authorize_and_rewrite("SELECT id FROM products LIMIT 5", &principal, "warehouse", None)
        .unwrap();
    assert_eq!(query.sql, "SELECT id FROM products LIMIT 5");
}

#[test]
fn admin_bypasses_blocking_but_not_masking() {
    let guard = guard();
    let query = guard
        .authorize_and_rewrite("SELECT * FROM users", &admin(), "warehouse", Some(&catalog()))
        .unwrap();
    assert_eq!(query.sql, "SELECT * FROM users");
    assert!(query.predicates_added.is_empty());

    let result = QueryResult::new(
        vec!["id".into(), "email".into(), "ssn".into()],
        vec![vec![json!(1), json!("ann@acme.io"), json!("123-45-6789")]],
    );
    let masked = guard.mask_result(result, &query);
    let email = masked.rows[0][1].as_str().unwrap();
    assert_eq!(email.len(), 16);
    assert_ne!(email, "ann@acme.io");
    assert_eq!(masked.rows[0][2], json!("123-45-6789"));
}

#[test]
fn masking_follows_select_aliases() {
    let guard = guard();
    let query = guard
        .authorize_and_rewrite(
            "SELECT u.email AS contact, u.id FROM users u",
            &analyst(),
            "warehouse",
            Some(&catalog()),
        )
        .unwrap();
    let result = QueryResult::new(
        vec!["contact".into(), "id".into()],
        vec![vec![json!("ann@acme.io"), json!(7)], vec![json!(null), json!(8)]],
    );
    let masked = guard.mask_result(result, &query);
    assert_eq!(masked.rows[0], vec![json!("an*******io"), json!(7)]);
    assert_eq!(masked.rows[1], vec![json!(null), json!(8)]);

    let by_name = mask_result(
        QueryResult::new(vec!["email".into()], vec![vec![json!("bob@acme.io")]]),
        &query.policy,
    );
    assert_eq!(by_name.rows[0][0], json!("bo*******io"));
}

#[test]
fn masks_follow_result_positions() {
    let guard = guard();
    let query = guard
        .authorize_and_rewrite(
            "SELECT o.status AS email, u.email FROM orders o JOIN users u ON u.id = o.user_id",
            &analyst(),
            "warehouse",
            Some(&catalog()),
        )
        .unwrap();
    let result = QueryResult::new(
        vec!["email".into(), "email".into()],
        vec![vec![json!("shipped"), json!("ann@acme.io")]],
    );
    let masked = guard.mask_result(result, &query);
    assert_eq!(masked.rows[0], vec![json!("shipped"), json!("an*******io")]);
}

#[test]
fn expressions_keep_source_masks() {
    let guard = guard();
    let query = guard
        .authorize_and_rewrite("SELECT email || '' AS x FROM users", &analyst(), "warehouse", Some(&catalog()))
        .unwrap();
    let result = QueryResult::new(vec!["x".into()], vec![vec![json!("ann@acme.io")]]);
    let masked = guard.mask_result(result, &query);
    assert_eq!(masked.rows[0][0], json!("an*******io"));
}

#[test]
fn policy_snapshot_cached_between_requests() {
    let guard = guard();
    for _ in 0..3 {
        guard
            .authorize_and_rewrite("SELECT id FROM products", &analyst(), "warehouse", None)
            .unwrap();
    }
    assert_eq!(guard.compiler().cache().len(), 1);
}
