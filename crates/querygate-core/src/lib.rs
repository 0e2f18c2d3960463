//! # querygate-core
//!
//! Shared types for the querygate SQL authorization pipeline:
//!
//! - [`catalog`]: table/column metadata supplied by the schema provider
//! - [`principal`]: the authenticated caller
//! - [`permission`]: administrator-authored table and column rules
//! - [`result`]: query results handed back for masking
//! - [`config`]: guard configuration and policy/catalog file loading
//!
//! Nothing in this crate performs I/O except the explicit `from_file`
//! loaders in [`config`].

pub mod catalog;
pub mod config;
pub mod permission;
pub mod principal;
pub mod result;

pub use catalog::{Catalog, Column, Table};
pub use config::{
    ConfigError, GuardConfig, LimitsConfig, MaskingConfig, PolicyCacheConfig, PolicyFile,
    SchemaValidationMode,
};
pub use permission::{
    ColumnPermission, DataScope, MaskType, Operation, PolicySet, TablePermission,
    UserRelationFields,
};
pub use principal::{Principal, Role};
pub use result::QueryResult;

/// Strip a schema prefix from a possibly qualified table name and lowercase it.
///
/// `public.Users` and `"public"."users"` both normalise to `users`.
pub fn normalize_table_name(name: &str) -> String {
    let base = name.rsplit('.').next().unwrap_or(name);
    unquote_identifier(base).to_lowercase()
}

/// Remove one level of identifier quoting (`"x"`, `` `x` ``, `[x]`).
pub fn unquote_identifier(ident: &str) -> &str {
    let trimmed = ident.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"')
            || (first == b'`' && last == b'`')
            || (first == b'[' && last == b']')
        {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_table_name() {
        assert_eq!(normalize_table_name("users"), "users");
        assert_eq!(normalize_table_name("public.Users"), "users");
        assert_eq!(normalize_table_name("\"public\".\"Orders\""), "orders");
        assert_eq!(normalize_table_name("`shop`.`items`"), "items");
    }

    #[test]
    fn test_unquote_identifier() {
        assert_eq!(unquote_identifier("\"ssn\""), "ssn");
        assert_eq!(unquote_identifier("[ssn]"), "ssn");
        assert_eq!(unquote_identifier("ssn"), "ssn");
        assert_eq!(unquote_identifier("\""), "\"");
    }
}
