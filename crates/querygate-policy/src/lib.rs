//! # querygate-policy
//!
//! Authorization for ad-hoc SQL: decides whether a principal may run a query
//! and rewrites it so that it only sees what the principal is entitled to.
//!
//! ## Pipeline
//!
//! 1. **Safety**: one statement, read verbs only (unless operator-configured)
//! 2. **Schema**: optional, against the connection's catalog
//! 3. **Compile**: index the role's permissions; no record means no access
//! 4. **Table access**: every table must be granted for the operation
//! 5. **Row filters**: user-scoped tables are narrowed to the caller's rows
//! 6. **Column access**: denied columns and unsafe wildcards block the query
//! 7. **Limit**: a row limit is appended when configured
//!
//! After execution, [`QueryGuard::mask_result`] obfuscates masked columns.
//!
//! ```ignore
//! let guard = QueryGuard::new(GuardConfig::default(), Arc::new(store));
//! let query = guard.authorize_and_rewrite(sql, &principal, "warehouse", Some(&catalog))?;
//! let rows = execute(&query.sql)?;
//! let rows = guard.mask_result(rows, &query);
//! ```

pub mod cache;
pub mod compiler;
pub mod enforcer;
pub mod error;
pub mod masking;
pub mod pipeline;
pub mod safety;
pub mod schema;
pub mod store;

pub use cache::PolicyCache;
pub use compiler::{ColumnPolicy, CompiledPolicy, PolicyCompiler};
pub use enforcer::{ColumnAccessEnforcer, check_columns, check_table_access};
pub use error::{AuthError, AuthErrorKind};
pub use masking::{ColumnOrigin, ResultMasker, ResultOrigins, SourceColumn, mask_result, mask_value};
pub use pipeline::{AuthorizeRequest, AuthorizedQuery, QueryGuard};
pub use safety::{statement_operation, validate_safety};
pub use schema::{SchemaReport, validate_schema};
pub use store::{InMemoryPolicyStore, PolicyStore, PolicyStoreError};
