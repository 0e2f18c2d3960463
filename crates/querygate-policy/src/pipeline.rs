//! The authorization pipeline.
//!
//! `safety -> schema -> compile -> table access -> row filters -> column
//! access -> limit`. Every stage works on one policy snapshot and one
//! catalog snapshot; any failure ends the request before SQL is returned.

use std::sync::Arc;

use querygate_core::{
    Catalog, GuardConfig, Operation, Principal, QueryResult, SchemaValidationMode,
};
use querygate_rls::{
    Clause, Extraction, Reference, ReferenceExtractor, Resolution, RlsInjector, Scope,
    TextExtractor, append_limit,
};
use serde::Serialize;
use uuid::Uuid;

use crate::cache::PolicyCache;
use crate::compiler::{CompiledPolicy, PolicyCompiler};
use crate::enforcer::{check_columns, check_table_access};
use crate::error::AuthError;
use crate::masking::{ColumnOrigin, ResultMasker, ResultOrigins, SourceColumn};
use crate::safety::{statement_operation, validate_safety};
use crate::schema::check_extraction;
use crate::store::PolicyStore;

/// One query to authorize.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest<'a> {
    pub sql: &'a str,
    pub principal: &'a Principal,
    pub connection_id: &'a str,
    pub catalog: Option<&'a Catalog>,
    /// Operator-configured SQL only; never set for generated SQL.
    pub allow_all_ops: bool,
    pub limit: Option<u32>,
}

impl<'a> AuthorizeRequest<'a> {
    pub fn new(sql: &'a str, principal: &'a Principal, connection_id: &'a str) -> Self {
        Self {
            sql,
            principal,
            connection_id,
            catalog: None,
            allow_all_ops: false,
            limit: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Option<&'a Catalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn allow_all_ops(mut self, allow: bool) -> Self {
        self.allow_all_ops = allow;
        self
    }

    pub fn with_limit(mut self, limit: Option<u32>) -> Self {
        self.limit = limit;
        self
    }
}

/// A query cleared for execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizedQuery {
    pub request_id: String,
    /// SQL to execute: comment-stripped, row-filtered and limited.
    pub sql: String,
    pub operation: Operation,
    /// Every table the query reads.
    pub tables: Vec<String>,
    pub tables_scoped: Vec<String>,
    /// User-scoped tables left unfiltered because no filter could be built.
    pub tables_skipped: Vec<String>,
    pub predicates_added: Vec<String>,
    pub origins: ResultOrigins,
    #[serde(skip)]
    pub policy: CompiledPolicy,
}

/// Authorizes and rewrites queries for principals.
pub struct QueryGuard {
    config: GuardConfig,
    compiler: PolicyCompiler,
    extractor: Arc<dyn ReferenceExtractor>,
    injector: RlsInjector,
    masker: ResultMasker,
}

impl QueryGuard {
    pub fn new(config: GuardConfig, store: Arc<dyn PolicyStore>) -> Self {
        let cache = Arc::new(PolicyCache::from_config(&config.policy_cache));
        Self {
            compiler: PolicyCompiler::new(store).with_cache(cache),
            extractor: Arc::new(TextExtractor::new()),
            injector: RlsInjector::new(),
            masker: ResultMasker::new(config.masking.clone()),
            config,
        }
    }

    /// Share a policy cache between guards.
    pub fn with_cache(mut self, cache: Arc<PolicyCache>) -> Self {
        self.compiler = self.compiler.with_cache(cache);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ReferenceExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn compiler(&self) -> &PolicyCompiler {
        &self.compiler
    }

    /// Authorize generated SQL in the default read-only mode.
    pub fn authorize_and_rewrite(
        &self,
        sql: &str,
        principal: &Principal,
        connection_id: &str,
        catalog: Option<&Catalog>,
    ) -> Result<AuthorizedQuery, AuthError> {
        self.authorize(&AuthorizeRequest::new(sql, principal, connection_id).with_catalog(catalog))
    }

    pub fn authorize(&self, request: &AuthorizeRequest<'_>) -> Result<AuthorizedQuery, AuthError> {
        let request_id = Uuid::new_v4().to_string();
        let principal = request.principal;
        let span = tracing::info_span!(
            "authorize",
            request_id = %request_id,
            principal = %principal.id,
            role = %principal.role,
            connection_id = %request.connection_id,
        );
        let _enter = span.enter();

        let result = self.run(request, request_id);
        match &result {
            Ok(query) => tracing::info!(
                tables = ?query.tables,
                row_filters = query.predicates_added.len(),
                "Query authorized"
            ),
            Err(err) => tracing::info!(kind = err.kind().as_str(), "Query denied"),
        }
        result
    }

    fn run(&self, request: &AuthorizeRequest<'_>, request_id: String) -> Result<AuthorizedQuery, AuthError> {
        let cleaned = validate_safety(request.sql, request.allow_all_ops)?;
        let extraction = self.extractor.extract(&cleaned)?;

        let policy = self.compiler.compile(request.principal, request.connection_id)?;
        let operation = statement_operation(&cleaned)?;
        check_table_access(&extraction, operation, &policy)?;

        self.check_schema(&extraction, request.catalog)?;

        let injection = if policy.is_admin {
            None
        } else {
            Some(self.injector.inject_extracted(
                &cleaned,
                &extraction,
                request.principal,
                |table| policy.table_permission(table),
            ))
        };

        check_columns(&extraction, request.catalog, &policy)?;

        let (mut sql, tables_scoped, tables_skipped, predicates_added) = match injection {
            Some(result) => (
                result.rewritten_sql,
                result.tables_scoped,
                result.tables_skipped,
                result.predicates_added,
            ),
            None => (cleaned, Vec::new(), Vec::new(), Vec::new()),
        };
        if !predicates_added.is_empty() {
            sql = validate_safety(&sql, request.allow_all_ops).inspect_err(|err| {
                tracing::warn!(error = %err, "Row filters produced an invalid statement");
            })?;
        }

        if let Some(limit) = self.config.limits.effective_limit(request.limit) {
            sql = append_limit(&sql, limit)?;
        }

        Ok(AuthorizedQuery {
            request_id,
            sql,
            operation,
            tables: extraction.table_names().into_iter().collect(),
            tables_scoped,
            tables_skipped,
            predicates_added,
            origins: result_origins(&extraction, request.catalog),
            policy,
        })
    }

    fn check_schema(&self, extraction: &Extraction, catalog: Option<&Catalog>) -> Result<(), AuthError> {
        let Some(catalog) = catalog else {
            return Ok(());
        };
        if self.config.schema_validation == SchemaValidationMode::Off {
            return Ok(());
        }
        let report = check_extraction(extraction, catalog);
        if report.valid {
            return Ok(());
        }
        match self.config.schema_validation {
            SchemaValidationMode::Enforce => report.into_result(),
            _ => {
                tracing::warn!(
                    invalid_tables = ?report.invalid_tables,
                    invalid_columns = ?report.invalid_columns,
                    "Schema validation failed; continuing"
                );
                Ok(())
            }
        }
    }

    /// Mask the result of an authorized query.
    pub fn mask_result(&self, result: QueryResult, query: &AuthorizedQuery) -> QueryResult {
        self.masker.mask(result, &query.policy, Some(&query.origins))
    }
}

impl std::fmt::Debug for QueryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGuard")
            .field("config", &self.config)
            .field("compiler", &self.compiler)
            .finish_non_exhaustive()
    }
}

/// Map each output column of the first set operand to its source.
fn result_origins(extraction: &Extraction, catalog: Option<&Catalog>) -> ResultOrigins {
    let tables: Vec<String> = extraction.table_names().into_iter().collect();
    let Some(scope) = extraction.segments().find(|s| !s.projections.is_empty()) else {
        return ResultOrigins {
            columns: Vec::new(),
            tables,
        };
    };

    let columns = scope
        .projections
        .iter()
        .map(|projection| {
            let table = projection.column.as_ref().and_then(|column| {
                let resolution = match &projection.table {
                    Some(qualifier) => scope.resolve_qualifier(qualifier),
                    None => scope.resolve(
                        &Reference {
                            table: None,
                            column: column.clone(),
                            clause: Clause::Select,
                            is_literal: false,
                            whole_item: false,
                            is_keyword: false,
                        },
                        catalog,
                    ),
                };
                match resolution {
                    Resolution::Tables(candidates) if candidates.len() == 1 => {
                        candidates.into_iter().next()
                    }
                    _ => None,
                }
            });
            ColumnOrigin {
                output: projection.output.clone(),
                table,
                column: projection.column.clone(),
                sources: projection
                    .refs
                    .iter()
                    .flat_map(|reference| sources_of(scope, reference, catalog))
                    .collect(),
            }
        })
        .collect();

    ResultOrigins { columns, tables }
}

/// Tables a select-item reference may read from. An ambiguous reference
/// counts against every candidate; one through a derived table against
/// the column name alone.
fn sources_of(scope: &Scope, reference: &Reference, catalog: Option<&Catalog>) -> Vec<SourceColumn> {
    let column = reference.column.to_lowercase();
    match scope.resolve(reference, catalog) {
        Resolution::Tables(candidates) if !candidates.is_empty() => candidates
            .into_iter()
            .map(|table| SourceColumn {
                table: Some(table),
                column: column.clone(),
            })
            .collect(),
        _ => vec![SourceColumn { table: None, column }],
    }
}
