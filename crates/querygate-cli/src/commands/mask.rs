//! `querygate mask`: mask a stored query result for a principal.
//!
//! With `--sql` the query is authorized first and masks follow each
//! column back to its source table. Without it, result columns are matched
//! by name against every table in the principal's policy.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

use querygate_core::QueryResult;
use querygate_policy::{AuthorizeRequest, ResultMasker};

use super::{Outcome, PrincipalArgs, SourceArgs};

#[derive(Args, Debug, Clone)]
pub struct MaskArgs {
    /// Result file: `{"columns": [...], "rows": [[...], ...]}`
    #[arg(long)]
    pub result: PathBuf,

    /// The query that produced the result
    #[arg(long)]
    pub sql: Option<String>,

    #[command(flatten)]
    pub principal: PrincipalArgs,

    #[command(flatten)]
    pub sources: SourceArgs,
}

pub fn run(args: &MaskArgs) -> Result<Outcome> {
    let content = fs::read_to_string(&args.result)
        .with_context(|| format!("Failed to read result {}", args.result.display()))?;
    let result: QueryResult = serde_json::from_str(&content)
        .with_context(|| format!("Invalid result file {}", args.result.display()))?;

    let guard = args.sources.guard()?;
    let principal = args.principal.principal();

    let masked = match &args.sql {
        Some(sql) => {
            let catalog = args.sources.catalog()?;
            let request = AuthorizeRequest::new(sql, &principal, &args.principal.connection)
                .with_catalog(catalog.as_ref());
            match guard.authorize(&request) {
                Ok(query) => guard.mask_result(result, &query),
                Err(err) => return Ok(Outcome::denied(&err)),
            }
        }
        None => match guard.compiler().compile(&principal, &args.principal.connection) {
            Ok(policy) => {
                ResultMasker::new(guard.config().masking.clone()).mask(result, &policy, None)
            }
            Err(err) => return Ok(Outcome::denied(&err)),
        },
    };

    Ok(Outcome::allowed(json!({ "allowed": true, "result": masked })))
}
