//! `querygate check`: run the full pipeline for one query.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use querygate_policy::AuthorizeRequest;

use super::{Outcome, PrincipalArgs, SourceArgs};

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[arg(long)]
    pub sql: String,

    #[command(flatten)]
    pub principal: PrincipalArgs,

    #[command(flatten)]
    pub sources: SourceArgs,

    /// Allow non-read statements (operator-configured SQL only)
    #[arg(long, default_value_t = false)]
    pub allow_all_ops: bool,

    /// Requested row limit, clamped to the configured maximum
    #[arg(long)]
    pub limit: Option<u32>,
}

pub fn run(args: &CheckArgs) -> Result<Outcome> {
    let guard = args.sources.guard()?;
    let catalog = args.sources.catalog()?;
    let principal = args.principal.principal();

    let request = AuthorizeRequest::new(&args.sql, &principal, &args.principal.connection)
        .with_catalog(catalog.as_ref())
        .allow_all_ops(args.allow_all_ops)
        .with_limit(args.limit);

    Ok(match guard.authorize(&request) {
        Ok(query) => Outcome::allowed(json!({ "allowed": true, "query": query })),
        Err(err) => Outcome::denied(&err),
    })
}
