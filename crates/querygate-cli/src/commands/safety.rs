//! `querygate safety`: statement safety check only.

use anyhow::Result;
use serde_json::json;

use querygate_policy::{AuthError, statement_operation, validate_safety};

use super::Outcome;

pub fn run(sql: &str, allow_all_ops: bool) -> Result<Outcome> {
    let checked = validate_safety(sql, allow_all_ops)
        .and_then(|cleaned| statement_operation(&cleaned).map(|op| (cleaned, op)));

    Ok(match checked {
        Ok((cleaned, operation)) => Outcome::allowed(json!({
            "allowed": true,
            "sql": cleaned,
            "operation": operation,
        })),
        Err(err) => denied(err),
    })
}

fn denied(err: AuthError) -> Outcome {
    tracing::debug!(error = %err, "Safety check failed");
    Outcome::denied(&err)
}
