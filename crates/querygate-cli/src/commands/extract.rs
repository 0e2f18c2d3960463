//! `querygate extract`: print what the reference extractor sees.

use anyhow::Result;
use serde_json::json;

use querygate_policy::AuthError;
use querygate_rls::{ReferenceExtractor, TextExtractor, strip_comments};

use super::Outcome;

pub fn run(sql: &str) -> Result<Outcome> {
    let cleaned = match strip_comments(sql) {
        Ok(cleaned) => cleaned,
        Err(err) => return Ok(Outcome::denied(&AuthError::from(err))),
    };

    Ok(match TextExtractor::new().extract(&cleaned) {
        Ok(extraction) => Outcome::allowed(json!({
            "tables": extraction.table_names(),
            "select_aliases": extraction.select_aliases(),
            "scopes": extraction.scopes(),
        })),
        Err(err) => Outcome::denied(&AuthError::from(err)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tables_listed() {
        let outcome =
            run("SELECT u.id FROM users u JOIN orders o ON o.user_id = u.id").unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.output["tables"], json!(["orders", "users"]));
    }

    #[test]
    fn test_unbalanced_input() {
        let outcome = run("SELECT (id FROM users").unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.output["kind"], json!("unparseable"));
    }
}
