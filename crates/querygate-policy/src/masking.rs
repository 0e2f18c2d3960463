//! Result masking.
//!
//! Runs after execution, on results of queries that already passed column
//! access enforcement. Masking only obfuscates values the principal may
//! see; it never replaces blocking.

use querygate_core::{MaskType, MaskingConfig, QueryResult};
use querygate_rls::ident_eq;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::compiler::{CompiledPolicy, strictest};

/// Source of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnOrigin {
    /// Name the column has in the result.
    pub output: String,
    /// Normalised source table, when it resolves to exactly one.
    pub table: Option<String>,
    /// Source column, when the select item is a plain column.
    pub column: Option<String>,
    /// Every column the select item reads, e.g. both sides of `a || b`.
    pub sources: Vec<SourceColumn>,
}

/// A column read by a select item. `table` is `None` when the reference
/// does not resolve to a known table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceColumn {
    pub table: Option<String>,
    pub column: String,
}

/// Where the columns of a result come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultOrigins {
    pub columns: Vec<ColumnOrigin>,
    /// Every table the query reads.
    pub tables: Vec<String>,
}

impl ResultOrigins {
    /// Origins of result column `index` named `name` in a result `width`
    /// columns wide. Without a wildcard the select list lines up with the
    /// result by position; otherwise every origin sharing the name counts.
    fn candidates(&self, index: usize, name: &str, width: usize) -> Vec<&ColumnOrigin> {
        let has_wildcard = self.columns.iter().any(|c| c.output.ends_with('*'));
        if !has_wildcard && width == self.columns.len() {
            return self.columns.get(index).into_iter().collect();
        }
        self.columns
            .iter()
            .filter(|c| ident_eq(&c.output, name))
            .collect()
    }
}

/// Applies column masks to query results.
#[derive(Debug, Clone, Default)]
pub struct ResultMasker {
    config: MaskingConfig,
}

impl ResultMasker {
    pub fn new(config: MaskingConfig) -> Self {
        Self { config }
    }

    /// Mask `result` per `policy`.
    ///
    /// With `origins`, each column is looked up at its source; columns
    /// without a precise source are matched by name against the tables the
    /// query reads. Without `origins`, names are matched against every
    /// table in the policy.
    pub fn mask(
        &self,
        mut result: QueryResult,
        policy: &CompiledPolicy,
        origins: Option<&ResultOrigins>,
    ) -> QueryResult {
        let width = result.columns.len();
        let masks: Vec<Option<MaskType>> = result
            .columns
            .iter()
            .enumerate()
            .map(|(index, name)| column_mask(index, name, width, policy, origins))
            .collect();

        if masks.iter().all(Option::is_none) {
            return result;
        }
        tracing::debug!(
            masked_columns = masks.iter().filter(|m| m.is_some()).count(),
            rows = result.rows.len(),
            "Masking result"
        );

        for row in &mut result.rows {
            for (cell, mask) in row.iter_mut().zip(&masks) {
                if let Some(mask) = mask {
                    *cell = mask_value(cell, *mask, &self.config);
                }
            }
        }
        result
    }
}

/// Mask `result` with default masking parameters, matching columns by name.
pub fn mask_result(result: QueryResult, policy: &CompiledPolicy) -> QueryResult {
    ResultMasker::default().mask(result, policy, None)
}

fn column_mask(
    index: usize,
    name: &str,
    width: usize,
    policy: &CompiledPolicy,
    origins: Option<&ResultOrigins>,
) -> Option<MaskType> {
    let Some(origins) = origins else {
        return policy.mask_anywhere(name);
    };
    let tables = || origins.tables.iter().map(String::as_str);

    let candidates = origins.candidates(index, name, width);
    if candidates.is_empty() {
        return policy.mask_by_name(tables(), name);
    }
    candidates.into_iter().fold(None, |acc, origin| {
        let own = match (&origin.table, &origin.column) {
            (Some(table), Some(column)) => policy.mask_for(table, column),
            (None, Some(column)) => policy.mask_by_name(tables(), column),
            (_, None) if origin.sources.is_empty() => policy.mask_by_name(tables(), name),
            (_, None) => None,
        };
        let read = origin.sources.iter().fold(None, |acc, source| {
            let mask = match &source.table {
                Some(table) => policy.mask_for(table, &source.column),
                None => policy.mask_by_name(tables(), &source.column),
            };
            strictest(acc, mask)
        });
        strictest(acc, strictest(own, read))
    })
}

/// Mask a single value.
///
/// `full` always yields the redaction marker. `hash` and `partial` keep
/// NULL as NULL and work on the textual form of other scalars.
pub fn mask_value(value: &Value, mask: MaskType, config: &MaskingConfig) -> Value {
    if mask == MaskType::Full {
        return Value::String(config.redaction_marker.clone());
    }
    let text = match value {
        Value::Null => return Value::Null,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match mask {
        MaskType::Hash => Value::String(hash_text(&text, config.hash_length)),
        MaskType::Partial => Value::String(partial_text(
            &text,
            config.partial_prefix,
            config.partial_suffix,
        )),
        MaskType::Full => Value::String(config.redaction_marker.clone()),
    }
}

fn hash_text(text: &str, length: usize) -> String {
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    digest.chars().take(length).collect()
}

fn partial_text(text: &str, prefix: usize, suffix: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    if n <= prefix + suffix {
        return "*".repeat(n);
    }
    let mut out: String = chars[..prefix].iter().collect();
    out.push_str(&"*".repeat(n - prefix - suffix));
    out.extend(&chars[n - suffix..]);
    out
}
