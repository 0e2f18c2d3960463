//! Policy compilation.
//!
//! Turns the effective policy record set for a principal into lookup maps
//! keyed by lowercase table and column names. Non-admin principals without
//! a record set are denied outright.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use querygate_core::{MaskType, PolicySet, Principal, TablePermission, normalize_table_name};
use serde::Serialize;

use crate::cache::PolicyCache;
use crate::error::AuthError;
use crate::store::PolicyStore;

/// Access and masking rule for one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnPolicy {
    pub accessible: bool,
    pub mask: Option<MaskType>,
}

/// Request-scoped, indexed view of a principal's permissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompiledPolicy {
    pub is_admin: bool,
    /// Tables a non-admin may reference. Unused for admins.
    pub allowed_tables: BTreeSet<String>,
    pub table_permission_map: BTreeMap<String, TablePermission>,
    pub column_permission_map: BTreeMap<String, BTreeMap<String, ColumnPolicy>>,
}

impl CompiledPolicy {
    /// Index the enabled tables of `set`.
    pub fn from_policy_set(set: Option<&PolicySet>, is_admin: bool) -> Self {
        let mut policy = Self {
            is_admin,
            ..Self::default()
        };
        let Some(set) = set else {
            return policy;
        };

        for permission in set.tables.iter().filter(|t| t.enabled) {
            let key = normalize_table_name(&permission.table_name);
            if !is_admin {
                policy.allowed_tables.insert(key.clone());
            }

            let columns = policy.column_permission_map.entry(key.clone()).or_default();
            for column in &permission.column_permissions {
                let incoming = ColumnPolicy {
                    accessible: column.accessible,
                    mask: column.effective_mask(),
                };
                columns
                    .entry(column.column_name.to_lowercase())
                    .and_modify(|existing| {
                        existing.accessible &= incoming.accessible;
                        existing.mask = strictest(existing.mask, incoming.mask);
                    })
                    .or_insert(incoming);
            }

            match policy.table_permission_map.get_mut(&key) {
                Some(existing) => {
                    tracing::warn!(table = %key, "Duplicate table permission; keeping common operations");
                    existing
                        .allowed_operations
                        .retain(|op| permission.allowed_operations.contains(op));
                }
                None => {
                    policy.table_permission_map.insert(key, permission.clone());
                }
            }
        }
        policy
    }

    /// Whether a non-admin may reference `table` at all.
    pub fn is_table_allowed(&self, table: &str) -> bool {
        self.is_admin || self.allowed_tables.contains(&normalize_table_name(table))
    }

    pub fn table_permission(&self, table: &str) -> Option<&TablePermission> {
        self.table_permission_map.get(&normalize_table_name(table))
    }

    pub fn column_policy(&self, table: &str, column: &str) -> Option<&ColumnPolicy> {
        self.column_permission_map
            .get(&normalize_table_name(table))?
            .get(&column.to_lowercase())
    }

    /// Whether `table.column` is explicitly marked inaccessible.
    pub fn is_denied(&self, table: &str, column: &str) -> bool {
        self.column_policy(table, column)
            .is_some_and(|policy| !policy.accessible)
    }

    pub fn has_denied_columns(&self, table: &str) -> bool {
        self.column_permission_map
            .get(&normalize_table_name(table))
            .is_some_and(|columns| columns.values().any(|c| !c.accessible))
    }

    pub fn mask_for(&self, table: &str, column: &str) -> Option<MaskType> {
        self.column_policy(table, column)?.mask
    }

    /// Strictest mask any of `tables` puts on a column name.
    pub fn mask_by_name<'t>(
        &self,
        tables: impl IntoIterator<Item = &'t str>,
        column: &str,
    ) -> Option<MaskType> {
        tables
            .into_iter()
            .fold(None, |acc, table| strictest(acc, self.mask_for(table, column)))
    }

    /// Strictest mask any table in the policy puts on a column name.
    pub fn mask_anywhere(&self, column: &str) -> Option<MaskType> {
        self.mask_by_name(self.column_permission_map.keys().map(String::as_str), column)
    }

    /// Whether any column of any table is masked.
    pub fn has_masks(&self) -> bool {
        self.column_permission_map
            .values()
            .flat_map(|columns| columns.values())
            .any(|c| c.mask.is_some())
    }
}

/// `Full` hides more than `Hash`, which hides more than `Partial`.
pub fn strictest(a: Option<MaskType>, b: Option<MaskType>) -> Option<MaskType> {
    fn rank(mask: MaskType) -> u8 {
        match mask {
            MaskType::Partial => 1,
            MaskType::Hash => 2,
            MaskType::Full => 3,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => Some(if rank(y) > rank(x) { y } else { x }),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Compiles policies from a store, through a cache.
pub struct PolicyCompiler {
    store: Arc<dyn PolicyStore>,
    cache: Arc<PolicyCache>,
}

impl PolicyCompiler {
    /// Compiler without caching.
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            cache: Arc::new(PolicyCache::disabled()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<PolicyCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.cache
    }

    /// Compile the effective policy of `principal` on `connection_id`.
    pub fn compile(
        &self,
        principal: &Principal,
        connection_id: &str,
    ) -> Result<CompiledPolicy, AuthError> {
        let set = self.effective_set(principal, connection_id)?;

        if principal.is_admin() {
            return Ok(CompiledPolicy::from_policy_set(set.as_deref(), true));
        }

        let Some(set) = set else {
            tracing::info!(
                role = %principal.role,
                connection_id,
                "No policy record for role; denying"
            );
            return Err(AuthError::PolicyMissing {
                role: principal.role,
                connection_id: connection_id.to_string(),
            });
        };

        let policy = CompiledPolicy::from_policy_set(Some(set.as_ref()), false);
        tracing::debug!(
            allowed_tables = ?policy.allowed_tables,
            "Compiled policy"
        );
        Ok(policy)
    }

    fn effective_set(
        &self,
        principal: &Principal,
        connection_id: &str,
    ) -> Result<Option<Arc<PolicySet>>, AuthError> {
        let org = principal.organization_id.as_str();
        if let Some(set) = self.cache.get(org, connection_id, principal.role) {
            tracing::debug!("Policy cache hit");
            return Ok(Some(set));
        }

        let sets = self
            .store
            .find(org, connection_id, principal.role)
            .map_err(|e| AuthError::PolicyStore(e.to_string()))?;

        let Some(latest) = latest(sets) else {
            return Ok(None);
        };
        let latest = Arc::new(latest);
        self.cache.insert(Arc::clone(&latest));
        Ok(Some(latest))
    }
}

impl std::fmt::Debug for PolicyCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCompiler")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Latest by `updated_at`; on ties the later set wins.
fn latest(sets: Vec<PolicySet>) -> Option<PolicySet> {
    sets.into_iter().fold(None, |best, set| match best {
        Some(best) if best.updated_at > set.updated_at => Some(best),
        _ => Some(set),
    })
}
