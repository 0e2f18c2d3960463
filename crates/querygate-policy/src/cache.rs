//! TTL-bounded cache of effective policy records.
//!
//! The cache is an explicit object handed to the compiler. Entries are
//! keyed by `(organization, connection, role)` and expire after the
//! configured TTL. Only found records are cached, so a newly granted role
//! takes effect on the next request.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use querygate_core::{PolicyCacheConfig, PolicySet, Role};

type CacheKey = (String, String, Role);

struct CacheEntry {
    set: Arc<PolicySet>,
    stored_at: Instant,
}

/// Cache of effective policy sets.
pub struct PolicyCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl PolicyCache {
    /// A TTL of zero disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_config(config: &PolicyCacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs))
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Fresh entry for the key, if any.
    pub fn get(&self, organization_id: &str, connection_id: &str, role: Role) -> Option<Arc<PolicySet>> {
        if !self.is_enabled() {
            return None;
        }
        let key = key(organization_id, connection_id, role);
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.set))
    }

    pub fn insert(&self, set: Arc<PolicySet>) {
        if !self.is_enabled() {
            return;
        }
        let key = key(&set.organization_id, &set.connection_id, set.role);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                set,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the entry for one key, e.g. after its records were edited.
    pub fn invalidate(&self, organization_id: &str, connection_id: &str, role: Role) {
        let key = key(organization_id, connection_id, role);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::from_config(&PolicyCacheConfig::default())
    }
}

impl std::fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.len())
            .finish()
    }
}

fn key(organization_id: &str, connection_id: &str, role: Role) -> CacheKey {
    (organization_id.to_string(), connection_id.to_string(), role)
}
