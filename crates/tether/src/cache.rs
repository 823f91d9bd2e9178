//! TTL-keyed memoization of call results.
//!
//! Keying is by call identity: the registered name plus the canonical
//! encoding of the submitted arguments. That makes the cache sensitive to
//! anything that perturbs the argument encoding, which is a known footgun
//! rather than something to silently "fix" with semantic hashing.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

/// Identity of a cacheable call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    name: String,
    args: String,
}

impl CacheKey {
    pub fn new(name: &str, args: &Value) -> Self {
        Self {
            name: name.to_string(),
            args: args.to_string(),
        }
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

#[derive(Default)]
pub(crate) struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A non-expired entry's value, or None. Expired entries are removed
    /// atomically so a racing store of a fresh result is never clobbered.
    pub fn lookup(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .and_then(|e| (e.expires_at > now).then(|| e.value.clone()));
        if value.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        value
    }

    /// Memoize a completed result; expiry is computed at completion time.
    pub fn store(&self, key: CacheKey, value: Value, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Drop the entry for a call identity; uncached submissions use this so
    /// they always observe fresh results.
    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
