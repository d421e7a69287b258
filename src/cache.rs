//! Response Cache
//!
//! TTL-keyed in-memory cache of backend responses with per-capability policy.
//!
//! ## Usage
//!
//! ```
//! use tokio_service_router::{CacheManager, Capability};
//! use tokio_service_router::config::CacheConfig;
//! use serde_json::json;
//!
//! let cache = CacheManager::new(CacheConfig::default());
//! let key = CacheManager::key(&Capability::Search, &json!({"q": "rust"}));
//!
//! assert!(cache.set(&key, json!(["result"]), &Capability::Search));
//! assert_eq!(cache.get(&key), Some(json!(["result"])));
//!
//! // Live data is never cached.
//! assert!(!cache.set(&key, json!(1), &Capability::RealTime));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::{CacheConfig, CachePolicy};
use crate::metrics;
use crate::routing::Capability;

/// Cache entry with expiration
#[derive(Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// Cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries currently stored (including not-yet-purged expired ones).
    pub entries: usize,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// `hits / (hits + misses)`, or 0.0 before the first lookup.
    pub hit_rate: f64,
}

/// In-memory response cache.
pub struct CacheManager {
    config: CacheConfig,
    store: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("entries", &self.store.len())
            .field("max_entries", &self.config.max_entries)
            .finish()
    }
}

impl CacheManager {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Stable cache key for `(capability, payload)`.
    ///
    /// Object keys are serialized in sorted order, so payloads that differ
    /// only in key order share a key.
    pub fn key(capability: &Capability, payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(capability.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(canonical_json(payload).as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Effective policy for `capability`: the configured override, else the
    /// built-in TTL table.
    pub fn policy(&self, capability: &Capability) -> CachePolicy {
        self.config
            .policies
            .get(capability)
            .copied()
            .unwrap_or_else(|| {
                let ttl_secs = capability.default_cache_ttl();
                CachePolicy {
                    ttl_secs,
                    enabled: ttl_secs > 0,
                }
            })
    }

    /// Whether a result for `capability` may be stored.
    pub fn should_cache(&self, capability: &Capability, result: &Value) -> bool {
        let policy = self.policy(capability);
        self.config.enabled && policy.enabled && policy.ttl_secs > 0 && !result.is_null()
    }

    /// Look up a live entry. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let found = self.store.get(key).map(|e| (e.expires_at > now, e.value.clone()));
        let value = match found {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                if self.evict_if_expired(key, now) {
                    debug!(key, "cache entry expired");
                }
                None
            }
            None => None,
        };

        let hit = value.is_some();
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::inc_cache_lookup(hit);
        debug!(key, hit, "cache lookup");
        value
    }

    /// Remove `key` only if it is still expired at `now`; an entry written
    /// since the expiry was observed survives.
    fn evict_if_expired(&self, key: &str, now: Instant) -> bool {
        self.store.remove_if(key, |_, e| e.expires_at <= now).is_some()
    }

    /// Store `value` under `key` with the TTL of `capability`'s policy.
    ///
    /// Returns `false` (and stores nothing) when the policy forbids caching.
    pub fn set(&self, key: &str, value: Value, capability: &Capability) -> bool {
        if !self.should_cache(capability, &value) {
            return false;
        }
        let ttl = Duration::from_secs(self.policy(capability).ttl_secs);

        if self.config.max_entries == 0 {
            return false;
        }
        if !self.store.contains_key(key) && self.store.len() >= self.config.max_entries {
            self.evict_one();
        }

        self.store.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(key, capability = %capability, ttl_secs = ttl.as_secs(), "cached");
        true
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.store.remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.store.clear();
        debug!("cache cleared");
    }

    /// Remove all expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.store.len())
    }

    /// `hits / (hits + misses)`, or 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }

    /// Evict the entry closest to expiry.
    fn evict_one(&self) {
        // Collect the key first so no read guard is held during remove.
        let victim = self
            .store
            .iter()
            .min_by_key(|e| e.expires_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.store.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache eviction");
        }
    }
}

/// Serialize with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        map.get(k).map_or_else(String::new, canonical_json)
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> CacheManager {
        CacheManager::new(CacheConfig::default())
    }

    #[test]
    fn test_key_ignores_object_key_order() {
        let a = CacheManager::key(&Capability::Search, &json!({"a": 1, "b": {"x": 1, "y": 2}}));
        let b = CacheManager::key(&Capability::Search, &json!({"b": {"y": 2, "x": 1}, "a": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_depends_on_capability() {
        let payload = json!({"q": "x"});
        assert_ne!(
            CacheManager::key(&Capability::Search, &payload),
            CacheManager::key(&Capability::Analysis, &payload)
        );
    }

    #[test]
    fn test_zero_ttl_capability_never_cached() {
        let cache = cache();
        assert!(!cache.set("k", json!(1), &Capability::RealTime));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_disabled_policy_override_never_cached() {
        let mut config = CacheConfig::default();
        config.policies.insert(
            Capability::Search,
            CachePolicy {
                ttl_secs: 300,
                enabled: false,
            },
        );
        let cache = CacheManager::new(config);
        assert!(!cache.set("k", json!(1), &Capability::Search));
    }

    #[test]
    fn test_null_result_not_cached() {
        assert!(!cache().should_cache(&Capability::Search, &Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_not_served_after_expiry() {
        let mut config = CacheConfig::default();
        config.policies.insert(
            Capability::Search,
            CachePolicy {
                ttl_secs: 1,
                enabled: true,
            },
        );
        let cache = CacheManager::new(config);
        assert!(cache.set("k", json!("v"), &Capability::Search));
        assert_eq!(cache.get("k"), Some(json!("v")));
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().entries, 0, "expired entry removed on read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_eviction_spares_entry_rewritten_since() {
        let mut config = CacheConfig::default();
        config.policies.insert(
            Capability::Search,
            CachePolicy {
                ttl_secs: 1,
                enabled: true,
            },
        );
        let cache = CacheManager::new(config);
        assert!(cache.set("k", json!("old"), &Capability::Search));
        tokio::time::advance(Duration::from_millis(1500)).await;
        let observed = Instant::now();

        // A writer refreshes the key after a reader saw it expired.
        assert!(cache.set("k", json!("new"), &Capability::Search));
        assert!(!cache.evict_if_expired("k", observed));
        assert_eq!(cache.get("k"), Some(json!("new")));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(cache.evict_if_expired("k", Instant::now()));
    }

    #[test]
    fn test_hit_rate() {
        let cache = cache();
        assert_eq!(cache.hit_rate(), 0.0);
        cache.set("k", json!(1), &Capability::Search);
        let _ = cache.get("k");
        let _ = cache.get("k");
        let _ = cache.get("missing");
        assert!((cache.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_entry_closest_to_expiry() {
        let config = CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        };
        let cache = CacheManager::new(config);
        cache.set("search", json!(1), &Capability::Search); // 300s
        cache.set("embed", json!(2), &Capability::Embedding); // 3600s
        cache.set("report", json!(3), &Capability::Reporting); // 600s
        assert!(cache.get("search").is_none());
        assert!(cache.get("embed").is_some());
        assert!(cache.get("report").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_and_invalidate() {
        let cache = cache();
        cache.set("short", json!(1), &Capability::Search);
        cache.set("long", json!(2), &Capability::Embedding);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.invalidate("long"));
        assert!(!cache.invalidate("long"));
    }
}
