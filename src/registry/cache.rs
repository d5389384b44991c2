//! Bounded cache of compiled schemas

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::schema::CompiledSchema;
use crate::version::SchemaVersion;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    schema: Arc<CompiledSchema>,
    inserted_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<(String, SchemaVersion), CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Compiled schemas keyed by (name, version), bounded by entry count and age.
///
/// Expired entries go first when room is needed, then the oldest.
pub struct CompiledSchemaCache {
    max_entries: usize,
    ttl: Duration,
    clock: SharedClock,
    inner: Mutex<CacheInner>,
}

impl CompiledSchemaCache {
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            ttl: Duration::seconds(i64::try_from(config.ttl_secs).unwrap_or(i64::MAX / 1000)),
            clock,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, name: &str, version: &SchemaVersion) -> Option<Arc<CompiledSchema>> {
        let now = self.clock.utc();
        let mut inner = self.inner.lock();
        let key = (name.to_string(), version.clone());
        let lookup = inner
            .entries
            .get(&key)
            .map(|entry| (now - entry.inserted_at < self.ttl, entry.schema.clone()));
        let fresh = match lookup {
            Some((true, schema)) => Some(schema),
            Some((false, _)) => {
                inner.entries.remove(&key);
                inner.evictions += 1;
                debug!(name = %name, version = %version, "compiled schema expired");
                None
            }
            None => None,
        };
        match fresh {
            Some(schema) => {
                inner.hits += 1;
                Some(schema)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or replace an entry
    pub fn insert(&self, schema: Arc<CompiledSchema>) {
        let now = self.clock.utc();
        let key = (schema.name().to_string(), schema.version().clone());
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            let ttl = self.ttl;
            let before = inner.entries.len();
            inner.entries.retain(|_, entry| now - entry.inserted_at < ttl);
            let expired = before - inner.entries.len();
            inner.evictions += expired as u64;

            if inner.entries.len() >= self.max_entries {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    debug!(name = %oldest.0, version = %oldest.1, "evicting oldest compiled schema");
                    inner.entries.remove(&oldest);
                    inner.evictions += 1;
                }
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                schema,
                inserted_at: now,
            },
        );
    }

    pub fn remove(&self, name: &str, version: &SchemaVersion) -> bool {
        self.inner
            .lock()
            .entries
            .remove(&(name.to_string(), version.clone()))
            .is_some()
    }

    /// Drop every version of `name`
    pub fn remove_all(&self, name: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|(entry_name, _), _| entry_name != name);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::compiler::compile;
    use crate::compiler::fixtures::{registration, ORDER_V1};
    use chrono::TimeZone;

    fn schema(version: &str) -> Arc<CompiledSchema> {
        Arc::new(compile(registration("Order", version, ORDER_V1), &|_| None).unwrap())
    }

    fn cache(max_entries: usize, ttl_secs: u64) -> (Arc<FixedClock>, CompiledSchemaCache) {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()));
        let cache = CompiledSchemaCache::new(&CacheConfig { max_entries, ttl_secs }, clock.clone());
        (clock, cache)
    }

    #[test]
    fn test_hit_and_miss() {
        let (_, cache) = cache(10, 300);
        let v1 = SchemaVersion::new(1, 0, 0);
        assert!(cache.get("Order", &v1).is_none());
        cache.insert(schema("1.0.0"));
        assert!(cache.get("Order", &v1).is_some());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_ttl_expiry() {
        let (clock, cache) = cache(10, 60);
        cache.insert(schema("1.0.0"));
        clock.advance(Duration::seconds(61));
        assert!(cache.get("Order", &SchemaVersion::new(1, 0, 0)).is_none());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let (clock, cache) = cache(2, 300);
        cache.insert(schema("1.0.0"));
        clock.advance(Duration::seconds(1));
        cache.insert(schema("1.1.0"));
        clock.advance(Duration::seconds(1));
        cache.insert(schema("1.2.0"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("Order", &SchemaVersion::new(1, 0, 0)).is_none());
        assert!(cache.get("Order", &SchemaVersion::new(1, 2, 0)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_remove_all_versions() {
        let (_, cache) = cache(10, 300);
        cache.insert(schema("1.0.0"));
        cache.insert(schema("1.1.0"));
        assert_eq!(cache.remove_all("Order"), 2);
        assert!(cache.is_empty());
    }
}
