use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Small TTL cache for per-tenant config on the webhook hot path. Negative
/// results are cached too (unknown slugs must 404 without a DB round-trip
/// on every probe). Readers take a read lock; entries expire by timestamp.
pub struct TtlCache<T: Clone> {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Option<T>)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `None` = not cached (or expired); `Some(inner)` = cached answer,
    /// where `inner` is `None` for a cached negative.
    pub fn get(&self, key: &str) -> Option<Option<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let (stored_at, value) = entries.get(key)?;
        if stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, key: &str, value: Option<T>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        // Opportunistic expiry sweep to keep the map from accreting slugs.
        if entries.len() > 4096 {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() <= ttl);
        }
        entries.insert(key.to_string(), (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_positive_and_negative_answers() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(5));
        assert!(cache.get("a").is_none());

        cache.put("a", Some("value".into()));
        assert_eq!(cache.get("a"), Some(Some("value".into())));

        cache.put("missing", None);
        assert_eq!(cache.get("missing"), Some(None));
    }

    #[test]
    fn entries_expire() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(0));
        cache.put("k", Some(7));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        cache.put("k", Some(7));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }
}
