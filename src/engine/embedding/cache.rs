// Embedding cache — LRU with per-entry TTL.
// Key is a 64-bit FNV-1a fingerprint of the normalised text (trimmed,
// lowercased, inner whitespace collapsed), so semantically identical
// spellings share one entry.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stable non-cryptographic 64-bit fingerprint (FNV-1a).
pub fn fingerprint(text: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x1_0000_01b3;
    let mut hash = OFFSET;
    let mut last_space = false;
    for ch in text.trim().chars() {
        let lowered = ch.to_lowercase();
        for c in lowered {
            let is_space = c.is_whitespace();
            if is_space && last_space {
                continue;
            }
            last_space = is_space;
            let c = if is_space { ' ' } else { c };
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                hash ^= *b as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        }
    }
    hash
}

struct Entry {
    vector: Vec<f32>,
    stored_at: Instant,
}

/// Bounded cache: least-recently-used eviction on overflow, TTL on read.
pub struct EmbeddingCache {
    entries: Mutex<LruCache<u64, Entry>>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(max_size: usize, ttl_secs: u64, enabled: bool) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("non-zero cache capacity");
        EmbeddingCache {
            entries: Mutex::new(LruCache::new(cap)),
            ttl: Duration::from_secs(ttl_secs),
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up by pre-computed fingerprint. Expired entries read as a
    /// miss and are evicted on the spot.
    pub fn get(&self, key: u64) -> Option<Vec<f32>> {
        if !self.enabled {
            return None;
        }
        let mut map = self.entries.lock();
        if let Some(entry) = map.get(&key) {
            if entry.stored_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.vector.clone());
            }
            map.pop(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: u64, vector: Vec<f32>) {
        if !self.enabled {
            return;
        }
        let mut map = self.entries.lock();
        if map.len() == map.cap().get() && !map.contains(&key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        map.put(key, Entry { vector, stored_at: Instant::now() });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn stats(&self) -> serde_json::Value {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        serde_json::json!({
            "enabled": self.enabled,
            "hits": hits,
            "misses": misses,
            "evictions": self.evictions.load(Ordering::Relaxed),
            "size": self.len(),
            "hit_rate": if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            "ttl_secs": self.ttl.as_secs(),
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_normalises_case_and_whitespace() {
        assert_eq!(fingerprint("Hola  Mundo"), fingerprint("hola mundo"));
        assert_eq!(fingerprint("  hola mundo  "), fingerprint("hola mundo"));
        assert_ne!(fingerprint("hola mundo"), fingerprint("hola marte"));
    }

    #[test]
    fn cache_hit_and_miss_counting() {
        let cache = EmbeddingCache::new(10, 3600, true);
        let k = fingerprint("query");
        assert!(cache.get(k).is_none());
        cache.put(k, vec![1.0, 2.0]);
        assert_eq!(cache.get(k), Some(vec![1.0, 2.0]));

        let stats = cache.stats();
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["misses"], 1);
    }

    #[test]
    fn cache_evicts_lru_at_capacity() {
        let cache = EmbeddingCache::new(2, 3600, true);
        cache.put(1, vec![1.0]);
        cache.put(2, vec![2.0]);
        cache.get(1); // 2 is now least-recently-used
        cache.put(3, vec![3.0]);

        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.stats()["evictions"], 1);
    }

    #[test]
    fn ttl_zero_expires_immediately() {
        let cache = EmbeddingCache::new(10, 0, true);
        let k = fingerprint("short lived");
        cache.put(k, vec![1.0]);
        assert!(cache.get(k).is_none());
        assert_eq!(cache.stats()["evictions"], 1);
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = EmbeddingCache::new(10, 3600, false);
        cache.put(1, vec![1.0]);
        assert!(cache.get(1).is_none());
        assert_eq!(cache.len(), 0);
    }
}
