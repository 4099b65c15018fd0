//! LRU + TTL cache for evaluation decisions
//!
//! Keyed by (subject, resource, action, instrument). Entries age out on a
//! short TTL and are invalidated synchronously by every mutation touching the
//! subject, before that mutation acknowledges. The cache is purely an
//! optimization: decisions are identical with it disabled.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::evaluator::Decision;
use crate::core::types::{ActionKind, ResourceKind, UserId};

/// Default entry budget
pub const DEFAULT_CAPACITY: usize = 4096;

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Cache key for one evaluated request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub subject: UserId,
    pub resource: ResourceKind,
    pub action: ActionKind,
    pub instrument: Option<String>,
}

impl CacheKey {
    pub fn new(
        subject: UserId,
        resource: ResourceKind,
        action: ActionKind,
        instrument: Option<&str>,
    ) -> Self {
        CacheKey {
            subject,
            resource,
            action,
            instrument: instrument.map(str::to_string),
        }
    }
}

struct CachedDecision {
    decision: Decision,
    inserted: Instant,
    ttl: Duration,
    hits: u64,
}

/// Shared decision cache
///
/// Interior mutability so readers share one instance through `Arc`; the lock
/// is held only for O(1) LRU operations. Capacity 0 disables caching entirely
/// (every get misses, every put is dropped).
pub struct DecisionCache {
    inner: Option<Mutex<LruCache<CacheKey, CachedDecision>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Counters for cache introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl DecisionCache {
    /// Create a cache with the given capacity and entry TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let inner = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        DecisionCache {
            inner,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(0, DEFAULT_TTL)
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.is_none()
    }

    /// Look up a decision. Expired entries are removed on sight.
    pub fn get(&self, key: &CacheKey) -> Option<Decision> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock();
        match cache.get_mut(key) {
            Some(entry) => {
                if entry.inserted.elapsed() >= entry.ttl {
                    cache.pop(key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    entry.hits += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry.decision.clone())
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a decision under the configured TTL.
    pub fn put(&self, key: CacheKey, decision: Decision) {
        self.put_with_ttl(key, decision, self.ttl);
    }

    /// Store a decision with an explicit TTL.
    pub fn put_with_ttl(&self, key: CacheKey, decision: Decision, ttl: Duration) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock();
            cache.put(
                key,
                CachedDecision {
                    decision,
                    inserted: Instant::now(),
                    ttl,
                    hits: 0,
                },
            );
        }
    }

    /// Drop every entry for one subject. Runs inside the mutation write path,
    /// before the mutation acknowledges.
    pub fn invalidate_subject(&self, subject: UserId) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock();
            let stale: Vec<CacheKey> = cache
                .iter()
                .filter(|(key, _)| key.subject == subject)
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
            }
        }
    }

    /// Drop everything. Used for Everyone-grantee mutations, which can affect
    /// any subject.
    pub fn invalidate_all(&self) {
        if let Some(inner) = &self.inner {
            inner.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Accumulated hits for one entry, if present and fresh.
    pub fn entry_hits(&self, key: &CacheKey) -> Option<u64> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock();
        cache.get(key).map(|entry| entry.hits)
    }
}
