//! Mandate cache (§4.2): an optional in-memory LRU-with-TTL in front of the
//! mandate store, keyed by `mandate_id`.
//!
//! Correctness never depends on this cache (§9 "cache coherence"): a cached
//! entry is only ever used to skip a store round-trip, never to skip
//! signature verification, and it is invalidated on every successful
//! `revoke()`. If the cache and the store ever disagree, the store wins —
//! in practice that means an invalidation happens before or during the same
//! call that marks a mandate revoked, not after.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::model::ExecutionMandate;

struct Entry {
    mandate: ExecutionMandate,
    inserted_at: Instant,
}

struct Inner {
    entries: HashMap<Uuid, Entry>,
    /// Access order, oldest first. A `mandate_id` may appear more than once;
    /// only the most recent occurrence is authoritative. Stale entries are
    /// skipped on eviction and dropped lazily.
    order: Vec<Uuid>,
    capacity: usize,
    ttl: Duration,
}

/// Thread-safe LRU cache of [`ExecutionMandate`] rows, with a TTL independent
/// of (and never later than) the mandate's own `valid_until`.
///
/// Cloning shares the same underlying table, the same idiom `Store` uses for
/// its connection — so a `MandateCache` can be constructed once and handed
/// to both the evaluator (reads) and the mandate manager (invalidation on
/// revoke).
#[derive(Clone)]
pub struct MandateCache {
    inner: Arc<Mutex<Inner>>,
}

impl MandateCache {
    /// `capacity` bounds the number of distinct mandates held at once;
    /// `ttl` is the maximum time an entry is trusted without a fresh store
    /// read, regardless of the mandate's own validity window.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                capacity: capacity.max(1),
                ttl,
            })),
        }
    }

    /// Looks up `mandate_id`. Returns `None` on a miss, an expired entry
    /// (`ttl` elapsed, or `now` past the mandate's own `valid_until`), or an
    /// entry for a mandate that has since been revoked in memory — the
    /// caller must still re-verify the signature and re-check validity; the
    /// cache only ever saves a store round-trip, never a correctness check.
    pub fn get(&self, mandate_id: Uuid, now: chrono::DateTime<chrono::Utc>) -> Option<ExecutionMandate> {
        let mut inner = self.inner.lock().unwrap();
        let ttl = inner.ttl;
        let expired = match inner.entries.get(&mandate_id) {
            Some(entry) => entry.inserted_at.elapsed() > ttl || now > entry.mandate.valid_until,
            None => return None,
        };
        if expired {
            inner.entries.remove(&mandate_id);
            return None;
        }
        inner.order.retain(|id| *id != mandate_id);
        inner.order.push(mandate_id);
        inner.entries.get(&mandate_id).map(|e| e.mandate.clone())
    }

    /// Inserts or refreshes `mandate`. Evicts the least-recently-used entry
    /// first if the cache is at capacity. A revoked mandate is never worth
    /// caching — the evaluator calls [`Self::invalidate`] instead.
    pub fn put(&self, mandate: ExecutionMandate) {
        let mut inner = self.inner.lock().unwrap();
        let mandate_id = mandate.mandate_id;
        inner.order.retain(|id| *id != mandate_id);
        inner.order.push(mandate_id);
        inner.entries.insert(
            mandate_id,
            Entry {
                mandate,
                inserted_at: Instant::now(),
            },
        );

        while inner.entries.len() > inner.capacity {
            if inner.order.is_empty() {
                break;
            }
            let oldest = inner.order.remove(0);
            inner.entries.remove(&oldest);
        }
    }

    /// Drops any cached entry for `mandate_id`. Called by the Mandate
    /// Manager on every successful `revoke()`, cascaded children included.
    pub fn invalidate(&self, mandate_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&mandate_id);
        inner.order.retain(|id| *id != mandate_id);
    }

    /// Number of entries currently cached, expired or not. Test/diagnostic
    /// use only.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
