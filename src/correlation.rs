//! Request correlation cache.
//!
//! Bridges the gap between a request's capture and its response's capture.
//! Entries carry their insertion time; a periodic sweep (and an insert that
//! pushes the cache past its size limit) removes entries older than the
//! configured TTL so flows whose response never arrives do not accumulate.
//!
//! A size-triggered sweep that leaves the cache over its limit raises the
//! trigger to twice the remaining size, so a cache full of live entries is
//! not rescanned on every insert.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::event::CapturedRequest;
use crate::flow::FlowId;

// ============================================================================
// Correlation Cache
// ============================================================================

struct CacheEntry {
    request: CapturedRequest,
    inserted_at: Instant,
}

/// Concurrent map from flow identity to the captured request.
pub struct CorrelationCache {
    entries: DashMap<FlowId, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    /// Size above which the next insert sweeps
    sweep_threshold: AtomicUsize,
    evicted: AtomicU64,
}

impl CorrelationCache {
    /// Create an empty cache evicting entries older than `ttl`.
    ///
    /// An insert that takes the cache past `max_entries` sweeps immediately
    /// instead of waiting for the periodic sweep.
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            sweep_threshold: AtomicUsize::new(max_entries),
            evicted: AtomicU64::new(0),
        }
    }

    /// Store the request for `id`.
    ///
    /// Returns how many expired entries were evicted when the insert pushed
    /// the cache past its size limit.
    pub fn insert(&self, id: FlowId, request: CapturedRequest) -> usize {
        self.insert_at(id, request, Instant::now())
    }

    pub(crate) fn insert_at(&self, id: FlowId, request: CapturedRequest, now: Instant) -> usize {
        self.entries.insert(
            id,
            CacheEntry {
                request,
                inserted_at: now,
            },
        );

        if self.entries.len() > self.sweep_threshold.load(Ordering::Relaxed) {
            self.sweep_at(now)
        } else {
            0
        }
    }

    /// Remove and return the request for `id`.
    ///
    /// The removal is atomic: of two concurrent callers for the same id,
    /// exactly one receives the entry.
    pub fn take(&self, id: &FlowId) -> Option<CapturedRequest> {
        self.entries.remove(id).map(|(_, entry)| entry.request)
    }

    /// Evict entries older than the TTL. Returns the eviction count.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let mut evicted = 0usize;
        self.entries.retain(|_, entry| {
            let fresh = now.saturating_duration_since(entry.inserted_at) < self.ttl;
            if !fresh {
                evicted += 1;
            }
            fresh
        });

        let remaining = self.entries.len();
        let threshold = if remaining > self.max_entries {
            remaining.saturating_mul(2)
        } else {
            self.max_entries
        };
        self.sweep_threshold.store(threshold, Ordering::Relaxed);

        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, remaining, "Evicted stale correlation entries");
        }
        evicted
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is waiting for its response.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted over the cache's lifetime.
    pub fn evicted_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Age after which an entry is evicted.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

// ============================================================================
// Tests
// ============================================================================
