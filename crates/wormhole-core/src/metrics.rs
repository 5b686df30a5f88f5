//! Atomic counters for wormhole observability.
//!
//! Each [`crate::Wormhole`] owns one [`Metrics`] so counts are per instance.
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a CLI command).

use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight atomic counters with no allocation and no locking.
#[derive(Debug)]
pub struct Metrics {
    validations: AtomicU64,
    admissions: AtomicU64,
    cache_hits: AtomicU64,
    invocations: AtomicU64,
    retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            validations: AtomicU64::new(0),
            admissions: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// A validator walk ran (accepted or not).
    pub fn inc_validations(&self) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validations", "counter incremented");
    }

    /// A new row was inserted into the function cache.
    pub fn inc_admissions(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "admissions", "counter incremented");
    }

    /// Admission found the id already cached.
    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_invocations(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "invocations", "counter incremented");
    }

    /// A unit of work was scheduled for replay.
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            validations = self.validations(),
            admissions = self.admissions(),
            cache_hits = self.cache_hits(),
            invocations = self.invocations(),
            retries = self.retries(),
        );
    }

    pub fn validations(&self) -> u64 {
        self.validations.load(Ordering::Relaxed)
    }

    pub fn admissions(&self) -> u64 {
        self.admissions.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.validations.store(0, Ordering::Relaxed);
        self.admissions.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.invocations.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
    }
}
