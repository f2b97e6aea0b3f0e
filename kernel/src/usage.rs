//! Cumulative usage counters shared by every task in the process.
//!
//! The oracle gateway and the pipeline increment them; the CLI reports a
//! snapshot at exit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::core::types::Tier;

#[derive(Debug, Default)]
pub struct UsageCounters {
    cheap_calls: AtomicU64,
    standard_calls: AtomicU64,
    premium_calls: AtomicU64,
    retries: AtomicU64,
    reprompts: AtomicU64,
    fallbacks: AtomicU64,
    exact_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub cheap_calls: u64,
    pub standard_calls: u64,
    pub premium_calls: u64,
    pub retries: u64,
    pub reprompts: u64,
    pub fallbacks: u64,
    pub exact_hits: u64,
    pub similar_hits: u64,
    pub misses: u64,
}

impl UsageSnapshot {
    pub fn remote_calls(&self) -> u64 {
        self.cheap_calls + self.standard_calls + self.premium_calls
    }

    /// Counter deltas since `earlier`.
    pub fn since(&self, earlier: &UsageSnapshot) -> UsageSnapshot {
        UsageSnapshot {
            cheap_calls: self.cheap_calls - earlier.cheap_calls,
            standard_calls: self.standard_calls - earlier.standard_calls,
            premium_calls: self.premium_calls - earlier.premium_calls,
            retries: self.retries - earlier.retries,
            reprompts: self.reprompts - earlier.reprompts,
            fallbacks: self.fallbacks - earlier.fallbacks,
            exact_hits: self.exact_hits - earlier.exact_hits,
            similar_hits: self.similar_hits - earlier.similar_hits,
            misses: self.misses - earlier.misses,
        }
    }
}

impl fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "oracle calls: cheap={} standard={} premium={} (retries={}, reprompts={}, fallbacks={}); cache: exact={} similar={} misses={}",
            self.cheap_calls,
            self.standard_calls,
            self.premium_calls,
            self.retries,
            self.reprompts,
            self.fallbacks,
            self.exact_hits,
            self.similar_hits,
            self.misses
        )
    }
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, tier: Tier) {
        let counter = match tier {
            Tier::Cheap => &self.cheap_calls,
            Tier::Standard => &self.standard_calls,
            Tier::Premium => &self.premium_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reprompt(&self) {
        self.reprompts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exact_hit(&self) {
        self.exact_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_similar_hit(&self) {
        self.similar_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            cheap_calls: self.cheap_calls.load(Ordering::Relaxed),
            standard_calls: self.standard_calls.load(Ordering::Relaxed),
            premium_calls: self.premium_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reprompts: self.reprompts.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            similar_hits: self.similar_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_calls_per_tier() {
        let usage = UsageCounters::new();
        usage.record_call(Tier::Cheap);
        usage.record_call(Tier::Cheap);
        usage.record_call(Tier::Premium);
        usage.record_exact_hit();
        let snap = usage.snapshot();
        assert_eq!(snap.cheap_calls, 2);
        assert_eq!(snap.premium_calls, 1);
        assert_eq!(snap.remote_calls(), 3);
        assert_eq!(snap.exact_hits, 1);
    }

    #[test]
    fn since_reports_deltas() {
        let usage = UsageCounters::new();
        usage.record_miss();
        let before = usage.snapshot();
        usage.record_miss();
        usage.record_call(Tier::Standard);
        let delta = usage.snapshot().since(&before);
        assert_eq!(delta.misses, 1);
        assert_eq!(delta.standard_calls, 1);
        assert_eq!(delta.cheap_calls, 0);
    }
}
