//! Process-wide counters. Observability only, nothing here feeds back into
//! control flow.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Stats {
    events: AtomicU64,
    active: AtomicU64,
    duplicates: AtomicU64,
    direct_attempts: AtomicU64,
    direct_skips: AtomicU64,
    swarm_attempts: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
    successes: AtomicU64,
    direct_successes: AtomicU64,
    swarm_successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub events: u64,
    pub active: u64,
    pub duplicates: u64,
    pub direct_attempts: u64,
    pub direct_skips: u64,
    pub swarm_attempts: u64,
    pub coalesced: u64,
    pub rejected: u64,
    pub successes: u64,
    pub direct_successes: u64,
    pub swarm_successes: u64,
    pub failures: u64,
}

impl Stats {
    pub fn event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn begin(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direct_attempt(&self) {
        self.direct_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn direct_skip(&self) {
        self.direct_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swarm_attempt(&self) {
        self.swarm_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn coalesce(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reject(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success(&self, strategy: &str) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if strategy == "direct" {
            self.direct_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.swarm_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            direct_attempts: self.direct_attempts.load(Ordering::Relaxed),
            direct_skips: self.direct_skips.load(Ordering::Relaxed),
            swarm_attempts: self.swarm_attempts.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            direct_successes: self.direct_successes.load(Ordering::Relaxed),
            swarm_successes: self.swarm_successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
