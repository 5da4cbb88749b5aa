// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

/// Node-local failed-attempt tracking with temporary lockout.
///
/// Keys are caller-defined (`acct:<email>`, `ip:<addr>`).  After
/// `threshold` consecutive failures the key is locked for `lock_duration`;
/// a success clears the counter.
pub struct LockoutTracker {
    threshold: u32,
    lock_duration: Duration,
    entries: DashMap<String, Entry>,
}

struct Entry {
    failures: u32,
    locked_until: Option<Instant>,
}

impl LockoutTracker {
    pub fn new(threshold: u32, lock_duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            lock_duration,
            entries: DashMap::new(),
        }
    }

    /// Seconds remaining if `key` is currently locked.
    pub fn locked_for(&self, key: &str) -> Option<u64> {
        let entry = self.entries.get(key)?;
        let until = entry.locked_until?;
        let now = Instant::now();
        if until > now {
            Some((until - now).as_secs().max(1))
        } else {
            None
        }
    }

    /// Record a failure; returns `true` when this failure tripped the lock.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            failures: 0,
            locked_until: None,
        });
        // An expired lock resets the window.
        if let Some(until) = entry.locked_until {
            if until <= Instant::now() {
                entry.failures = 0;
                entry.locked_until = None;
            }
        }
        entry.failures += 1;
        if entry.failures >= self.threshold && entry.locked_until.is_none() {
            entry.locked_until = Some(Instant::now() + self.lock_duration);
            warn!(key, failures = entry.failures, "lockout engaged");
            return true;
        }
        false
    }

    pub fn record_success(&self, key: &str) {
        self.entries.remove(key);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: u32) -> LockoutTracker {
        LockoutTracker::new(threshold, Duration::from_secs(60))
    }

    #[test]
    fn locks_after_threshold_failures() {
        let t = tracker(3);
        assert!(!t.record_failure("acct:a"));
        assert!(!t.record_failure("acct:a"));
        assert!(t.record_failure("acct:a"));
        assert!(t.locked_for("acct:a").is_some());
    }

    #[test]
    fn success_resets_the_counter() {
        let t = tracker(3);
        t.record_failure("acct:a");
        t.record_failure("acct:a");
        t.record_success("acct:a");
        assert!(!t.record_failure("acct:a"));
        assert!(t.locked_for("acct:a").is_none());
    }

    #[test]
    fn keys_are_independent() {
        let t = tracker(2);
        t.record_failure("acct:a");
        t.record_failure("acct:a");
        assert!(t.locked_for("acct:a").is_some());
        assert!(t.locked_for("acct:b").is_none());
    }

    #[test]
    fn expired_lock_clears() {
        let t = LockoutTracker::new(1, Duration::from_millis(1));
        t.record_failure("acct:a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.locked_for("acct:a").is_none());
        // The next failure starts a fresh window rather than compounding.
        t.record_failure("acct:a");
        assert!(t.locked_for("acct:a").is_some());
    }
}
