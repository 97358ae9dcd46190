//! Per-identity sliding-window rate limiter (spec §4.B).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RATE_LIMIT_WINDOW;

/// Sliding window of recent admission timestamps for one identity.
struct Window {
    timestamps: VecDeque<Instant>,
}

pub struct RateLimiter {
    windows: DashMap<String, Window>,
    cap: usize,
}

impl RateLimiter {
    pub fn new(cap: usize) -> Self {
        Self { windows: DashMap::new(), cap }
    }

    /// Drops timestamps older than the window, then admits `identity` if
    /// fewer than `cap` remain, recording `now` on admission.
    pub fn admit(&self, identity: &str) -> bool {
        self.admit_at(identity, Instant::now())
    }

    fn admit_at(&self, identity: &str, now: Instant) -> bool {
        let mut entry = self.windows.entry(identity.to_string()).or_insert_with(|| Window {
            timestamps: VecDeque::new(),
        });
        prune(&mut entry.timestamps, now);
        if entry.timestamps.len() >= self.cap {
            return false;
        }
        entry.timestamps.push_back(now);
        true
    }

    /// Removes windows that are empty after pruning, and prunes the rest.
    /// Returns the number of records removed. Used by the janitor (§4.J).
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.windows.retain(|_, window| {
            prune(&mut window.timestamps, now);
            let keep = !window.timestamps.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&front) = timestamps.front() {
        if now.duration_since(front) > RATE_LIMIT_WINDOW {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_cap_then_denies() {
        let limiter = RateLimiter::new(3);
        let now = Instant::now();
        assert!(limiter.admit_at("tok", now));
        assert!(limiter.admit_at("tok", now));
        assert!(limiter.admit_at("tok", now));
        assert!(!limiter.admit_at("tok", now));
    }

    #[test]
    fn separate_identities_have_separate_windows() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.admit_at("a", now));
        assert!(limiter.admit_at("b", now));
        assert!(!limiter.admit_at("a", now));
    }

    #[test]
    fn old_timestamps_are_pruned_before_the_cap_check() {
        let limiter = RateLimiter::new(1);
        let t0 = Instant::now();
        assert!(limiter.admit_at("tok", t0));
        let later = t0 + Duration::from_secs(61);
        assert!(limiter.admit_at("tok", later));
    }

    #[test]
    fn sweep_drops_empty_windows() {
        let limiter = RateLimiter::new(10);
        let t0 = Instant::now();
        limiter.admit_at("tok", t0);
        assert_eq!(limiter.len(), 1);
        // Simulate time passing past the window by pruning with a later "now".
        {
            let mut entry = limiter.windows.get_mut("tok").unwrap();
            prune(&mut entry.timestamps, t0 + Duration::from_secs(120));
        }
        let removed = limiter.sweep();
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 0);
    }
}
