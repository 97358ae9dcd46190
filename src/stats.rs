//! Traffic counters and process-wide run identity (spec §3, §4.I).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

/// Mints a fresh 128-bit relay run id from two independent random draws.
pub fn new_relay_run_id() -> u128 {
    let hi: u64 = rand::random();
    let lo: u64 = rand::random();
    ((hi as u128) << 64) | lo as u128
}

/// Generates a fresh 128-bit request id. Collision probability is
/// negligible over the relay's lifetime (spec §3).
pub fn new_request_id() -> String {
    format!("{:032x}", new_relay_run_id())
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct Counter {
    pub requests: u64,
    pub responses: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    #[serde(rename = "lastSeen")]
    pub last_seen_unix: u64,
    #[serde(rename = "lastStatus")]
    pub last_status: Option<u16>,
}

/// Process-wide counters used by `/health` (requests, errors, rate-limited,
/// invalid tokens, active connections, pending requests).
#[derive(Default)]
pub struct GlobalCounters {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub rate_limited: AtomicU64,
    pub invalid_tokens: AtomicU64,
}

impl GlobalCounters {
    pub fn snapshot(&self) -> GlobalCountersSnapshot {
        GlobalCountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            invalid_tokens: self.invalid_tokens.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
pub struct GlobalCountersSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub invalid_tokens: u64,
}

/// Per-token and per-alias traffic counters (spec §4.I).
pub struct TrafficStats {
    pub relay_run_id: u128,
    pub started_at: Instant,
    pub since_unix: u64,
    pub by_token: DashMap<String, Counter>,
    pub by_alias: DashMap<String, Counter>,
}

impl TrafficStats {
    pub fn new(relay_run_id: u128) -> Self {
        Self {
            relay_run_id,
            started_at: Instant::now(),
            since_unix: unix_now(),
            by_token: DashMap::new(),
            by_alias: DashMap::new(),
        }
    }

    pub fn record_request(&self, token: &str, alias: Option<&str>, body_len: usize) {
        record_request(&self.by_token, token, body_len);
        if let Some(alias) = alias {
            record_request(&self.by_alias, alias, body_len);
        }
    }

    pub fn record_response(&self, token: &str, alias: Option<&str>, status: u16, body_len: usize) {
        record_response(&self.by_token, token, status, body_len);
        if let Some(alias) = alias {
            record_response(&self.by_alias, alias, status, body_len);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn record_request(map: &DashMap<String, Counter>, key: &str, body_len: usize) {
    let mut entry = map.entry(key.to_string()).or_default();
    entry.requests += 1;
    entry.bytes_in += body_len as u64;
    entry.last_seen_unix = unix_now();
}

fn record_response(map: &DashMap<String, Counter>, key: &str, status: u16, body_len: usize) {
    let mut entry = map.entry(key.to_string()).or_default();
    entry.responses += 1;
    entry.bytes_out += body_len as u64;
    entry.last_seen_unix = unix_now();
    entry.last_status = Some(status);
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
