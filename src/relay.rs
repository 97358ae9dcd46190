//! The single shared-state value every task holds a clone of (design note
//! §9: "pass a single 'Relay' value holding all shared state").

use std::sync::Arc;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::control_plane::ControlPlaneClient;
use crate::pending::PendingTable;
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::stats::{new_relay_run_id, GlobalCounters, TrafficStats};

pub struct Relay {
    pub config: Config,
    pub registry: Registry,
    pub pending: Arc<PendingTable>,
    pub rate_limiter: RateLimiter,
    pub token_cache: TtlCache<bool>,
    pub alias_cache: TtlCache<String>,
    pub control_plane: ControlPlaneClient,
    pub stats: TrafficStats,
    pub counters: GlobalCounters,
}

impl Relay {
    pub fn new(config: Config) -> Arc<Self> {
        let rate_limit_requests = config.rate_limit_requests;
        let relay_run_id = new_relay_run_id();
        let control_plane = ControlPlaneClient::new(&config);
        Arc::new(Self {
            config,
            registry: Registry::new(),
            pending: PendingTable::new(),
            rate_limiter: RateLimiter::new(rate_limit_requests),
            token_cache: TtlCache::new(),
            alias_cache: TtlCache::new(),
            control_plane,
            stats: TrafficStats::new(relay_run_id),
            counters: GlobalCounters::default(),
        })
    }

    /// Validates `token` against the identity cache / control plane
    /// (spec §4.C). Validation disabled → every token admitted and cached
    /// valid. Otherwise: fresh cache hit, a successful upstream call, or a
    /// within-grace stale cache hit on upstream failure.
    pub async fn validate_token(&self, token: &str) -> bool {
        if !self.config.validate_tokens {
            self.token_cache.insert(token, true);
            return true;
        }

        if let Some(valid) = self.token_cache.get_fresh(token) {
            return valid;
        }

        let domain = format!("{token}.{}", self.config.tunnel_domain);
        match self.control_plane.allow_tls(&domain).await {
            Some(allow) => {
                self.token_cache.insert(token, allow);
                allow
            }
            None => match self.token_cache.get_within_grace(token) {
                Some(true) => true,
                _ => {
                    self.counters.invalid_tokens.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    false
                }
            },
        }
    }

    /// Resolves `alias` to a token (spec §4.C). No negative caching: a
    /// miss (reserved, unknown, or control-plane failure) always returns
    /// `None` and becomes a 404 at the ingress boundary.
    pub async fn resolve_alias(&self, alias: &str) -> Option<String> {
        if crate::cache::is_reserved_alias(alias) {
            return None;
        }
        if let Some(token) = self.alias_cache.get_fresh(alias) {
            return Some(token);
        }
        let token = self.control_plane.resolve_alias(alias).await?;
        self.alias_cache.insert(alias, token.clone());
        Some(token)
    }
}
