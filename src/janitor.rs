//! Periodic sweep task: dead registry entries, stale rate-limit windows,
//! expired cache entries, LRU ceiling enforcement (spec §4.J).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::JANITOR_INTERVAL;
use crate::relay::Relay;

/// Runs the sweep every [`JANITOR_INTERVAL`] until `shutdown` is cancelled.
pub async fn run(relay: Arc<Relay>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("janitor stopping");
                return;
            }
            _ = tokio::time::sleep(JANITOR_INTERVAL) => {
                sweep_once(&relay);
            }
        }
    }
}

fn sweep_once(relay: &Relay) {
    let dead_sessions = relay.registry.sweep();
    let dead_rate_windows = relay.rate_limiter.sweep();
    let expired_tokens = relay.token_cache.sweep();
    let expired_aliases = relay.alias_cache.sweep();

    info!(
        dead_sessions,
        dead_rate_windows,
        expired_tokens,
        expired_aliases,
        sessions = relay.registry.len(),
        rate_windows = relay.rate_limiter.len(),
        tokens_cached = relay.token_cache.len(),
        aliases_cached = relay.alias_cache.len(),
        "janitor sweep complete",
    );
}
