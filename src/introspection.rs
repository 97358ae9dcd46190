//! `/health`, `/internal/connected-tokens`, `/internal/traffic-stats`
//! (spec §4.H). All are gated uniformly by the shared internal secret —
//! the spec calls this "the safer default" when a load balancer path is
//! not distinguished from the internal ones.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::config::INTERNAL_SECRET_HEADER;
use crate::relay::Relay;

const HEALTH_PATH: &str = "/health";
const CONNECTED_TOKENS_PATH: &str = "/internal/connected-tokens";
const TRAFFIC_STATS_PATH: &str = "/internal/traffic-stats";

pub fn is_introspection_path(path: &str) -> bool {
    matches!(path, HEALTH_PATH | CONNECTED_TOKENS_PATH | TRAFFIC_STATS_PATH)
}

fn secret_matches(relay: &Relay, req: &Request) -> bool {
    if relay.config.internal_secret.is_empty() {
        return false;
    }
    let provided = req
        .headers()
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let matches: bool =
        provided.as_bytes().ct_eq(relay.config.internal_secret.expose().as_bytes()).into();
    matches
}

pub async fn handle(relay: Arc<Relay>, req: Request) -> Response {
    if !secret_matches(&relay, &req) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    match req.uri().path() {
        HEALTH_PATH => health(&relay).into_response(),
        CONNECTED_TOKENS_PATH => connected_tokens(&relay).into_response(),
        TRAFFIC_STATS_PATH => traffic_stats(&relay).into_response(),
        _ => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn health(relay: &Relay) -> Json<serde_json::Value> {
    let counters = relay.counters.snapshot();
    Json(json!({
        "uptimeSeconds": relay.stats.uptime_seconds(),
        "requests": counters.requests,
        "errors": counters.errors,
        "rateLimited": counters.rate_limited,
        "invalidTokens": counters.invalid_tokens,
        "activeConnections": relay.registry.len(),
        "pendingRequests": relay.pending.len(),
    }))
}

#[derive(Serialize)]
struct TunnelSummary {
    token: String,
    #[serde(rename = "clientIp")]
    client_ip: String,
    #[serde(rename = "targetPort")]
    target_port: u16,
    #[serde(rename = "connectedAt")]
    connected_at_unix: u64,
}

fn connected_tokens(relay: &Relay) -> Json<serde_json::Value> {
    relay.registry.sweep();

    let mut tokens = Vec::new();
    let mut tunnels = Vec::new();
    let now_unix = unix_now();
    for (token, session) in relay.registry.iter_tokens() {
        tokens.push(token.clone());
        tunnels.push(TunnelSummary {
            token,
            client_ip: session.remote_addr.ip().to_string(),
            target_port: session.target_port,
            connected_at_unix: now_unix.saturating_sub(session.connected_at.elapsed().as_secs()),
        });
    }

    Json(json!({ "tokens": tokens, "tunnels": tunnels }))
}

fn traffic_stats(relay: &Relay) -> Json<serde_json::Value> {
    let by_token: Vec<serde_json::Value> = relay
        .stats
        .by_token
        .iter()
        .map(|e| json!({ "token": e.key(), "counter": e.value().clone() }))
        .collect();
    let by_alias: Vec<serde_json::Value> = relay
        .stats
        .by_alias
        .iter()
        .map(|e| json!({ "alias": e.key(), "counter": e.value().clone() }))
        .collect();

    Json(json!({
        "relayRunId": format!("{:032x}", relay.stats.relay_run_id),
        "since": relay.stats.since_unix,
        "timestamp": unix_now(),
        "totals": {
            "tokensTracked": relay.stats.by_token.len(),
            "aliasesTracked": relay.stats.by_alias.len(),
            "connected": relay.registry.len(),
            "pending": relay.pending.len(),
        },
        "byToken": by_token,
        "byAlias": by_alias,
    }))
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_the_three_introspection_paths() {
        assert!(is_introspection_path("/health"));
        assert!(is_introspection_path("/internal/connected-tokens"));
        assert!(is_introspection_path("/internal/traffic-stats"));
        assert!(!is_introspection_path("/ping"));
    }
}
