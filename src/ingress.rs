//! Public HTTP ingress: host-based identity resolution, admission, and
//! request/response relaying over a client's control channel (spec §4.F).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::cache::is_valid_token_format;
use crate::config::PENDING_TIMEOUT;
use crate::introspection;
use crate::relay::Relay;
use crate::stats::new_request_id;
use crate::wire::{redact_for_logging, Frame};

enum Identity {
    Token(String),
    Alias { alias: String, token: String },
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

fn suffix_label(host: &str, domain: &str) -> Option<String> {
    let suffix = format!(".{domain}");
    host.strip_suffix(&suffix).map(|label| label.to_string())
}

async fn resolve_identity(relay: &Relay, host: &str) -> Option<Identity> {
    if let Some(token) = suffix_label(host, &relay.config.tunnel_domain) {
        if !is_valid_token_format(&token) {
            return None;
        }
        return Some(Identity::Token(token));
    }

    if let Some(alias) = suffix_label(host, &relay.config.alias_domain) {
        if crate::cache::is_reserved_alias(&alias) {
            return None;
        }
        let token = relay.resolve_alias(&alias).await?;
        return Some(Identity::Alias { alias, token });
    }

    None
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), v.to_string());
        }
    }
    map
}

/// Top-level fallback handler: introspection endpoints are distinguished
/// by path + a Host that does not match the tunnel/alias domain; anything
/// else is public tunnel traffic.
pub async fn handler(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    relay.counters.requests.fetch_add(1, Ordering::Relaxed);

    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let host = strip_port(&host).to_string();

    let is_tunnel_host =
        host.ends_with(&format!(".{}", relay.config.tunnel_domain)) || host == relay.config.tunnel_domain;
    let is_alias_host =
        host.ends_with(&format!(".{}", relay.config.alias_domain)) || host == relay.config.alias_domain;

    if introspection::is_introspection_path(req.uri().path()) && !is_tunnel_host && !is_alias_host {
        return introspection::handle(relay, req).await;
    }

    serve_tunnel_request(relay, addr, host, req).await
}

async fn serve_tunnel_request(relay: Arc<Relay>, addr: SocketAddr, host: String, req: Request) -> Response {
    let identity = match resolve_identity(&relay, &host).await {
        Some(identity) => identity,
        None => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };

    let (token, alias) = match &identity {
        Identity::Token(token) => (token.clone(), None),
        Identity::Alias { alias, token } => (token.clone(), Some(alias.clone())),
    };

    if !relay.validate_token(&token).await {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    if !relay.rate_limiter.admit(&token) {
        relay.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", "60")],
            "rate limit exceeded",
        )
            .into_response();
    }

    let session = match relay.registry.lookup(&token) {
        Some(session) if session.is_alive() => session,
        _ => return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response(),
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let headers = headers_to_map(req.headers());

    let max_size = relay.config.max_request_size;
    let body = match axum::body::to_bytes(req.into_body(), max_size + 1).await {
        Ok(bytes) if bytes.len() > max_size => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request too large").into_response()
        }
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request too large").into_response(),
    };

    let request_id = new_request_id();
    tracing::debug!(
        token = %token,
        request_id = %request_id,
        method = %method,
        path = %path,
        headers = ?redact_for_logging(&headers),
        "dispatching request to client",
    );
    let frame = Frame::request(&request_id, &method, &path, headers, &body);

    if let Err(e) = session.send(&frame).await {
        tracing::warn!(token = %token, %addr, error = %e, "failed to dispatch request to client");
        return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response();
    }

    let owner = crate::pending::Owner { token: token.clone(), alias: alias.clone() };
    let (rx, _guard) = relay.pending.allocate(request_id, owner, PENDING_TIMEOUT);

    relay.stats.record_request(&token, alias.as_deref(), body.len());

    match rx.await {
        Ok(resp) => {
            if resp.status >= 500 {
                relay.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            build_response(resp)
        }
        Err(_) => {
            // Sender dropped without a send: should not happen in
            // practice (timeout always sends a synthesized 504), but
            // fail safe rather than hang the caller.
            (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
        }
    }
}

fn build_response(resp: crate::pending::ServedResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &resp.headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            axum::http::HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|_| {
        (StatusCode::BAD_GATEWAY, "malformed response from client").into_response()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_removes_trailing_port() {
        assert_eq!(strip_port("abc12345.x.example:8443"), "abc12345.x.example");
        assert_eq!(strip_port("abc12345.x.example"), "abc12345.x.example");
    }

    #[test]
    fn suffix_label_extracts_the_leftmost_label() {
        assert_eq!(suffix_label("abc12345.x.example", "x.example"), Some("abc12345".to_string()));
        assert_eq!(suffix_label("hello.example.com", "example.com"), Some("hello".to_string()));
        assert_eq!(suffix_label("unrelated.com", "example.com"), None);
    }
}
