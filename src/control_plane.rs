//! Outbound calls to the control plane (spec §6): token validation and
//! alias resolution. Both are best-effort — callers treat any failure as
//! fail-closed via the identity caches' grace window.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::config::{Config, RedactedString, INTERNAL_SECRET_HEADER};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct AllowTlsResponse {
    allow: bool,
}

#[derive(Deserialize)]
struct ResolveAliasResponse {
    token: Option<String>,
}

pub struct ControlPlaneClient {
    http: reqwest::Client,
    base: String,
    internal_secret: RedactedString,
}

impl ControlPlaneClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base: config.control_plane_base.clone(),
            internal_secret: config.internal_secret.clone(),
        }
    }

    /// `GET /internal/allow-tls?domain=<token>.<tunnel-domain>`.
    /// Returns `None` on any failure (timeout, non-2xx, non-JSON, network
    /// error) so the caller can fall back to cached grace.
    pub async fn allow_tls(&self, domain: &str) -> Option<bool> {
        let url = format!("{}/internal/allow-tls", self.base.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(&[("domain", domain)])
            .header(INTERNAL_SECRET_HEADER, self.internal_secret.expose())
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => resp
                .json::<AllowTlsResponse>()
                .await
                .map(|body| body.allow)
                .map_err(|e| warn!(%domain, error = %e, "allow-tls: non-JSON response"))
                .ok(),
            Ok(resp) => {
                warn!(%domain, status = %resp.status(), "allow-tls: non-2xx response");
                None
            }
            Err(e) => {
                warn!(%domain, error = %e, "allow-tls: request failed");
                None
            }
        }
    }

    /// `GET /internal/resolve-alias?alias=<alias>`. `Ok(None)` means the
    /// control plane explicitly has no token for this alias (a real
    /// negative, not a failure) — per spec §4.C there is no negative
    /// caching, so this becomes a 404 at the call site rather than a
    /// cached miss.
    pub async fn resolve_alias(&self, alias: &str) -> Option<String> {
        let url = format!("{}/internal/resolve-alias", self.base.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(&[("alias", alias)])
            .header(INTERNAL_SECRET_HEADER, self.internal_secret.expose())
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => resp
                .json::<ResolveAliasResponse>()
                .await
                .ok()
                .and_then(|body| body.token),
            Ok(resp) => {
                warn!(%alias, status = %resp.status(), "resolve-alias: non-2xx response");
                None
            }
            Err(e) => {
                warn!(%alias, error = %e, "resolve-alias: request failed");
                None
            }
        }
    }
}
