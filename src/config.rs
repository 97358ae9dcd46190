use std::time::Duration;

use crate::error::{RelayError, Result};

/// Header carrying the shared internal secret, both inbound (gating the
/// introspection endpoints) and outbound (calls to the control plane).
pub const INTERNAL_SECRET_HEADER: &str = "x-relay-internal-secret";

/// Wraps a secret value so an accidental `{:?}` on `Config` (or anything
/// holding one) never prints it. `expose()` is the only way back to the
/// raw string, used only at the point of comparison or outbound use.
#[derive(Clone)]
pub struct RedactedString(String);

impl RedactedString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// TTL for token-validity and alias-resolution cache entries.
pub const CACHE_TTL: Duration = Duration::from_secs(60);
/// Stale-grace multiplier applied to `CACHE_TTL` on upstream failure.
pub const CACHE_GRACE_MULTIPLIER: u32 = 5;
/// Ceiling on entries per identity cache before LRU eviction kicks in.
pub const MAX_CACHE_SIZE: usize = 10_000;
/// Sliding window width for the rate limiter.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// Per-pending-request deadline.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);
/// Janitor sweep interval.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    /// `TUNNEL_RELAY_HTTP` — public ingress port.
    pub http_port: u16,
    /// `TUNNEL_RELAY_HTTP_HOST` — ingress bind address.
    pub http_host: String,
    /// `TUNNEL_RELAY_CTRL` — control-channel port.
    pub ctrl_port: u16,
    /// `TUNNEL_DOMAIN` — token-subdomain suffix, e.g. `x.example`.
    pub tunnel_domain: String,
    /// `ALIAS_DOMAIN` — alias-subdomain suffix, e.g. `example`.
    pub alias_domain: String,
    /// `TUNNEL_VALIDATE_TOKENS` — whether tokens are validated against
    /// the control plane at all.
    pub validate_tokens: bool,
    /// `AGENTCLOUD_API_BASE` — control-plane origin for validation and
    /// alias-resolution calls.
    pub control_plane_base: String,
    /// `TUNNEL_RATE_LIMIT_REQUESTS` — requests per minute per identity.
    pub rate_limit_requests: usize,
    /// `TUNNEL_MAX_REQUEST_SIZE` — max body / frame size in bytes.
    pub max_request_size: usize,
    /// `RELAY_INTERNAL_SECRET` — shared secret gating introspection and
    /// tagging outbound control-plane calls.
    pub internal_secret: RedactedString,
    /// Control-channel TLS settings, present only when `TUNNEL_CTRL_TLS=true`.
    pub ctrl_tls: Option<CtrlTlsConfig>,
}

#[derive(Debug, Clone)]
pub struct CtrlTlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: Option<String>,
    pub insecure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            http_host: "127.0.0.1".to_string(),
            ctrl_port: 7071,
            tunnel_domain: "tunnel.example.com".to_string(),
            alias_domain: "example.com".to_string(),
            validate_tokens: false,
            control_plane_base: String::new(),
            rate_limit_requests: 1000,
            max_request_size: 10 * 1024 * 1024,
            internal_secret: RedactedString::new(String::new()),
            ctrl_tls: None,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| RelayError::Config(format!("{key} is not valid"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the environment, falling back to the
    /// defaults in spec.md §6 for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let ctrl_tls = if env_bool("TUNNEL_CTRL_TLS", false) {
            let cert_path = std::env::var("TUNNEL_CTRL_CERT")
                .map_err(|_| RelayError::Config("TUNNEL_CTRL_CERT required when TUNNEL_CTRL_TLS is set".into()))?;
            let key_path = std::env::var("TUNNEL_CTRL_KEY")
                .map_err(|_| RelayError::Config("TUNNEL_CTRL_KEY required when TUNNEL_CTRL_TLS is set".into()))?;
            Some(CtrlTlsConfig {
                cert_path,
                key_path,
                ca_path: std::env::var("TUNNEL_CTRL_CA").ok(),
                insecure: env_bool("TUNNEL_CTRL_TLS_INSECURE", false),
            })
        } else {
            None
        };

        let config = Self {
            http_port: env_parse("TUNNEL_RELAY_HTTP", defaults.http_port)?,
            http_host: std::env::var("TUNNEL_RELAY_HTTP_HOST").unwrap_or(defaults.http_host),
            ctrl_port: env_parse("TUNNEL_RELAY_CTRL", defaults.ctrl_port)?,
            tunnel_domain: std::env::var("TUNNEL_DOMAIN").unwrap_or(defaults.tunnel_domain),
            alias_domain: std::env::var("ALIAS_DOMAIN").unwrap_or(defaults.alias_domain),
            validate_tokens: env_bool("TUNNEL_VALIDATE_TOKENS", defaults.validate_tokens),
            control_plane_base: std::env::var("AGENTCLOUD_API_BASE").unwrap_or_default(),
            rate_limit_requests: env_parse("TUNNEL_RATE_LIMIT_REQUESTS", defaults.rate_limit_requests)?,
            max_request_size: env_parse("TUNNEL_MAX_REQUEST_SIZE", defaults.max_request_size)?,
            internal_secret: RedactedString::new(std::env::var("RELAY_INTERNAL_SECRET").unwrap_or_default()),
            ctrl_tls,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.validate_tokens && self.control_plane_base.is_empty() {
            return Err(RelayError::Config(
                "AGENTCLOUD_API_BASE is required when TUNNEL_VALIDATE_TOKENS is set".into(),
            ));
        }
        if self.rate_limit_requests == 0 {
            return Err(RelayError::Config("TUNNEL_RATE_LIMIT_REQUESTS must be > 0".into()));
        }
        if self.max_request_size == 0 {
            return Err(RelayError::Config("TUNNEL_MAX_REQUEST_SIZE must be > 0".into()));
        }
        Ok(())
    }
}
