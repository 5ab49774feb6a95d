//! Environment-driven gateway configuration.

use anyhow::Context as _;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Signed requests required; receipts accepted when presented.
    TapOnly,
    /// Either a verified receipt or a verified signed request satisfies the gate.
    ReceiptOrTap,
}

#[derive(Debug, Clone, Copy)]
pub struct RateTier {
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// When set, verified requests are proxied here; otherwise the gateway
    /// answers with a verification summary itself.
    pub upstream_url: Option<Url>,
    pub mode: GateMode,
    /// Normalized HTTPS origins allowed as issuers.
    pub issuer_allowlist: Vec<String>,
    pub bypass_paths: Vec<String>,
    pub max_clock_skew: Duration,
    pub max_tap_window: Duration,
    pub jwks_ttl: Duration,
    pub pointer_max_bytes: usize,
    pub fetch_timeout: Duration,
    pub rate_limit_anon: RateTier,
    pub rate_limit_keyed: RateTier,
    /// Header carrying the client API key (canonical lowercase).
    pub api_key_header: String,
    pub known_tags: HashSet<String>,
    pub unsafe_allow_any_issuer: bool,
    pub unsafe_allow_unknown_tags: bool,
    pub unsafe_allow_no_replay: bool,
    /// Permit plain-HTTP / private-address JWKS and pointer origins.
    /// Local development only.
    pub unsafe_allow_insecure_fetch: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8402)),
            upstream_url: None,
            mode: GateMode::TapOnly,
            issuer_allowlist: Vec::new(),
            bypass_paths: Vec::new(),
            max_clock_skew: Duration::from_secs(300),
            max_tap_window: Duration::from_secs(480),
            jwks_ttl: Duration::from_secs(600),
            pointer_max_bytes: 65_536,
            fetch_timeout: Duration::from_millis(5_000),
            rate_limit_anon: RateTier {
                limit: 100,
                window: Duration::from_secs(60),
            },
            rate_limit_keyed: RateTier {
                limit: 1_000,
                window: Duration::from_secs(60),
            },
            api_key_header: "x-api-key".to_owned(),
            known_tags: HashSet::new(),
            unsafe_allow_any_issuer: false,
            unsafe_allow_unknown_tags: false,
            unsafe_allow_no_replay: false,
            unsafe_allow_insecure_fetch: false,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self::from_lookup(&|key| std::env::var(key).ok())?;
        cfg.warn_on_unsafe_overrides();
        Ok(cfg)
    }

    /// Load from an arbitrary variable source (tests inject closures).
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        cfg.unsafe_allow_any_issuer = flag(lookup, "UNSAFE_ALLOW_ANY_ISSUER");
        cfg.unsafe_allow_unknown_tags = flag(lookup, "UNSAFE_ALLOW_UNKNOWN_TAGS");
        cfg.unsafe_allow_no_replay = flag(lookup, "UNSAFE_ALLOW_NO_REPLAY");
        cfg.unsafe_allow_insecure_fetch = flag(lookup, "UNSAFE_ALLOW_INSECURE_FETCH");

        if let Some(value) = non_empty(lookup, "LISTEN_ADDR") {
            cfg.listen_addr = value
                .parse()
                .with_context(|| format!("LISTEN_ADDR {value:?} is not a socket address"))?;
        }
        if let Some(value) = non_empty(lookup, "UPSTREAM_URL") {
            cfg.upstream_url = Some(
                Url::parse(&value)
                    .with_context(|| format!("UPSTREAM_URL {value:?} is not a URL"))?,
            );
        }
        if let Some(value) = non_empty(lookup, "MODE") {
            cfg.mode = match value.as_str() {
                "tap_only" => GateMode::TapOnly,
                "receipt_or_tap" => GateMode::ReceiptOrTap,
                other => anyhow::bail!("MODE must be tap_only or receipt_or_tap, got {other:?}"),
            };
        }

        for origin in csv(lookup, "ISSUER_ALLOWLIST") {
            cfg.issuer_allowlist
                .push(normalize_origin(&origin, cfg.unsafe_allow_insecure_fetch)?);
        }
        cfg.bypass_paths = csv(lookup, "BYPASS_PATHS");

        if let Some(secs) = parse_var::<u64>(lookup, "MAX_CLOCK_SKEW_SECONDS")? {
            cfg.max_clock_skew = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(lookup, "MAX_TAP_WINDOW_SECONDS")? {
            cfg.max_tap_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(lookup, "JWKS_TTL_SECONDS")? {
            cfg.jwks_ttl = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<usize>(lookup, "POINTER_MAX_BYTES")? {
            cfg.pointer_max_bytes = bytes;
        }
        if let Some(ms) = parse_var::<u64>(lookup, "FETCH_TIMEOUT_MS")? {
            cfg.fetch_timeout = Duration::from_millis(ms);
        }

        if let Some(value) = non_empty(lookup, "RATE_LIMIT_ANON") {
            cfg.rate_limit_anon = parse_rate_tier(&value).context("RATE_LIMIT_ANON")?;
        }
        if let Some(value) = non_empty(lookup, "RATE_LIMIT_KEYED") {
            cfg.rate_limit_keyed = parse_rate_tier(&value).context("RATE_LIMIT_KEYED")?;
        }

        if let Some(value) = non_empty(lookup, "API_KEY_HEADER") {
            cfg.api_key_header = value.to_ascii_lowercase();
        }
        cfg.known_tags = csv(lookup, "KNOWN_TAGS").into_iter().collect();

        Ok(cfg)
    }

    /// Hosts the JWKS resolver may contact, derived from the allowlist.
    #[must_use]
    pub fn allowed_hosts(&self) -> HashSet<String> {
        self.issuer_allowlist
            .iter()
            .filter_map(|origin| {
                Url::parse(origin)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            })
            .collect()
    }

    pub fn warn_on_unsafe_overrides(&self) {
        if self.unsafe_allow_any_issuer {
            tracing::warn!("UNSAFE_ALLOW_ANY_ISSUER is set: issuer allowlist checks are DISABLED");
        }
        if self.unsafe_allow_unknown_tags {
            tracing::warn!("UNSAFE_ALLOW_UNKNOWN_TAGS is set: unknown signature tags are accepted");
        }
        if self.unsafe_allow_no_replay {
            tracing::warn!(
                "UNSAFE_ALLOW_NO_REPLAY is set: nonce-bearing proofs are accepted without replay protection"
            );
        }
        if self.unsafe_allow_insecure_fetch {
            tracing::warn!(
                "UNSAFE_ALLOW_INSECURE_FETCH is set: plain-HTTP and private-address fetches are allowed"
            );
        }
    }
}

fn flag(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> bool {
    matches!(
        lookup(name).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn csv(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Vec<String> {
    lookup(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_var<T: std::str::FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    non_empty(lookup, name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("{name} {value:?} is invalid"))
        })
        .transpose()
}

/// `<limit>/<window_seconds>`, e.g. `100/60`.
fn parse_rate_tier(value: &str) -> anyhow::Result<RateTier> {
    let (limit, window) = value
        .split_once('/')
        .with_context(|| format!("{value:?} is not <limit>/<window_seconds>"))?;
    let limit: u32 = limit.trim().parse().context("limit")?;
    let window_secs: u64 = window.trim().parse().context("window seconds")?;
    anyhow::ensure!(limit > 0 && window_secs > 0, "limit and window must be positive");
    Ok(RateTier {
        limit,
        window: Duration::from_secs(window_secs),
    })
}

fn normalize_origin(origin: &str, allow_insecure: bool) -> anyhow::Result<String> {
    let url = Url::parse(origin).with_context(|| format!("issuer origin {origin:?}"))?;
    if url.scheme() != "https" && !(allow_insecure && url.scheme() == "http") {
        anyhow::bail!("issuer origin {origin:?} must be https");
    }
    let parsed = url.origin();
    anyhow::ensure!(parsed.is_tuple(), "issuer origin {origin:?} is opaque");
    Ok(parsed.ascii_serialization())
}
