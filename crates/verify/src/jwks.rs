//! JWKS resolution with caching, allowlist gating, and SSRF-safe fetches.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::VerifyingKey;
use lru::LruCache;
use parking_lot::Mutex;
use peac_fetch::{FetchError, FetchOptions, SafeFetcher};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

/// Well-known location of an issuer's key set, relative to its origin.
const JWKS_PATH: &str = "/.well-known/jwks.json";

/// A key-set document is small; anything bigger is suspect.
const JWKS_MAX_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("issuer host is not allowlisted")]
    IssuerNotAllowed,
    #[error("no key with the requested kid")]
    KeyNotFound,
    #[error("jwks unreachable: {0}")]
    Unreachable(String),
    #[error("invalid jwks document: {0}")]
    InvalidDocument(String),
    #[error("invalid issuer origin: {0}")]
    InvalidIssuer(String),
}

#[derive(Debug, Clone)]
pub struct JwksConfig {
    /// Hosts fetches may target, derived from the issuer allowlist.
    pub allowed_hosts: HashSet<String>,
    /// Skip the host gate entirely (unsafe override).
    pub allow_any_issuer: bool,
    pub ttl: Duration,
    /// How long a failed fetch suppresses retries.
    pub negative_ttl: Duration,
    /// Minimum document age before an unknown `kid` forces a refresh.
    pub kid_miss_min_age: Duration,
    pub fetch_timeout: Duration,
    /// Bound on the number of issuers cached at once.
    pub max_issuers: NonZeroUsize,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: HashSet::new(),
            allow_any_issuer: false,
            ttl: Duration::from_secs(600),
            negative_ttl: Duration::from_secs(30),
            kid_miss_min_age: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
            max_issuers: NonZeroUsize::new(64).expect("nonzero"),
        }
    }
}

/// Resolves `(issuer origin, kid)` to Ed25519 public keys.
///
/// Per-issuer state sits behind an async `RwLock`, so concurrent lookups for
/// the same issuer coalesce on one in-flight fetch while other issuers stay
/// readable.
#[derive(Clone)]
pub struct JwksResolver {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: SafeFetcher,
    cfg: JwksConfig,
    slots: Mutex<LruCache<String, Arc<IssuerSlot>>>,
}

#[derive(Default)]
struct IssuerSlot {
    state: RwLock<IssuerState>,
}

#[derive(Default)]
struct IssuerState {
    keys: HashMap<String, VerifyingKey>,
    fetched_at: Option<Instant>,
    next_refresh_after: Option<Instant>,
    negative_until: Option<Instant>,
}

impl IssuerState {
    fn fresh_key(&self, kid: &str, now: Instant) -> Option<VerifyingKey> {
        if self.next_refresh_after.is_some_and(|t| now < t) {
            return self.keys.get(kid).copied();
        }
        None
    }

    fn negative(&self, now: Instant) -> bool {
        self.negative_until.is_some_and(|t| now < t)
    }
}

impl JwksResolver {
    #[must_use]
    pub fn new(fetcher: SafeFetcher, cfg: JwksConfig) -> Self {
        let max = cfg.max_issuers;
        Self {
            inner: Arc::new(Inner {
                fetcher,
                cfg,
                slots: Mutex::new(LruCache::new(max)),
            }),
        }
    }

    /// Resolve the verification key for `(issuer_origin, kid)`.
    ///
    /// The issuer host is gated against the allowlist before any network
    /// activity. Stale documents refresh lazily; an unknown `kid` on a
    /// recently fetched document returns `KeyNotFound` without refetching.
    pub async fn resolve(&self, issuer_origin: &str, kid: &str) -> Result<VerifyingKey, JwksError> {
        let origin = normalize_origin(issuer_origin)?;
        self.gate_host(&origin)?;

        let slot = {
            let mut slots = self.inner.slots.lock();
            slots
                .get_or_insert(origin.clone(), || Arc::new(IssuerSlot::default()))
                .clone()
        };

        let now = Instant::now();
        {
            let state = slot.state.read().await;
            if let Some(key) = state.fresh_key(kid, now) {
                tracing::debug!(issuer = %origin, kid, outcome = "hit", "jwks lookup");
                return Ok(key);
            }
            if state.negative(now) {
                tracing::debug!(issuer = %origin, kid, outcome = "negative", "jwks lookup");
                return Err(JwksError::Unreachable("negative-cached".into()));
            }
        }

        let mut state = slot.state.write().await;
        let now = Instant::now();
        // Double check under the write lock: another task may have refreshed.
        if let Some(key) = state.fresh_key(kid, now) {
            return Ok(key);
        }
        if state.negative(now) {
            return Err(JwksError::Unreachable("negative-cached".into()));
        }

        let stale = state.next_refresh_after.is_none_or(|t| now >= t);
        if !stale {
            // Document is fresh but lacks the kid. Only a sufficiently old
            // document earns a forced refresh (rotation); otherwise this is
            // a miss, and random kids cannot drive refetch storms.
            let age_ok = state
                .fetched_at
                .is_some_and(|t| now.duration_since(t) >= self.inner.cfg.kid_miss_min_age);
            if !age_ok {
                tracing::debug!(issuer = %origin, kid, outcome = "miss", "jwks lookup");
                return Err(JwksError::KeyNotFound);
            }
        }

        match self.fetch_document(&origin).await {
            Ok(keys) => {
                state.keys = keys;
                state.fetched_at = Some(now);
                state.next_refresh_after = Some(now + self.inner.cfg.ttl);
                state.negative_until = None;
                tracing::debug!(issuer = %origin, kid, outcome = "refreshed", "jwks lookup");
                state.keys.get(kid).copied().ok_or(JwksError::KeyNotFound)
            }
            Err(e) => {
                state.negative_until = Some(now + self.inner.cfg.negative_ttl);
                tracing::warn!(issuer = %origin, error = %e, "jwks fetch failed");
                Err(e)
            }
        }
    }

    fn gate_host(&self, origin: &str) -> Result<(), JwksError> {
        if self.inner.cfg.allow_any_issuer {
            return Ok(());
        }
        let url = Url::parse(origin).map_err(|e| JwksError::InvalidIssuer(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| JwksError::InvalidIssuer("missing host".into()))?;
        if self.inner.cfg.allowed_hosts.contains(&host.to_ascii_lowercase()) {
            Ok(())
        } else {
            Err(JwksError::IssuerNotAllowed)
        }
    }

    async fn fetch_document(&self, origin: &str) -> Result<HashMap<String, VerifyingKey>, JwksError> {
        let url = format!("{origin}{JWKS_PATH}");
        let opts = FetchOptions {
            max_bytes: JWKS_MAX_BYTES,
            timeout: self.inner.cfg.fetch_timeout,
            allow_redirects: false,
            extra_headers: vec![("accept".to_owned(), "application/jwk-set+json".to_owned())],
        };
        let body = self
            .inner
            .fetcher
            .get(&url, &opts)
            .await
            .map_err(|e: FetchError| JwksError::Unreachable(e.to_string()))?;

        let doc: JwksDocument = serde_json::from_slice(&body.bytes)
            .map_err(|e| JwksError::InvalidDocument(e.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in doc.keys {
            let Some(key) = decode_okp_key(&jwk) else {
                continue;
            };
            if let Some(kid) = jwk.kid {
                keys.insert(kid, key);
            }
        }
        if keys.is_empty() {
            return Err(JwksError::InvalidDocument("no usable Ed25519 keys".into()));
        }
        Ok(keys)
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    kid: Option<String>,
    #[serde(rename = "use", default)]
    use_: Option<String>,
    /// Raw public key, base64url.
    #[serde(default)]
    x: Option<String>,
}

fn decode_okp_key(jwk: &Jwk) -> Option<VerifyingKey> {
    if jwk.kty != "OKP" || jwk.crv.as_deref() != Some("Ed25519") {
        return None;
    }
    if let Some(use_) = &jwk.use_
        && use_ != "sig"
    {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(jwk.x.as_deref()?).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn normalize_origin(issuer: &str) -> Result<String, JwksError> {
    let url = Url::parse(issuer).map_err(|e| JwksError::InvalidIssuer(e.to_string()))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(JwksError::InvalidIssuer("opaque origin".into()));
    }
    Ok(origin.ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use ed25519_dalek::SigningKey;
    use peac_fetch::FetchPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn jwk_json(kid: &str, key: &SigningKey) -> serde_json::Value {
        serde_json::json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
        })
    }

    async fn spawn_jwks(
        doc: serde_json::Value,
    ) -> (String, Arc<AtomicUsize>, tokio::sync::oneshot::Sender<()>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_handler = hits.clone();
        let app = Router::new().route(
            "/.well-known/jwks.json",
            get(move || {
                let hits = hits_for_handler.clone();
                let doc = doc.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(doc)
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = rx.await;
        });
        tokio::spawn(async move {
            let _ = server.await;
        });
        (format!("http://{addr}"), hits, tx)
    }

    fn resolver_for(origin: &str, cfg: JwksConfig) -> JwksResolver {
        let host = Url::parse(origin)
            .expect("origin")
            .host_str()
            .expect("host")
            .to_owned();
        let cfg = JwksConfig {
            allowed_hosts: [host].into_iter().collect(),
            ..cfg
        };
        JwksResolver::new(SafeFetcher::new(FetchPolicy::insecure()), cfg)
    }

    #[tokio::test]
    async fn refuses_unlisted_hosts_before_any_fetch() {
        let resolver = JwksResolver::new(
            SafeFetcher::new(FetchPolicy::strict()),
            JwksConfig {
                allowed_hosts: ["issuer.example".to_owned()].into_iter().collect(),
                ..JwksConfig::default()
            },
        );
        let err = resolver
            .resolve("https://evil.example.com", "k1")
            .await
            .unwrap_err();
        assert!(matches!(err, JwksError::IssuerNotAllowed));
    }

    #[tokio::test]
    async fn caches_document_across_lookups() {
        let key = test_key(1);
        let doc = serde_json::json!({ "keys": [jwk_json("k1", &key)] });
        let (origin, hits, _shutdown) = spawn_jwks(doc).await;

        let resolver = resolver_for(&origin, JwksConfig::default());
        let first = resolver.resolve(&origin, "k1").await.expect("resolve");
        let second = resolver.resolve(&origin, "k1").await.expect("resolve");
        assert_eq!(first.as_bytes(), key.verifying_key().as_bytes());
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_document_kid_miss_does_not_refetch() {
        let key = test_key(2);
        let doc = serde_json::json!({ "keys": [jwk_json("k1", &key)] });
        let (origin, hits, _shutdown) = spawn_jwks(doc).await;

        let resolver = resolver_for(&origin, JwksConfig::default());
        resolver.resolve(&origin, "k1").await.expect("warm cache");
        let err = resolver.resolve(&origin, "missing").await.unwrap_err();
        assert!(matches!(err, JwksError::KeyNotFound));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn kid_miss_on_aged_document_forces_one_refresh() {
        let key = test_key(3);
        let doc = serde_json::json!({ "keys": [jwk_json("k1", &key)] });
        let (origin, hits, _shutdown) = spawn_jwks(doc).await;

        let resolver = resolver_for(
            &origin,
            JwksConfig {
                kid_miss_min_age: Duration::from_millis(0),
                ..JwksConfig::default()
            },
        );
        resolver.resolve(&origin, "k1").await.expect("warm cache");
        let err = resolver.resolve(&origin, "missing").await.unwrap_err();
        assert!(matches!(err, JwksError::KeyNotFound));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_negative_cached() {
        let resolver = resolver_for("http://127.0.0.1:1", JwksConfig::default());
        let err = resolver.resolve("http://127.0.0.1:1", "k1").await.unwrap_err();
        assert!(matches!(err, JwksError::Unreachable(_)));
        // Second call must fail fast from the negative cache.
        let err = resolver.resolve("http://127.0.0.1:1", "k1").await.unwrap_err();
        assert!(matches!(err, JwksError::Unreachable(msg) if msg.contains("negative")));
    }

    #[tokio::test]
    async fn skips_non_okp_keys() {
        let key = test_key(4);
        let doc = serde_json::json!({
            "keys": [
                { "kty": "RSA", "kid": "rsa1", "n": "AQAB", "e": "AQAB" },
                jwk_json("k1", &key),
            ]
        });
        let (origin, _hits, _shutdown) = spawn_jwks(doc).await;

        let resolver = resolver_for(&origin, JwksConfig::default());
        resolver.resolve(&origin, "k1").await.expect("ed25519 key found");
        let err = resolver.resolve(&origin, "rsa1").await.unwrap_err();
        assert!(matches!(err, JwksError::KeyNotFound));
    }
}
