//! The decision engine: composes transport detection, verification, replay,
//! and rate limiting under the configured mode. Fail-closed throughout.

use crate::bypass::BypassMatcher;
use crate::config::{GateMode, GatewayConfig};
use crate::rate_limit::{ClientKey, RateLimitDecision, RateLimiter};
use peac_fetch::{FetchPolicy, SafeFetcher};
use peac_verify::httpsig::{
    RequestParts, RequestSignatureVerifier, RequestVerifyOptions, SIGNATURE_HEADER,
    SIGNATURE_INPUT_HEADER,
};
use peac_verify::jwks::{JwksConfig, JwksResolver};
use peac_verify::pointer::fetch_pointer;
use peac_verify::problem::VerifyCode;
use peac_verify::receipt::{ReceiptVerifier, ReceiptVerifyOptions};
use peac_verify::replay::{InMemoryReplayStore, ReplayStore};
use peac_verify::transport::{self, ReceiptTransport};
use serde_json::Value;
use std::collections::HashSet;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

const REPLAY_CAPACITY: usize = 8192;

/// Everything the engine needs to know about one request.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub query: Option<String>,
    /// As-received (name, value) pairs.
    pub headers: Vec<(String, String)>,
    /// Decoded JSON body, when the request carried one.
    pub body_json: Option<Value>,
    pub client_ip: IpAddr,
}

impl GatewayRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn request_parts(&self) -> RequestParts {
        RequestParts {
            method: self.method.clone(),
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Receipt,
    Tap,
}

impl EngineKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Receipt => "receipt",
            EngineKind::Tap => "tap",
        }
    }
}

/// Who was verified, and with what caveats.
#[derive(Debug, Clone)]
pub struct Principal {
    pub engine: EngineKind,
    pub issuer: String,
    pub keyid: Option<String>,
    pub rid: Option<String>,
    pub subject: Option<String>,
    pub warnings: Vec<String>,
}

/// The engine's verdict for one request.
#[derive(Debug, Clone)]
pub enum Action {
    /// Pass the request through. `None` means a bypass path (unauthenticated
    /// by design); `Some` carries the verified principal.
    Forward(Option<Principal>),
    Error {
        code: VerifyCode,
        detail: Option<String>,
    },
    /// Payment-required challenge (receipt_or_tap mode, nothing presented).
    Challenge { detail: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    /// Present whenever the rate limiter ran for this request.
    pub rate: Option<RateLimitDecision>,
}

pub struct DecisionEngine {
    mode: GateMode,
    bypass: BypassMatcher,
    limiter: RateLimiter,
    receipts: ReceiptVerifier,
    proofs: RequestSignatureVerifier,
    fetcher: SafeFetcher,
    allowlist: HashSet<String>,
    allowlist_configured: bool,
    api_key_header: String,
    receipt_opts: ReceiptVerifyOptions,
    proof_opts: RequestVerifyOptions,
    pointer_max_bytes: usize,
    fetch_timeout: std::time::Duration,
    unsafe_allow_any_issuer: bool,
}

impl DecisionEngine {
    #[must_use]
    pub fn new(cfg: &GatewayConfig) -> Self {
        let policy = if cfg.unsafe_allow_insecure_fetch {
            FetchPolicy::insecure()
        } else {
            FetchPolicy::strict()
        };
        let fetcher = SafeFetcher::new(policy);

        let resolver = JwksResolver::new(
            fetcher.clone(),
            JwksConfig {
                allowed_hosts: cfg.allowed_hosts(),
                allow_any_issuer: cfg.unsafe_allow_any_issuer,
                ttl: cfg.jwks_ttl,
                fetch_timeout: cfg.fetch_timeout,
                ..JwksConfig::default()
            },
        );

        let replay: Option<Arc<dyn ReplayStore>> = if cfg.unsafe_allow_no_replay {
            None
        } else {
            Some(Arc::new(InMemoryReplayStore::new(
                NonZeroUsize::new(REPLAY_CAPACITY).expect("nonzero"),
            )))
        };

        let receipt_opts = ReceiptVerifyOptions {
            max_clock_skew: cfg.max_clock_skew,
            ..ReceiptVerifyOptions::default()
        };
        let proof_opts = RequestVerifyOptions {
            max_clock_skew: cfg.max_clock_skew,
            max_window: cfg.max_tap_window,
            known_tags: cfg.known_tags.clone(),
            allow_unknown_tags: cfg.unsafe_allow_unknown_tags,
            allow_no_replay: cfg.unsafe_allow_no_replay,
            ..RequestVerifyOptions::default()
        };

        Self {
            mode: cfg.mode,
            bypass: BypassMatcher::new(&cfg.bypass_paths),
            limiter: RateLimiter::new(cfg.rate_limit_anon, cfg.rate_limit_keyed),
            receipts: ReceiptVerifier::new(resolver.clone()),
            proofs: RequestSignatureVerifier::new(resolver, replay),
            fetcher,
            allowlist: cfg.issuer_allowlist.iter().cloned().collect(),
            allowlist_configured: !cfg.issuer_allowlist.is_empty(),
            api_key_header: cfg.api_key_header.clone(),
            receipt_opts,
            proof_opts,
            pointer_max_bytes: cfg.pointer_max_bytes,
            fetch_timeout: cfg.fetch_timeout,
            unsafe_allow_any_issuer: cfg.unsafe_allow_any_issuer,
        }
    }

    /// Decide one request. Re-entrant; all mutable state lives behind the
    /// limiter, resolver, and replay store locks.
    pub async fn decide(&self, req: &GatewayRequest) -> Decision {
        // Bypass paths skip verification and the misconfiguration check.
        if self.bypass.matches(&req.path) {
            return Decision {
                action: Action::Forward(None),
                rate: None,
            };
        }

        if !self.allowlist_configured && !self.unsafe_allow_any_issuer {
            return Decision {
                action: Action::Error {
                    code: VerifyCode::ConfigIssuerAllowlistRequired,
                    detail: Some("ISSUER_ALLOWLIST is empty".into()),
                },
                rate: None,
            };
        }

        let rate = self.limiter.check(&self.client_key(req));
        if !rate.allowed {
            return Decision {
                action: Action::Error {
                    code: VerifyCode::RateLimited,
                    detail: None,
                },
                rate: Some(rate),
            };
        }

        let action = self.authenticate(req).await;
        if let Action::Error { code, detail } = &action {
            tracing::debug!(code = %code, detail = ?detail, path = %req.path, "request refused");
        }
        Decision {
            action,
            rate: Some(rate),
        }
    }

    async fn authenticate(&self, req: &GatewayRequest) -> Action {
        match transport::detect(&req.headers, req.body_json.as_ref()) {
            Err(e) => Action::Error {
                code: e.code(),
                detail: Some(e.to_string()),
            },
            Ok(Some(found)) => self.verify_receipts(found).await,
            Ok(None) => {
                if self.has_signature_headers(req) {
                    self.verify_proof(req).await
                } else {
                    self.no_credentials()
                }
            }
        }
    }

    async fn verify_receipts(&self, found: ReceiptTransport) -> Action {
        let mut warnings = Vec::new();
        let receipts = match found {
            ReceiptTransport::Header { jws } => vec![jws],
            ReceiptTransport::Body { receipts } => receipts,
            ReceiptTransport::Pointer(pointer) => {
                match fetch_pointer(
                    &self.fetcher,
                    &pointer,
                    self.pointer_max_bytes,
                    self.fetch_timeout,
                )
                .await
                {
                    Ok(outcome) => {
                        warnings.extend(outcome.warning);
                        vec![outcome.jws]
                    }
                    Err(e) => {
                        return Action::Error {
                            code: e.code(),
                            detail: Some(e.to_string()),
                        };
                    }
                }
            }
        };

        let mut first_error: Option<Action> = None;
        for jws in &receipts {
            match self.receipts.verify(jws, &self.receipt_opts).await {
                Ok(verified) => {
                    match verified.claims.issuer_origin() {
                        Ok(origin)
                            if self.unsafe_allow_any_issuer
                                || self.allowlist.contains(&origin) => {}
                        Ok(_) => {
                            return Action::Error {
                                code: VerifyCode::IssuerNotAllowed,
                                detail: Some(format!(
                                    "issuer {} is not allowlisted",
                                    verified.claims.iss
                                )),
                            };
                        }
                        Err(e) => {
                            return Action::Error {
                                code: VerifyCode::MalformedReceipt,
                                detail: Some(e.to_string()),
                            };
                        }
                    }
                    return Action::Forward(Some(Principal {
                        engine: EngineKind::Receipt,
                        issuer: verified.claims.iss.clone(),
                        keyid: Some(verified.kid),
                        rid: Some(verified.claims.rid.clone()),
                        subject: Some(verified.claims.sub.clone()),
                        warnings,
                    }));
                }
                Err(e) => {
                    first_error.get_or_insert(Action::Error {
                        code: e.code(),
                        detail: Some(e.to_string()),
                    });
                }
            }
        }
        first_error.unwrap_or(Action::Error {
            code: VerifyCode::InternalError,
            detail: Some("no receipts to verify".into()),
        })
    }

    async fn verify_proof(&self, req: &GatewayRequest) -> Action {
        let parts = req.request_parts();
        match self.proofs.verify(&parts, &self.proof_opts).await {
            Ok(verified) => {
                let mut warnings = Vec::new();
                if verified.replay_kind == Some("best-effort") {
                    warnings.push("replay-best-effort".to_owned());
                }
                Action::Forward(Some(Principal {
                    engine: EngineKind::Tap,
                    issuer: verified.issuer_origin,
                    keyid: Some(verified.keyid),
                    rid: None,
                    subject: None,
                    warnings,
                }))
            }
            Err(e) => Action::Error {
                code: e.code(),
                detail: Some(e.to_string()),
            },
        }
    }

    fn no_credentials(&self) -> Action {
        match self.mode {
            GateMode::TapOnly => Action::Error {
                code: VerifyCode::TapSignatureMissing,
                detail: None,
            },
            GateMode::ReceiptOrTap => Action::Challenge {
                detail: Some("present a receipt or a signed request".into()),
            },
        }
    }

    fn has_signature_headers(&self, req: &GatewayRequest) -> bool {
        req.header(SIGNATURE_INPUT_HEADER).is_some() || req.header(SIGNATURE_HEADER).is_some()
    }

    fn client_key(&self, req: &GatewayRequest) -> ClientKey {
        match req.header(&self.api_key_header).map(str::trim) {
            Some(key) if !key.is_empty() => ClientKey::ApiKey(key.to_owned()),
            _ => ClientKey::Anon(req.client_ip),
        }
    }
}
