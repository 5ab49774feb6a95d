//! RFC 9421-style signed-request verification.
//!
//! `Signature-Input` declares, per label, the covered components and the
//! signature parameters; `Signature` carries the raw signature bytes. The
//! signature base rebuilt here must be byte-identical to what the caller
//! signed, so the `@signature-params` line reuses the as-received parameter
//! text rather than re-serializing it.

use crate::jwks::{JwksError, JwksResolver};
use crate::problem::VerifyCode;
use crate::replay::ReplayStore;
use crate::sfv::{self, BareItem, MemberValue};
use ed25519_dalek::{Signature, Verifier as _};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const SIGNATURE_INPUT_HEADER: &str = "signature-input";
pub const SIGNATURE_HEADER: &str = "signature";

/// The only signature algorithm accepted for request proofs.
pub const REQUEST_SIG_ALG: &str = "ed25519";

#[derive(Debug, Error)]
pub enum TapError {
    #[error("malformed signature headers: {0}")]
    Malformed(String),
    #[error("no signature under label {0:?}")]
    UnknownLabel(String),
    #[error("unsupported signature algorithm {0:?}")]
    AlgorithmInvalid(String),
    #[error("signature time invalid: {0}")]
    TimeInvalid(&'static str),
    #[error("signature validity window exceeds the maximum")]
    WindowTooLarge,
    #[error("unknown signature tag {0:?}")]
    TagUnknown(String),
    #[error("signing key not found")]
    KeyNotFound,
    #[error("signature issuer is not allowlisted")]
    IssuerNotAllowed,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("nonce present but no replay store is configured")]
    ReplayProtectionRequired,
    #[error("nonce was already used")]
    NonceReplay,
    #[error("replay store failure: {0}")]
    ReplayFailure(String),
}

impl TapError {
    #[must_use]
    pub fn code(&self) -> VerifyCode {
        match self {
            TapError::Malformed(_) | TapError::UnknownLabel(_) | TapError::SignatureInvalid => {
                VerifyCode::TapSignatureInvalid
            }
            TapError::AlgorithmInvalid(_) => VerifyCode::TapAlgorithmInvalid,
            TapError::TimeInvalid(_) => VerifyCode::TapTimeInvalid,
            TapError::WindowTooLarge => VerifyCode::TapWindowTooLarge,
            TapError::TagUnknown(_) => VerifyCode::TapTagUnknown,
            TapError::KeyNotFound => VerifyCode::TapKeyNotFound,
            TapError::IssuerNotAllowed => VerifyCode::IssuerNotAllowed,
            TapError::ReplayProtectionRequired => VerifyCode::TapReplayProtectionRequired,
            TapError::NonceReplay => VerifyCode::TapNonceReplay,
            TapError::ReplayFailure(_) => VerifyCode::InternalError,
        }
    }
}

/// The pieces of the incoming request the signature base draws from.
///
/// `headers` are as-received (name, value) pairs; repeated fields are joined
/// with `", "` on lookup, matching how the signer saw them.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: String,
    pub scheme: String,
    /// Host, with port when non-default (as in the `Host` header).
    pub authority: String,
    pub path: String,
    /// Query without the leading `?`; `None` when the URI has no query.
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RequestParts {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    #[must_use]
    pub fn target_uri(&self) -> String {
        let mut out = format!("{}://{}{}", self.scheme, self.authority, self.path);
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        out
    }

    fn request_target(&self) -> String {
        let mut out = self.path.clone();
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        out
    }
}

/// Parameters of one signature label.
#[derive(Debug, Clone)]
pub struct SignatureParams {
    pub created: i64,
    pub expires: Option<i64>,
    pub nonce: Option<String>,
    pub keyid: String,
    pub alg: String,
    pub tag: Option<String>,
}

/// One label's worth of `Signature-Input` + `Signature`.
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub label: String,
    pub covered: Vec<String>,
    pub params: SignatureParams,
    /// As-received text after `label=`, used verbatim in the base.
    pub params_raw: String,
    pub signature: Vec<u8>,
}

/// Parse the two signature headers into per-label entries.
pub fn parse_signature_headers(
    signature_input: &str,
    signature: &str,
) -> Result<Vec<ParsedSignature>, TapError> {
    let inputs = sfv::parse_dictionary(signature_input)
        .map_err(|e| TapError::Malformed(format!("Signature-Input: {e}")))?;
    let signatures = sfv::parse_dictionary(signature)
        .map_err(|e| TapError::Malformed(format!("Signature: {e}")))?;

    if inputs.is_empty() {
        return Err(TapError::Malformed("Signature-Input has no members".into()));
    }

    let mut out = Vec::with_capacity(inputs.len());
    for (label, member) in inputs {
        let MemberValue::InnerList(items) = &member.value else {
            return Err(TapError::Malformed(format!(
                "label {label:?} is not an inner list"
            )));
        };

        let mut covered = Vec::with_capacity(items.len());
        for item in items {
            let Some(name) = item.value.as_string() else {
                return Err(TapError::Malformed(format!(
                    "covered component in {label:?} is not a string"
                )));
            };
            covered.push(name.to_owned());
        }

        let params = extract_params(&label, &member)?;

        let signature = signatures
            .iter()
            .find_map(|(k, m)| (*k == label).then_some(m))
            .and_then(|m| match &m.value {
                MemberValue::Item(BareItem::ByteSequence(bytes)) => Some(bytes.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                TapError::Malformed(format!("no byte-sequence signature for label {label:?}"))
            })?;

        out.push(ParsedSignature {
            label,
            covered,
            params,
            params_raw: member.raw.clone(),
            signature,
        });
    }
    Ok(out)
}

fn extract_params(label: &str, member: &sfv::Member) -> Result<SignatureParams, TapError> {
    let get_string = |name: &str| -> Option<String> {
        member
            .param(name)
            .and_then(BareItem::as_string)
            .map(str::to_owned)
    };

    let created = member
        .param("created")
        .and_then(BareItem::as_integer)
        .ok_or_else(|| TapError::Malformed(format!("label {label:?} has no created integer")))?;
    let expires = match member.param("expires") {
        None => None,
        Some(item) => Some(item.as_integer().ok_or_else(|| {
            TapError::Malformed(format!("label {label:?} expires is not an integer"))
        })?),
    };
    let keyid = get_string("keyid")
        .ok_or_else(|| TapError::Malformed(format!("label {label:?} has no keyid string")))?;
    let alg = get_string("alg")
        .ok_or_else(|| TapError::Malformed(format!("label {label:?} has no alg string")))?;

    Ok(SignatureParams {
        created,
        expires,
        nonce: get_string("nonce"),
        keyid,
        alg,
        tag: get_string("tag"),
    })
}

/// Build the canonical signature base: one line per covered component, then
/// the `@signature-params` line.
pub fn build_signature_base(
    parts: &RequestParts,
    covered: &[String],
    params_raw: &str,
) -> Result<String, TapError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut lines = Vec::with_capacity(covered.len() + 1);

    for component in covered {
        let component = component.as_str();
        if !seen.insert(component) {
            return Err(TapError::Malformed(format!(
                "duplicate covered component {component:?}"
            )));
        }
        let value = if let Some(derived) = component.strip_prefix('@') {
            derived_component(parts, derived)
                .ok_or_else(|| TapError::Malformed(format!("unknown derived component {component:?}")))?
        } else {
            parts.header(component).ok_or_else(|| {
                TapError::Malformed(format!("covered header {component:?} is absent"))
            })?
        };
        lines.push(format!("\"{}\": {value}", component.to_ascii_lowercase()));
    }

    lines.push(format!("\"@signature-params\": {params_raw}"));
    Ok(lines.join("\n"))
}

fn derived_component(parts: &RequestParts, name: &str) -> Option<String> {
    match name {
        "method" => Some(parts.method.to_ascii_uppercase()),
        "target-uri" => Some(parts.target_uri()),
        "authority" => Some(parts.authority.to_ascii_lowercase()),
        "scheme" => Some(parts.scheme.clone()),
        "request-target" => Some(parts.request_target()),
        "path" => Some(parts.path.clone()),
        "query" => Some(match &parts.query {
            Some(query) => format!("?{query}"),
            None => "?".to_owned(),
        }),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct RequestVerifyOptions {
    pub max_clock_skew: Duration,
    pub max_window: Duration,
    pub known_tags: HashSet<String>,
    pub allow_unknown_tags: bool,
    /// Unsafe override: accept nonce-bearing proofs without a replay store.
    pub allow_no_replay: bool,
    /// Verify this label instead of the first one.
    pub label: Option<String>,
    /// Verification time override; defaults to the wall clock.
    pub now: Option<i64>,
}

impl Default for RequestVerifyOptions {
    fn default() -> Self {
        Self {
            max_clock_skew: Duration::from_secs(300),
            max_window: Duration::from_secs(480),
            known_tags: HashSet::new(),
            allow_unknown_tags: false,
            allow_no_replay: false,
            label: None,
            now: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedRequestSignature {
    pub label: String,
    pub keyid: String,
    pub issuer_origin: String,
    pub created: i64,
    pub nonce: Option<String>,
    pub tag: Option<String>,
    /// The replay store kind consulted for the nonce, if any.
    pub replay_kind: Option<&'static str>,
}

#[derive(Clone)]
pub struct RequestSignatureVerifier {
    resolver: JwksResolver,
    replay: Option<Arc<dyn ReplayStore>>,
}

impl RequestSignatureVerifier {
    #[must_use]
    pub fn new(resolver: JwksResolver, replay: Option<Arc<dyn ReplayStore>>) -> Self {
        Self { resolver, replay }
    }

    /// Verify the request's signature headers against the request itself.
    pub async fn verify(
        &self,
        parts: &RequestParts,
        opts: &RequestVerifyOptions,
    ) -> Result<VerifiedRequestSignature, TapError> {
        let signature_input = parts
            .header(SIGNATURE_INPUT_HEADER)
            .ok_or_else(|| TapError::Malformed("missing Signature-Input header".into()))?;
        let signature = parts
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| TapError::Malformed("missing Signature header".into()))?;

        let parsed = parse_signature_headers(&signature_input, &signature)?;
        let selected = match &opts.label {
            Some(label) => parsed
                .iter()
                .find(|p| p.label == *label)
                .ok_or_else(|| TapError::UnknownLabel(label.clone()))?,
            None => parsed
                .first()
                .ok_or_else(|| TapError::Malformed("no signatures present".into()))?,
        };

        if selected.params.alg != REQUEST_SIG_ALG {
            return Err(TapError::AlgorithmInvalid(selected.params.alg.clone()));
        }

        let now = opts.now.unwrap_or_else(crate::now_unix_secs);
        let skew = i64::try_from(opts.max_clock_skew.as_secs()).unwrap_or(i64::MAX);
        let max_window = i64::try_from(opts.max_window.as_secs()).unwrap_or(i64::MAX);
        let created = selected.params.created;

        if created > now.saturating_add(skew) {
            return Err(TapError::TimeInvalid("created is in the future"));
        }
        if let Some(expires) = selected.params.expires {
            if expires.saturating_sub(created) > max_window {
                return Err(TapError::WindowTooLarge);
            }
            if expires < now.saturating_sub(skew) {
                return Err(TapError::TimeInvalid("signature expired"));
            }
        }

        if let Some(tag) = &selected.params.tag
            && !opts.known_tags.contains(tag)
            && !opts.allow_unknown_tags
        {
            return Err(TapError::TagUnknown(tag.clone()));
        }

        let (issuer_origin, kid) = split_keyid(&selected.params.keyid)?;
        let key = self
            .resolver
            .resolve(&issuer_origin, &kid)
            .await
            .map_err(|e| match e {
                JwksError::IssuerNotAllowed => TapError::IssuerNotAllowed,
                // Resolver outages degrade to key-not-found, not to 5xx.
                _ => TapError::KeyNotFound,
            })?;

        let base = build_signature_base(parts, &selected.covered, &selected.params_raw)?;
        let signature = Signature::from_slice(&selected.signature)
            .map_err(|_| TapError::Malformed("signature length".into()))?;
        key.verify(base.as_bytes(), &signature)
            .map_err(|_| TapError::SignatureInvalid)?;

        let mut replay_kind = None;
        if let Some(nonce) = &selected.params.nonce {
            match &self.replay {
                None => {
                    if !opts.allow_no_replay {
                        return Err(TapError::ReplayProtectionRequired);
                    }
                }
                Some(store) => {
                    let expiry = selected
                        .params
                        .expires
                        .unwrap_or_else(|| created.saturating_add(max_window));
                    let ttl_secs = expiry.saturating_sub(now).max(1);
                    let ttl = Duration::from_secs(u64::try_from(ttl_secs).unwrap_or(1));
                    let hit = store
                        .seen(&issuer_origin, &selected.params.keyid, nonce, ttl)
                        .map_err(|e| TapError::ReplayFailure(e.to_string()))?;
                    if hit {
                        return Err(TapError::NonceReplay);
                    }
                    replay_kind = Some(store.kind());
                }
            }
        }

        Ok(VerifiedRequestSignature {
            label: selected.label.clone(),
            keyid: selected.params.keyid.clone(),
            issuer_origin,
            created,
            nonce: selected.params.nonce.clone(),
            tag: selected.params.tag.clone(),
            replay_kind,
        })
    }
}

/// A keyid is an HTTPS URL: its origin is the issuer, its fragment (or the
/// whole keyid, absent a fragment) selects the key within the JWKS.
fn split_keyid(keyid: &str) -> Result<(String, String), TapError> {
    let url = Url::parse(keyid).map_err(|_| TapError::KeyNotFound)?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(TapError::KeyNotFound);
    }
    let kid = match url.fragment() {
        Some(fragment) if !fragment.is_empty() => fragment.to_owned(),
        _ => keyid.to_owned(),
    };
    Ok((origin.ascii_serialization(), kid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::JwksConfig;
    use crate::replay::InMemoryReplayStore;
    use axum::Router;
    use axum::routing::get;
    use base64::Engine as _;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use ed25519_dalek::{Signer as _, SigningKey};
    use peac_fetch::{FetchPolicy, SafeFetcher};
    use serde_json::json;
    use std::num::NonZeroUsize;
    use tokio::net::TcpListener;

    fn sample_parts() -> RequestParts {
        RequestParts {
            method: "post".into(),
            scheme: "https".into(),
            authority: "Api.Example:8443".into(),
            path: "/v1/things".into(),
            query: Some("page=2".into()),
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("X-Multi".into(), "a".into()),
                ("x-multi".into(), "b".into()),
            ],
        }
    }

    #[test]
    fn base_covers_derived_components_deterministically() {
        let parts = sample_parts();
        let covered: Vec<String> = [
            "@method",
            "@target-uri",
            "@authority",
            "@scheme",
            "@request-target",
            "@path",
            "@query",
            "content-type",
            "x-multi",
        ]
        .into_iter()
        .map(str::to_owned)
        .collect();
        let raw = r#"("@method");created=1;keyid="https://i.example#k";alg="ed25519""#;

        let base = build_signature_base(&parts, &covered, raw).expect("base");
        let expected = "\
\"@method\": POST
\"@target-uri\": https://Api.Example:8443/v1/things?page=2
\"@authority\": api.example:8443
\"@scheme\": https
\"@request-target\": /v1/things?page=2
\"@path\": /v1/things
\"@query\": ?page=2
\"content-type\": application/json
\"x-multi\": a, b
\"@signature-params\": (\"@method\");created=1;keyid=\"https://i.example#k\";alg=\"ed25519\"";
        assert_eq!(base, expected);
        // Byte-identical on repeat.
        assert_eq!(base, build_signature_base(&parts, &covered, raw).expect("base"));
    }

    #[test]
    fn empty_query_serializes_as_bare_question_mark() {
        let mut parts = sample_parts();
        parts.query = None;
        let base = build_signature_base(&parts, &["@query".to_owned()], "()")
            .expect("base");
        assert!(base.starts_with("\"@query\": ?\n"));
    }

    #[test]
    fn base_rejects_unknown_derived_and_missing_headers() {
        let parts = sample_parts();
        assert!(build_signature_base(&parts, &["@frag".to_owned()], "()").is_err());
        assert!(build_signature_base(&parts, &["x-absent".to_owned()], "()").is_err());
        assert!(
            build_signature_base(
                &parts,
                &["@method".to_owned(), "@method".to_owned()],
                "()"
            )
            .is_err()
        );
    }

    #[test]
    fn parses_multiple_labels() {
        let input = concat!(
            r#"sig1=("@method");created=1;keyid="https://a.example#k1";alg="ed25519", "#,
            r#"sig2=("@path");created=2;keyid="https://b.example#k2";alg="ed25519";nonce="n1""#
        );
        let sigs = format!("sig1=:{}:, sig2=:{}:", STANDARD.encode([1u8; 64]), STANDARD.encode([2u8; 64]));
        let parsed = parse_signature_headers(input, &sigs).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].label, "sig1");
        assert_eq!(parsed[1].params.nonce.as_deref(), Some("n1"));
        assert_eq!(parsed[0].signature, vec![1u8; 64]);
    }

    #[test]
    fn parse_rejects_missing_signature_bytes_and_params() {
        let input = r#"sig1=("@method");created=1;keyid="https://a.example#k1";alg="ed25519""#;
        assert!(matches!(
            parse_signature_headers(input, "other=:AA==:"),
            Err(TapError::Malformed(_))
        ));

        let no_created = r#"sig1=("@method");keyid="https://a.example#k1";alg="ed25519""#;
        let sig = format!("sig1=:{}:", STANDARD.encode([0u8; 64]));
        assert!(matches!(
            parse_signature_headers(no_created, &sig),
            Err(TapError::Malformed(_))
        ));
    }

    #[test]
    fn keyid_splits_origin_and_fragment() {
        let (origin, kid) = split_keyid("https://issuer.example:8443/jwks#k1").expect("split");
        assert_eq!(origin, "https://issuer.example:8443");
        assert_eq!(kid, "k1");

        let (_, kid) = split_keyid("https://issuer.example/keys/k2").expect("split");
        assert_eq!(kid, "https://issuer.example/keys/k2");

        assert!(split_keyid("not a url").is_err());
    }

    struct Issuer {
        key: SigningKey,
        origin: String,
        _shutdown: tokio::sync::oneshot::Sender<()>,
    }

    async fn spawn_issuer() -> Issuer {
        let key = SigningKey::from_bytes(&[9; 32]);
        let jwks = json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "kid": "k1",
                "x": URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
            }]
        });
        let app = Router::new().route(
            "/.well-known/jwks.json",
            get(move || {
                let jwks = jwks.clone();
                async move { axum::Json(jwks) }
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
        Issuer {
            key,
            origin: format!("http://{addr}"),
            _shutdown: tx,
        }
    }

    fn verifier_for(issuer: &Issuer, replay: Option<Arc<dyn ReplayStore>>) -> RequestSignatureVerifier {
        let host = Url::parse(&issuer.origin)
            .expect("origin")
            .host_str()
            .expect("host")
            .to_owned();
        let resolver = JwksResolver::new(
            SafeFetcher::new(FetchPolicy::insecure()),
            JwksConfig {
                allowed_hosts: [host].into_iter().collect(),
                ..JwksConfig::default()
            },
        );
        RequestSignatureVerifier::new(resolver, replay)
    }

    /// Sign `parts` the way a caller would, appending the two headers.
    fn sign(parts: &mut RequestParts, issuer: &Issuer, created: i64, extra_params: &str) {
        let keyid = format!("{}/jwks#k1", issuer.origin);
        let params_raw = format!(
            r#"("@method" "@path" "@authority");created={created};keyid="{keyid}";alg="ed25519"{extra_params}"#
        );
        let covered: Vec<String> = ["@method", "@path", "@authority"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        let base = build_signature_base(parts, &covered, &params_raw).expect("base");
        let signature = issuer.key.sign(base.as_bytes());
        parts
            .headers
            .push(("Signature-Input".into(), format!("sig1={params_raw}")));
        parts.headers.push((
            "Signature".into(),
            format!("sig1=:{}:", STANDARD.encode(signature.to_bytes())),
        ));
    }

    fn opts_at(now: i64) -> RequestVerifyOptions {
        RequestVerifyOptions {
            now: Some(now),
            ..RequestVerifyOptions::default()
        }
    }

    #[tokio::test]
    async fn verifies_signed_request_end_to_end() {
        let issuer = spawn_issuer().await;
        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, "");

        let verified = verifier_for(&issuer, None)
            .verify(&parts, &opts_at(1_700_000_010))
            .await
            .expect("verify");
        assert_eq!(verified.label, "sig1");
        assert_eq!(verified.issuer_origin, issuer.origin);
        assert!(verified.nonce.is_none());
        assert!(verified.replay_kind.is_none());
    }

    #[tokio::test]
    async fn tampered_request_fails_verification() {
        let issuer = spawn_issuer().await;
        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, "");
        parts.path = "/v1/other".into();

        let err = verifier_for(&issuer, None)
            .verify(&parts, &opts_at(1_700_000_010))
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::SignatureInvalid));
    }

    #[tokio::test]
    async fn rejects_future_created_and_oversized_window() {
        let issuer = spawn_issuer().await;

        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_010_000, "");
        let err = verifier_for(&issuer, None)
            .verify(&parts, &opts_at(1_700_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::TimeInvalid(_)));

        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, ";expires=1700001000");
        let err = verifier_for(&issuer, None)
            .verify(&parts, &opts_at(1_700_000_010))
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::WindowTooLarge));
    }

    #[tokio::test]
    async fn rejects_unknown_tag_unless_allowed() {
        let issuer = spawn_issuer().await;
        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, ";tag=\"custom\"");

        let err = verifier_for(&issuer, None)
            .verify(&parts, &opts_at(1_700_000_010))
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::TagUnknown(_)));

        let opts = RequestVerifyOptions {
            allow_unknown_tags: true,
            now: Some(1_700_000_010),
            ..RequestVerifyOptions::default()
        };
        verifier_for(&issuer, None)
            .verify(&parts, &opts)
            .await
            .expect("allowed with override");
    }

    #[tokio::test]
    async fn nonce_requires_replay_store() {
        let issuer = spawn_issuer().await;
        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, ";nonce=\"n1\"");

        let err = verifier_for(&issuer, None)
            .verify(&parts, &opts_at(1_700_000_010))
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::ReplayProtectionRequired));

        let opts = RequestVerifyOptions {
            allow_no_replay: true,
            now: Some(1_700_000_010),
            ..RequestVerifyOptions::default()
        };
        let verified = verifier_for(&issuer, None)
            .verify(&parts, &opts)
            .await
            .expect("unsafe override");
        assert!(verified.replay_kind.is_none());
    }

    #[tokio::test]
    async fn nonce_replay_is_detected() {
        let issuer = spawn_issuer().await;
        let store: Arc<dyn ReplayStore> =
            Arc::new(InMemoryReplayStore::new(NonZeroUsize::new(64).expect("nonzero")));
        let verifier = verifier_for(&issuer, Some(store));

        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, ";nonce=\"n1\"");

        let verified = verifier
            .verify(&parts, &opts_at(1_700_000_010))
            .await
            .expect("first use");
        assert_eq!(verified.replay_kind, Some("best-effort"));

        let err = verifier
            .verify(&parts, &opts_at(1_700_000_011))
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::NonceReplay));
    }

    #[tokio::test]
    async fn selects_requested_label() {
        let issuer = spawn_issuer().await;
        let mut parts = sample_parts();
        sign(&mut parts, &issuer, 1_700_000_000, "");

        let opts = RequestVerifyOptions {
            label: Some("sig9".into()),
            now: Some(1_700_000_010),
            ..RequestVerifyOptions::default()
        };
        let err = verifier_for(&issuer, None)
            .verify(&parts, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, TapError::UnknownLabel(_)));
    }
}
