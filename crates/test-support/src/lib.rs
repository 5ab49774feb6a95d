//! A deterministic Ed25519 issuer for gateway integration tests: it can
//! serve a JWKS document, mint receipts, and produce signed-request headers.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use ed25519_dalek::{Signer as _, SigningKey};
use peac_verify::httpsig::{RequestParts, build_signature_base};

/// A deterministic signing identity for tests.
pub struct TestIssuer {
    key: SigningKey,
    pub origin: String,
    pub kid: String,
}

impl TestIssuer {
    /// Deterministic key from a one-byte seed; same seed, same key.
    #[must_use]
    pub fn new(seed: u8, origin: impl Into<String>) -> Self {
        Self {
            key: SigningKey::from_bytes(&[seed; 32]),
            origin: origin.into(),
            kid: format!("test-{seed}"),
        }
    }

    /// The JWKS document the issuer would serve.
    #[must_use]
    pub fn jwks_document(&self) -> serde_json::Value {
        serde_json::json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "kid": self.kid,
                "x": URL_SAFE_NO_PAD.encode(self.key.verifying_key().as_bytes()),
            }]
        })
    }

    /// The keyid URL signed requests carry.
    #[must_use]
    pub fn keyid(&self) -> String {
        format!("{}/jwks#{}", self.origin, self.kid)
    }

    /// Sign receipt claims into a compact JWS with the receipt `typ`.
    #[must_use]
    pub fn sign_receipt(&self, claims: &serde_json::Value) -> String {
        let header = serde_json::json!({
            "alg": "ed25519",
            "typ": "application/peac-receipt+jws",
            "kid": self.kid,
        });
        self.sign_jws(&header, claims)
    }

    /// Sign with an arbitrary header (for malformed-envelope tests).
    #[must_use]
    pub fn sign_jws(&self, header: &serde_json::Value, payload: &serde_json::Value) -> String {
        let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = self.key.sign(signing_input.as_bytes());
        format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    /// Produce `(Signature-Input, Signature)` header values covering
    /// `covered` for the given request, exactly as a compliant caller would.
    pub fn sign_request(
        &self,
        parts: &RequestParts,
        covered: &[&str],
        created: i64,
        extra_params: &str,
    ) -> anyhow::Result<(String, String)> {
        let covered_serialized: Vec<String> =
            covered.iter().map(|c| format!("\"{c}\"")).collect();
        let params_raw = format!(
            r#"({});created={created};keyid="{}";alg="ed25519"{extra_params}"#,
            covered_serialized.join(" "),
            self.keyid(),
        );
        let covered: Vec<String> = covered.iter().map(|c| (*c).to_owned()).collect();
        let base = build_signature_base(parts, &covered, &params_raw)
            .map_err(|e| anyhow::anyhow!("signature base: {e}"))?;
        let signature = self.key.sign(base.as_bytes());
        Ok((
            format!("sig1={params_raw}"),
            format!("sig1=:{}:", STANDARD.encode(signature.to_bytes())),
        ))
    }
}

/// A valid UUIDv7 usable as a receipt id in tests.
pub const TEST_RID: &str = "01890a5d-ac96-774b-bcce-b302099a8057";

/// Baseline receipt claims against the given issuer and audience.
#[must_use]
pub fn receipt_claims(issuer: &TestIssuer, audience: &str, iat: i64) -> serde_json::Value {
    serde_json::json!({
        "iss": issuer.origin,
        "aud": audience,
        "sub": format!("{audience}/resource/1"),
        "iat": iat,
        "rid": TEST_RID,
    })
}
