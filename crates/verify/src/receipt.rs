//! Signed-receipt verification.

use crate::claims::{ReceiptClaims, ReceiptVariant};
use crate::jws::{CompactJws, RECEIPT_ALG, RECEIPT_TYP};
use crate::jwks::{JwksError, JwksResolver};
use crate::problem::VerifyCode;
use ed25519_dalek::{Signature, Verifier as _};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("E_VERIFY_MALFORMED_RECEIPT: {0}")]
    Malformed(String),
    #[error("unsupported receipt algorithm {0:?}")]
    AlgorithmInvalid(String),
    #[error("no signing key found for the receipt kid")]
    KeyNotFound,
    #[error("key resolution failed: {0}")]
    KeyResolution(String),
    #[error("receipt signature verification failed")]
    SignatureInvalid,
    #[error("E_INVALID_ISSUER: issuer does not match the expected issuer")]
    InvalidIssuer,
    #[error("E_INVALID_AUDIENCE: audience does not match the expected audience")]
    InvalidAudience,
    #[error("E_INVALID_SUBJECT: subject does not match the expected subject")]
    InvalidSubject,
    #[error("E_INVALID_RECEIPT_ID: receipt id does not match the expected rid")]
    InvalidReceiptId,
    #[error("E_NOT_YET_VALID: receipt iat is in the future")]
    NotYetValid,
    #[error("E_MISSING_EXP: receipt has no exp but one is required")]
    MissingExp,
    #[error("E_EXPIRED: receipt exp is in the past")]
    Expired,
    #[error("receipt issuer is not allowlisted")]
    IssuerNotAllowed,
}

impl ReceiptError {
    /// Canonical response code for this failure. Finer-grained causes ride
    /// in the problem `detail`.
    #[must_use]
    pub fn code(&self) -> VerifyCode {
        match self {
            ReceiptError::Malformed(_) => VerifyCode::MalformedReceipt,
            ReceiptError::Expired => VerifyCode::ReceiptExpired,
            ReceiptError::IssuerNotAllowed => VerifyCode::IssuerNotAllowed,
            ReceiptError::AlgorithmInvalid(_)
            | ReceiptError::KeyNotFound
            | ReceiptError::KeyResolution(_)
            | ReceiptError::SignatureInvalid
            | ReceiptError::InvalidIssuer
            | ReceiptError::InvalidAudience
            | ReceiptError::InvalidSubject
            | ReceiptError::InvalidReceiptId
            | ReceiptError::NotYetValid
            | ReceiptError::MissingExp => VerifyCode::ReceiptInvalid,
        }
    }
}

/// Expected bindings and policy knobs for one verification.
#[derive(Debug, Clone)]
pub struct ReceiptVerifyOptions {
    pub expected_issuer: Option<String>,
    pub expected_audience: Option<String>,
    pub expected_subject: Option<String>,
    pub expected_rid: Option<String>,
    pub require_exp: bool,
    pub max_clock_skew: Duration,
    /// Verification time override; defaults to the wall clock.
    pub now: Option<i64>,
}

impl Default for ReceiptVerifyOptions {
    fn default() -> Self {
        Self {
            expected_issuer: None,
            expected_audience: None,
            expected_subject: None,
            expected_rid: None,
            require_exp: false,
            max_clock_skew: Duration::from_secs(300),
            now: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifiedReceipt {
    pub claims: ReceiptClaims,
    pub variant: ReceiptVariant,
    pub kid: String,
}

#[derive(Clone)]
pub struct ReceiptVerifier {
    resolver: JwksResolver,
}

impl ReceiptVerifier {
    #[must_use]
    pub fn new(resolver: JwksResolver) -> Self {
        Self { resolver }
    }

    /// Verify a compact-JWS receipt.
    ///
    /// The payload `iss` selects the JWKS host (gated by the resolver's
    /// allowlist before any fetch); the header `kid` selects the key inside
    /// that document.
    pub async fn verify(
        &self,
        jws: &str,
        opts: &ReceiptVerifyOptions,
    ) -> Result<VerifiedReceipt, ReceiptError> {
        let jws = CompactJws::split(jws).map_err(|e| ReceiptError::Malformed(e.to_string()))?;

        let header = jws
            .header()
            .map_err(|e| ReceiptError::Malformed(e.to_string()))?;
        if header.alg != RECEIPT_ALG {
            return Err(ReceiptError::AlgorithmInvalid(header.alg));
        }
        if header.typ.as_deref() != Some(RECEIPT_TYP) {
            return Err(ReceiptError::Malformed(format!(
                "unexpected typ {:?}",
                header.typ
            )));
        }
        let Some(kid) = header.kid else {
            return Err(ReceiptError::Malformed("missing kid".into()));
        };

        let payload = jws
            .payload()
            .map_err(|e| ReceiptError::Malformed(e.to_string()))?;
        let claims: ReceiptClaims = serde_json::from_slice(&payload)
            .map_err(|e| ReceiptError::Malformed(format!("claims: {e}")))?;
        let origin = claims
            .issuer_origin()
            .map_err(|e| ReceiptError::Malformed(e.to_string()))?;

        let key = self
            .resolver
            .resolve(&origin, &kid)
            .await
            .map_err(|e| match e {
                JwksError::IssuerNotAllowed => ReceiptError::IssuerNotAllowed,
                JwksError::KeyNotFound => ReceiptError::KeyNotFound,
                other => ReceiptError::KeyResolution(other.to_string()),
            })?;

        let signature_bytes = jws
            .signature()
            .map_err(|e| ReceiptError::Malformed(e.to_string()))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| ReceiptError::Malformed("signature length".into()))?;
        key.verify(&jws.signing_input(), &signature)
            .map_err(|_| ReceiptError::SignatureInvalid)?;

        let variant = claims
            .validate()
            .map_err(|e| ReceiptError::Malformed(e.to_string()))?;

        if let Some(expected) = &opts.expected_issuer
            && claims.iss != *expected
        {
            return Err(ReceiptError::InvalidIssuer);
        }
        if let Some(expected) = &opts.expected_audience
            && claims.aud != *expected
        {
            return Err(ReceiptError::InvalidAudience);
        }
        if let Some(expected) = &opts.expected_subject
            && claims.sub != *expected
        {
            return Err(ReceiptError::InvalidSubject);
        }
        if let Some(expected) = &opts.expected_rid
            && claims.rid != *expected
        {
            return Err(ReceiptError::InvalidReceiptId);
        }

        let now = opts.now.unwrap_or_else(crate::now_unix_secs);
        let skew = i64::try_from(opts.max_clock_skew.as_secs()).unwrap_or(i64::MAX);
        if claims.iat > now.saturating_add(skew) {
            return Err(ReceiptError::NotYetValid);
        }
        match claims.exp {
            None if opts.require_exp => return Err(ReceiptError::MissingExp),
            Some(exp) if exp.saturating_add(skew) < now => return Err(ReceiptError::Expired),
            _ => {}
        }

        Ok(VerifiedReceipt {
            claims,
            variant,
            kid,
        })
    }
}
