//! Pointer-profile receipt retrieval: fetch the bytes, hold them to the
//! declared digest, hand back the inline JWS.

use crate::jws::is_compact_jws;
use crate::problem::VerifyCode;
use crate::transport::ReceiptPointer;
use peac_fetch::{FetchError, FetchOptions, SafeFetcher};
use sha2::{Digest as _, Sha256};
use std::time::Duration;
use thiserror::Error;

/// Content types we expect a pointed-to receipt to carry. Anything else is
/// advisory only and becomes a warning, never a rejection.
const EXPECTED_CONTENT_TYPES: [&str; 2] = ["application/jose", "text/plain"];

#[derive(Debug, Error)]
pub enum PointerError {
    #[error("pointer fetch blocked: {0}")]
    Blocked(FetchError),
    #[error("pointer fetch timed out")]
    Timeout,
    #[error("pointer body exceeded {limit} bytes")]
    TooLarge { limit: usize },
    #[error("pointer body digest does not match the declared sha256")]
    DigestMismatch,
    #[error("pointer body is not a compact JWS")]
    NotAJws,
    #[error("pointer fetch failed: {0}")]
    Failed(String),
}

impl PointerError {
    #[must_use]
    pub fn code(&self) -> VerifyCode {
        match self {
            PointerError::Blocked(_) => VerifyCode::PointerFetchBlocked,
            PointerError::Timeout => VerifyCode::PointerTimeout,
            PointerError::TooLarge { .. } => VerifyCode::PointerTooLarge,
            PointerError::DigestMismatch => VerifyCode::PointerDigestMismatch,
            PointerError::NotAJws => VerifyCode::MalformedReceipt,
            PointerError::Failed(_) => VerifyCode::PointerFetchFailed,
        }
    }
}

impl From<FetchError> for PointerError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotHttps
            | FetchError::PrivateIp(_)
            | FetchError::Loopback(_)
            | FetchError::LinkLocal(_) => PointerError::Blocked(e),
            FetchError::Timeout => PointerError::Timeout,
            FetchError::ResponseTooLarge { limit } => PointerError::TooLarge { limit },
            FetchError::DnsFailure(_) | FetchError::CrossOriginRedirect => {
                PointerError::Failed(e.to_string())
            }
            FetchError::Failed(msg) => PointerError::Failed(msg),
        }
    }
}

#[derive(Debug)]
pub struct PointerFetchOutcome {
    pub jws: String,
    /// Set when the response Content-Type was unexpected.
    pub warning: Option<String>,
}

/// Fetch and digest-check the pointed-to receipt.
pub async fn fetch_pointer(
    fetcher: &SafeFetcher,
    pointer: &ReceiptPointer,
    max_bytes: usize,
    timeout: Duration,
) -> Result<PointerFetchOutcome, PointerError> {
    let opts = FetchOptions {
        max_bytes,
        timeout,
        allow_redirects: false,
        extra_headers: Vec::new(),
    };
    let body = fetcher.get(&pointer.url, &opts).await?;

    // Digest over the raw bytes, before any transcoding.
    let digest = hex_digest(&body.bytes);
    if digest != pointer.digest_hex {
        return Err(PointerError::DigestMismatch);
    }

    let text = std::str::from_utf8(&body.bytes).map_err(|_| PointerError::NotAJws)?;
    let text = text.trim();
    if !is_compact_jws(text) {
        return Err(PointerError::NotAJws);
    }

    let warning = body.content_type.as_deref().and_then(|ct| {
        let essence = ct.split(';').next().unwrap_or(ct).trim();
        let expected = EXPECTED_CONTENT_TYPES
            .iter()
            .any(|e| essence.eq_ignore_ascii_case(e));
        (!expected).then(|| format!("unexpected pointer content-type: {essence}"))
    });

    Ok(PointerFetchOutcome {
        jws: text.to_owned(),
        warning,
    })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
