//! JWS compact serialization handling for receipt envelopes.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use thiserror::Error;

/// The only signing algorithm a receipt may declare.
pub const RECEIPT_ALG: &str = "ed25519";
/// Fixed `typ` identifying the receipt artifact kind.
pub const RECEIPT_TYP: &str = "application/peac-receipt+jws";

#[derive(Debug, Error)]
pub enum JwsError {
    #[error("not a compact JWS (expected three non-empty base64url segments)")]
    MalformedEnvelope,
    #[error("invalid base64url in {0} segment")]
    InvalidBase64(&'static str),
    #[error("invalid header JSON: {0}")]
    InvalidHeader(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default)]
    pub typ: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
}

/// A split (but not yet decoded) compact JWS.
#[derive(Debug, Clone, Copy)]
pub struct CompactJws<'a> {
    pub header_b64: &'a str,
    pub payload_b64: &'a str,
    pub signature_b64: &'a str,
}

impl<'a> CompactJws<'a> {
    pub fn split(input: &'a str) -> Result<Self, JwsError> {
        let mut parts = input.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwsError::MalformedEnvelope);
        };
        let jws = Self {
            header_b64,
            payload_b64,
            signature_b64,
        };
        for segment in [header_b64, payload_b64, signature_b64] {
            if segment.is_empty() || !segment.bytes().all(is_base64url_byte) {
                return Err(JwsError::MalformedEnvelope);
            }
        }
        Ok(jws)
    }

    pub fn header(&self) -> Result<JwsHeader, JwsError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.header_b64)
            .map_err(|_| JwsError::InvalidBase64("header"))?;
        serde_json::from_slice(&bytes).map_err(|e| JwsError::InvalidHeader(e.to_string()))
    }

    pub fn payload(&self) -> Result<Vec<u8>, JwsError> {
        URL_SAFE_NO_PAD
            .decode(self.payload_b64)
            .map_err(|_| JwsError::InvalidBase64("payload"))
    }

    pub fn signature(&self) -> Result<Vec<u8>, JwsError> {
        URL_SAFE_NO_PAD
            .decode(self.signature_b64)
            .map_err(|_| JwsError::InvalidBase64("signature"))
    }

    /// The bytes the signature covers: `header_b64 "." payload_b64`.
    #[must_use]
    pub fn signing_input(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_b64.len() + 1 + self.payload_b64.len());
        out.extend_from_slice(self.header_b64.as_bytes());
        out.push(b'.');
        out.extend_from_slice(self.payload_b64.as_bytes());
        out
    }
}

/// Cheap structural check used by the transport parser and pointer fetch
/// before any decoding happens.
#[must_use]
pub fn is_compact_jws(input: &str) -> bool {
    let mut segments = 0;
    for segment in input.split('.') {
        segments += 1;
        if segments > 3 || segment.is_empty() || !segment.bytes().all(is_base64url_byte) {
            return false;
        }
    }
    segments == 3
}

fn is_base64url_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}
