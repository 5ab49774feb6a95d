//! Canonical error codes and RFC 9457 Problem Details rendering.
//!
//! Every failure the gateway can emit is one of the codes below. A code maps
//! to exactly one HTTP status and one title; callers never surface raw parser
//! or crypto messages as status.

use serde::{Deserialize, Serialize};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

const PROBLEM_TYPE_BASE: &str = "https://peacprotocol.org/problems";

/// Closed set of canonical verification outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyCode {
    ReceiptMissing,
    ReceiptInvalid,
    ReceiptExpired,
    TapSignatureMissing,
    TapSignatureInvalid,
    TapTimeInvalid,
    TapKeyNotFound,
    TapReplayProtectionRequired,
    TapWindowTooLarge,
    TapTagUnknown,
    TapAlgorithmInvalid,
    IssuerNotAllowed,
    TapNonceReplay,
    RateLimited,
    ConfigIssuerAllowlistRequired,
    InternalError,
    PointerFetchBlocked,
    PointerTimeout,
    PointerTooLarge,
    PointerDigestMismatch,
    PointerFetchFailed,
    MalformedReceipt,
    InvalidTransport,
}

impl VerifyCode {
    /// All codes, for exhaustive mapping tests.
    pub const ALL: [VerifyCode; 23] = [
        VerifyCode::ReceiptMissing,
        VerifyCode::ReceiptInvalid,
        VerifyCode::ReceiptExpired,
        VerifyCode::TapSignatureMissing,
        VerifyCode::TapSignatureInvalid,
        VerifyCode::TapTimeInvalid,
        VerifyCode::TapKeyNotFound,
        VerifyCode::TapReplayProtectionRequired,
        VerifyCode::TapWindowTooLarge,
        VerifyCode::TapTagUnknown,
        VerifyCode::TapAlgorithmInvalid,
        VerifyCode::IssuerNotAllowed,
        VerifyCode::TapNonceReplay,
        VerifyCode::RateLimited,
        VerifyCode::ConfigIssuerAllowlistRequired,
        VerifyCode::InternalError,
        VerifyCode::PointerFetchBlocked,
        VerifyCode::PointerTimeout,
        VerifyCode::PointerTooLarge,
        VerifyCode::PointerDigestMismatch,
        VerifyCode::PointerFetchFailed,
        VerifyCode::MalformedReceipt,
        VerifyCode::InvalidTransport,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyCode::ReceiptMissing => "E_RECEIPT_MISSING",
            VerifyCode::ReceiptInvalid => "E_RECEIPT_INVALID",
            VerifyCode::ReceiptExpired => "E_RECEIPT_EXPIRED",
            VerifyCode::TapSignatureMissing => "E_TAP_SIGNATURE_MISSING",
            VerifyCode::TapSignatureInvalid => "E_TAP_SIGNATURE_INVALID",
            VerifyCode::TapTimeInvalid => "E_TAP_TIME_INVALID",
            VerifyCode::TapKeyNotFound => "E_TAP_KEY_NOT_FOUND",
            VerifyCode::TapReplayProtectionRequired => "E_TAP_REPLAY_PROTECTION_REQUIRED",
            VerifyCode::TapWindowTooLarge => "E_TAP_WINDOW_TOO_LARGE",
            VerifyCode::TapTagUnknown => "E_TAP_TAG_UNKNOWN",
            VerifyCode::TapAlgorithmInvalid => "E_TAP_ALGORITHM_INVALID",
            VerifyCode::IssuerNotAllowed => "E_ISSUER_NOT_ALLOWED",
            VerifyCode::TapNonceReplay => "E_TAP_NONCE_REPLAY",
            VerifyCode::RateLimited => "E_RATE_LIMITED",
            VerifyCode::ConfigIssuerAllowlistRequired => "E_CONFIG_ISSUER_ALLOWLIST_REQUIRED",
            VerifyCode::InternalError => "E_INTERNAL_ERROR",
            VerifyCode::PointerFetchBlocked => "E_VERIFY_POINTER_FETCH_BLOCKED",
            VerifyCode::PointerTimeout => "E_VERIFY_POINTER_TIMEOUT",
            VerifyCode::PointerTooLarge => "E_VERIFY_POINTER_TOO_LARGE",
            VerifyCode::PointerDigestMismatch => "E_VERIFY_POINTER_DIGEST_MISMATCH",
            VerifyCode::PointerFetchFailed => "E_VERIFY_POINTER_FETCH_FAILED",
            VerifyCode::MalformedReceipt => "E_VERIFY_MALFORMED_RECEIPT",
            VerifyCode::InvalidTransport => "E_VERIFY_INVALID_TRANSPORT",
        }
    }

    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            VerifyCode::ReceiptMissing | VerifyCode::ReceiptInvalid | VerifyCode::ReceiptExpired => {
                402
            }
            VerifyCode::TapSignatureMissing
            | VerifyCode::TapSignatureInvalid
            | VerifyCode::TapTimeInvalid
            | VerifyCode::TapKeyNotFound
            | VerifyCode::TapReplayProtectionRequired => 401,
            VerifyCode::TapWindowTooLarge
            | VerifyCode::TapTagUnknown
            | VerifyCode::TapAlgorithmInvalid
            | VerifyCode::MalformedReceipt
            | VerifyCode::InvalidTransport => 400,
            VerifyCode::IssuerNotAllowed => 403,
            VerifyCode::TapNonceReplay => 409,
            VerifyCode::RateLimited => 429,
            VerifyCode::ConfigIssuerAllowlistRequired | VerifyCode::InternalError => 500,
            VerifyCode::PointerFetchBlocked | VerifyCode::PointerFetchFailed => 502,
            VerifyCode::PointerTimeout => 504,
            VerifyCode::PointerTooLarge => 413,
            VerifyCode::PointerDigestMismatch => 422,
        }
    }

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            VerifyCode::ReceiptMissing => "Receipt Missing",
            VerifyCode::ReceiptInvalid => "Receipt Invalid",
            VerifyCode::ReceiptExpired => "Receipt Expired",
            VerifyCode::TapSignatureMissing => "Request Signature Missing",
            VerifyCode::TapSignatureInvalid => "Request Signature Invalid",
            VerifyCode::TapTimeInvalid => "Request Signature Time Invalid",
            VerifyCode::TapKeyNotFound => "Signing Key Not Found",
            VerifyCode::TapReplayProtectionRequired => "Replay Protection Required",
            VerifyCode::TapWindowTooLarge => "Signature Window Too Large",
            VerifyCode::TapTagUnknown => "Unknown Signature Tag",
            VerifyCode::TapAlgorithmInvalid => "Signature Algorithm Invalid",
            VerifyCode::IssuerNotAllowed => "Issuer Not Allowed",
            VerifyCode::TapNonceReplay => "Nonce Replay Detected",
            VerifyCode::RateLimited => "Rate Limit Exceeded",
            VerifyCode::ConfigIssuerAllowlistRequired => "Issuer Allowlist Required",
            VerifyCode::InternalError => "Internal Error",
            VerifyCode::PointerFetchBlocked => "Pointer Fetch Blocked",
            VerifyCode::PointerTimeout => "Pointer Fetch Timed Out",
            VerifyCode::PointerTooLarge => "Pointer Body Too Large",
            VerifyCode::PointerDigestMismatch => "Pointer Digest Mismatch",
            VerifyCode::PointerFetchFailed => "Pointer Fetch Failed",
            VerifyCode::MalformedReceipt => "Malformed Receipt",
            VerifyCode::InvalidTransport => "Invalid Receipt Transport",
        }
    }

    /// The single canonical builder for problem `type` URIs.
    #[must_use]
    pub fn type_uri(self) -> String {
        format!("{PROBLEM_TYPE_BASE}/{}", self.as_str())
    }
}

impl std::fmt::Display for VerifyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RFC 9457 Problem Details response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
}

impl ProblemDetails {
    #[must_use]
    pub fn new(code: VerifyCode) -> Self {
        Self {
            type_uri: code.type_uri(),
            title: code.title().to_owned(),
            status: code.http_status(),
            detail: None,
            instance: None,
            code: code.as_str().to_owned(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_has_consistent_mapping() {
        for code in VerifyCode::ALL {
            assert!(code.as_str().starts_with("E_"), "{code}");
            assert!(!code.title().is_empty());
            let status = code.http_status();
            assert!((400..=504).contains(&status), "{code} -> {status}");
            assert_eq!(
                code.type_uri(),
                format!("https://peacprotocol.org/problems/{}", code.as_str())
            );
        }
    }

    #[test]
    fn table_statuses_match_taxonomy() {
        assert_eq!(VerifyCode::ReceiptMissing.http_status(), 402);
        assert_eq!(VerifyCode::TapSignatureMissing.http_status(), 401);
        assert_eq!(VerifyCode::TapWindowTooLarge.http_status(), 400);
        assert_eq!(VerifyCode::IssuerNotAllowed.http_status(), 403);
        assert_eq!(VerifyCode::TapNonceReplay.http_status(), 409);
        assert_eq!(VerifyCode::ConfigIssuerAllowlistRequired.http_status(), 500);
        assert_eq!(VerifyCode::PointerFetchBlocked.http_status(), 502);
        assert_eq!(VerifyCode::PointerTimeout.http_status(), 504);
        assert_eq!(VerifyCode::PointerTooLarge.http_status(), 413);
        assert_eq!(VerifyCode::PointerDigestMismatch.http_status(), 422);
    }

    #[test]
    fn problem_details_serializes_rfc9457_shape() {
        let p = ProblemDetails::new(VerifyCode::IssuerNotAllowed)
            .with_detail("issuer https://evil.example.com is not allowlisted")
            .with_instance("/api/v1/verify");
        let v = serde_json::to_value(&p).expect("serialize problem");
        assert_eq!(
            v["type"],
            "https://peacprotocol.org/problems/E_ISSUER_NOT_ALLOWED"
        );
        assert_eq!(v["title"], "Issuer Not Allowed");
        assert_eq!(v["status"], 403);
        assert_eq!(v["code"], "E_ISSUER_NOT_ALLOWED");
        assert_eq!(v["instance"], "/api/v1/verify");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let v = serde_json::to_value(ProblemDetails::new(VerifyCode::ReceiptMissing))
            .expect("serialize problem");
        let obj = v.as_object().expect("object");
        assert!(!obj.contains_key("detail"));
        assert!(!obj.contains_key("instance"));
    }
}
