//! Receipt claim schema and structural variant discrimination.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("iss is not an absolute URL")]
    InvalidIssuerUrl,
    #[error("aud is not an absolute URL")]
    InvalidAudienceUrl,
    #[error("sub must be a non-empty URI")]
    InvalidSubject,
    #[error("rid is not a UUIDv7")]
    InvalidReceiptId,
    #[error("amt must be a non-negative integer in minor units")]
    InvalidAmount,
    #[error("cur must be a three-letter ISO 4217 code")]
    InvalidCurrency,
    #[error("payment rail and reference must be non-empty")]
    InvalidPayment,
    #[error("payment network must be a CAIP-2 identifier")]
    InvalidNetwork,
    #[error("amt, cur and payment must all be present or all be absent")]
    PartialPayment,
}

/// Settlement descriptor carried by commerce receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDescriptor {
    pub rail: String,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Payload of a signed receipt.
///
/// Both variants share this envelope; `amt`/`cur`/`payment` are what makes a
/// receipt a commerce receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub rid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cur: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptVariant {
    Commerce,
    Attestation,
}

impl ReceiptClaims {
    /// Validate field shapes and discriminate the variant.
    pub fn validate(&self) -> Result<ReceiptVariant, ClaimsError> {
        let iss = Url::parse(&self.iss).map_err(|_| ClaimsError::InvalidIssuerUrl)?;
        if !iss.has_host() {
            return Err(ClaimsError::InvalidIssuerUrl);
        }
        let aud = Url::parse(&self.aud).map_err(|_| ClaimsError::InvalidAudienceUrl)?;
        if !aud.has_host() {
            return Err(ClaimsError::InvalidAudienceUrl);
        }
        if self.sub.trim().is_empty() {
            return Err(ClaimsError::InvalidSubject);
        }
        let rid = uuid::Uuid::parse_str(&self.rid).map_err(|_| ClaimsError::InvalidReceiptId)?;
        if rid.get_version_num() != 7 {
            return Err(ClaimsError::InvalidReceiptId);
        }

        match (&self.amt, &self.cur, &self.payment) {
            (Some(amt), Some(cur), Some(payment)) => {
                if *amt < 0 {
                    return Err(ClaimsError::InvalidAmount);
                }
                if cur.len() != 3 || !cur.bytes().all(|b| b.is_ascii_uppercase()) {
                    return Err(ClaimsError::InvalidCurrency);
                }
                if payment.rail.is_empty() || payment.reference.is_empty() {
                    return Err(ClaimsError::InvalidPayment);
                }
                if let Some(network) = &payment.network
                    && !is_caip2(network)
                {
                    return Err(ClaimsError::InvalidNetwork);
                }
                Ok(ReceiptVariant::Commerce)
            }
            (None, None, None) => Ok(ReceiptVariant::Attestation),
            _ => Err(ClaimsError::PartialPayment),
        }
    }

    /// Origin of the issuer URL (`scheme://host[:port]`), used to key the
    /// JWKS cache and the allowlist check.
    pub fn issuer_origin(&self) -> Result<String, ClaimsError> {
        let url = Url::parse(&self.iss).map_err(|_| ClaimsError::InvalidIssuerUrl)?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(ClaimsError::InvalidIssuerUrl);
        }
        Ok(origin.ascii_serialization())
    }
}

/// CAIP-2: `namespace:reference`, namespace `[-a-z0-9]{3,8}`,
/// reference `[-_a-zA-Z0-9]{1,32}`.
fn is_caip2(s: &str) -> bool {
    let Some((namespace, reference)) = s.split_once(':') else {
        return false;
    };
    (3..=8).contains(&namespace.len())
        && namespace
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && (1..=32).contains(&reference.len())
        && reference
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
