//! Receipt transport detection: inline header, pointer header, or JSON body.

use crate::jws::is_compact_jws;
use crate::problem::VerifyCode;
use crate::sfv::{self, BareItem, MemberValue};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const RECEIPT_HEADER: &str = "peac-receipt";
pub const RECEIPT_POINTER_HEADER: &str = "peac-receipt-pointer";

const BODY_RECEIPT_KEY: &str = "peac_receipt";
const BODY_RECEIPTS_KEY: &str = "peac_receipts";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid receipt transport: {0}")]
    InvalidTransport(String),
    #[error("malformed receipt: {0}")]
    MalformedReceipt(String),
    #[error("pointer URL is not https")]
    PointerNotHttps,
}

impl TransportError {
    #[must_use]
    pub fn code(&self) -> VerifyCode {
        match self {
            TransportError::InvalidTransport(_) => VerifyCode::InvalidTransport,
            TransportError::MalformedReceipt(_) => VerifyCode::MalformedReceipt,
            TransportError::PointerNotHttps => VerifyCode::PointerFetchBlocked,
        }
    }
}

/// Parsed pointer header: a digest commitment plus the URL to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptPointer {
    /// Lowercase hex SHA-256 of the pointed-to body.
    pub digest_hex: String,
    pub url: String,
    /// Captured `ext_*` parameters; forward-compatible and untrusted.
    pub extensions: Vec<(String, String)>,
}

impl ReceiptPointer {
    /// Re-serialize to the header form. Parsing the result yields an equal
    /// pointer (round-trip property).
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let mut out = format!(
            "sha256={}, url={}",
            sfv::serialize_string(&self.digest_hex),
            sfv::serialize_string(&self.url)
        );
        for (key, value) in &self.extensions {
            out.push_str(", ");
            out.push_str(key);
            out.push('=');
            out.push_str(&sfv::serialize_string(value));
        }
        out
    }
}

/// Which of the three shapes carried the receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptTransport {
    Header { jws: String },
    Pointer(ReceiptPointer),
    Body { receipts: Vec<String> },
}

/// Find the receipt among the request's transports.
///
/// `headers` are the as-received (name, value) pairs; names are matched
/// case-insensitively. `body` is the already-decoded JSON body, if any.
/// Precedence is inline header, then pointer header, then body; lower-
/// precedence transports are ignored, never merged.
pub fn detect(
    headers: &[(String, String)],
    body: Option<&Value>,
) -> Result<Option<ReceiptTransport>, TransportError> {
    let inline: Vec<&str> = header_values(headers, RECEIPT_HEADER).collect();
    match inline.as_slice() {
        [] => {}
        [value] => {
            if value.contains(',') {
                return Err(TransportError::InvalidTransport(
                    "PEAC-Receipt must be single-valued".into(),
                ));
            }
            let value = value.trim();
            if !is_compact_jws(value) {
                return Err(TransportError::MalformedReceipt(
                    "PEAC-Receipt is not a compact JWS".into(),
                ));
            }
            return Ok(Some(ReceiptTransport::Header {
                jws: value.to_owned(),
            }));
        }
        _ => {
            return Err(TransportError::InvalidTransport(
                "PEAC-Receipt must be single-valued".into(),
            ));
        }
    }

    let pointers: Vec<&str> = header_values(headers, RECEIPT_POINTER_HEADER).collect();
    match pointers.as_slice() {
        [] => {}
        [value] => return parse_pointer(value).map(|p| Some(ReceiptTransport::Pointer(p))),
        _ => {
            return Err(TransportError::InvalidTransport(
                "PEAC-Receipt-Pointer must be single-valued".into(),
            ));
        }
    }

    if let Some(body) = body
        && let Some(transport) = detect_body(body)?
    {
        return Ok(Some(transport));
    }

    Ok(None)
}

/// Parse a pointer header value.
pub fn parse_pointer(value: &str) -> Result<ReceiptPointer, TransportError> {
    let members = sfv::parse_dictionary(value)
        .map_err(|e| TransportError::InvalidTransport(format!("pointer header: {e}")))?;

    let mut digest_hex: Option<String> = None;
    let mut url: Option<String> = None;
    let mut extensions = Vec::new();

    for (key, member) in members {
        let MemberValue::Item(item) = &member.value else {
            return Err(TransportError::InvalidTransport(format!(
                "pointer key {key:?} must be a string"
            )));
        };
        match key.as_str() {
            "sha256" => {
                let Some(s) = item.as_string() else {
                    return Err(TransportError::InvalidTransport(
                        "sha256 must be a string".into(),
                    ));
                };
                if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
                    return Err(TransportError::InvalidTransport(
                        "sha256 must be 64 lowercase hex characters".into(),
                    ));
                }
                digest_hex = Some(s.to_owned());
            }
            "url" => {
                let Some(s) = item.as_string() else {
                    return Err(TransportError::InvalidTransport("url must be a string".into()));
                };
                let parsed = Url::parse(s)
                    .map_err(|e| TransportError::InvalidTransport(format!("pointer url: {e}")))?;
                if parsed.scheme() != "https" {
                    return Err(TransportError::PointerNotHttps);
                }
                url = Some(s.to_owned());
            }
            ext if ext.starts_with("ext_") => {
                let value = match item {
                    BareItem::String(s) => s.clone(),
                    BareItem::Token(t) => t.clone(),
                    BareItem::Integer(i) => i.to_string(),
                    BareItem::Boolean(b) => b.to_string(),
                    BareItem::ByteSequence(_) => {
                        return Err(TransportError::InvalidTransport(format!(
                            "pointer extension {key:?} must be a string"
                        )));
                    }
                };
                extensions.push((key.clone(), value));
            }
            _ => {
                return Err(TransportError::InvalidTransport(format!(
                    "unknown pointer key {key:?}"
                )));
            }
        }
    }

    match (digest_hex, url) {
        (Some(digest_hex), Some(url)) => Ok(ReceiptPointer {
            digest_hex,
            url,
            extensions,
        }),
        _ => Err(TransportError::InvalidTransport(
            "pointer requires both sha256 and url".into(),
        )),
    }
}

fn detect_body(body: &Value) -> Result<Option<ReceiptTransport>, TransportError> {
    let Some(obj) = body.as_object() else {
        return Ok(None);
    };

    // The plural key wins over the singular one.
    if let Some(list) = obj.get(BODY_RECEIPTS_KEY) {
        let Some(items) = list.as_array() else {
            return Err(TransportError::InvalidTransport(
                "peac_receipts must be an array".into(),
            ));
        };
        if items.is_empty() {
            return Err(TransportError::InvalidTransport(
                "peac_receipts must not be empty".into(),
            ));
        }
        let mut receipts = Vec::with_capacity(items.len());
        for item in items {
            let Some(s) = item.as_str() else {
                return Err(TransportError::InvalidTransport(
                    "peac_receipts entries must be strings".into(),
                ));
            };
            if !is_compact_jws(s) {
                return Err(TransportError::MalformedReceipt(
                    "peac_receipts entry is not a compact JWS".into(),
                ));
            }
            receipts.push(s.to_owned());
        }
        return Ok(Some(ReceiptTransport::Body { receipts }));
    }

    if let Some(single) = obj.get(BODY_RECEIPT_KEY) {
        let Some(s) = single.as_str() else {
            return Err(TransportError::InvalidTransport(
                "peac_receipt must be a string".into(),
            ));
        };
        if !is_compact_jws(s) {
            return Err(TransportError::MalformedReceipt(
                "peac_receipt is not a compact JWS".into(),
            ));
        }
        return Ok(Some(ReceiptTransport::Body {
            receipts: vec![s.to_owned()],
        }));
    }

    Ok(None)
}

fn header_values<'a>(
    headers: &'a [(String, String)],
    name: &'a str,
) -> impl Iterator<Item = &'a str> {
    headers
        .iter()
        .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
