//! Core verification for the PEAC gateway.
//!
//! This crate is policy-free and transport-agnostic: it knows how to parse the
//! receipt transports, verify signed receipts and signed HTTP requests, resolve
//! issuer keys, and detect nonce replay. Enforcement (modes, rate limits,
//! bypass paths) lives in `peac-gateway`.

pub mod claims;
pub mod httpsig;
pub mod jwks;
pub mod jws;
pub mod pointer;
pub mod problem;
pub mod receipt;
pub mod replay;
pub mod sfv;
pub mod transport;

/// Seconds since the UNIX epoch. A clock before the epoch reads as zero,
/// which fails time checks closed.
pub(crate) fn now_unix_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
