//! SSRF-safe outbound HTTP for the PEAC gateway.
//!
//! This crate is policy + mechanism only: it knows nothing about receipts or
//! keys. `peac-verify` drives it for pointer bodies and JWKS documents.

mod fetch;
mod safety;

pub use fetch::{FetchError, FetchOptions, FetchedBody, SafeFetcher};
pub use safety::FetchPolicy;
