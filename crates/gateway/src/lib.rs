//! PEAC verification gateway.
//!
//! Sits in front of an origin (or answers directly) and decides, per request,
//! whether the caller presented a valid signed receipt, a valid signed
//! request, or neither. `peac-verify` does the cryptography; this crate owns
//! policy: modes, bypass paths, rate limits, and response rendering.

pub mod bypass;
pub mod config;
pub mod engine;
pub mod forward;
pub mod rate_limit;
pub mod respond;
pub mod server;
