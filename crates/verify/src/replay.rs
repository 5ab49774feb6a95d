//! Nonce replay detection.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("replay store failure: {0}")]
pub struct ReplayError(pub String);

/// Atomic test-and-set over `(issuer, keyid, nonce)` tuples.
///
/// Implementations must never silently skip a check: any internal failure
/// surfaces as `ReplayError`, which the decision engine treats as a refusal.
pub trait ReplayStore: Send + Sync {
    /// Returns `true` iff the tuple was already present and unexpired.
    /// On first observation the tuple is inserted with the given TTL.
    fn seen(
        &self,
        issuer: &str,
        keyid: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<bool, ReplayError>;

    /// "best-effort" for in-process stores, "strong" for shared ones.
    fn kind(&self) -> &'static str;
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct ReplayKey {
    issuer: String,
    keyid: String,
    nonce: String,
}

/// Bounded in-process store: strict access-order LRU plus per-entry expiry.
pub struct InMemoryReplayStore {
    entries: Mutex<LruCache<ReplayKey, Instant>>,
}

impl InMemoryReplayStore {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl ReplayStore for InMemoryReplayStore {
    fn seen(
        &self,
        issuer: &str,
        keyid: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<bool, ReplayError> {
        let key = ReplayKey {
            issuer: issuer.to_owned(),
            keyid: keyid.to_owned(),
            nonce: nonce.to_owned(),
        };
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // `get` promotes the entry to MRU.
        if let Some(expires_at) = entries.get(&key) {
            if *expires_at > now {
                return Ok(true);
            }
            entries.pop(&key);
        }

        entries.push(key, now + ttl);
        Ok(false)
    }

    fn kind(&self) -> &'static str {
        "best-effort"
    }
}
