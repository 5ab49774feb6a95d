//! Fixed-window rate limiting with anonymous and API-keyed tiers.

use crate::config::RateTier;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::{Hash as _, Hasher as _};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::Instant;

const SHARDS: usize = 16;
const BUCKETS_PER_SHARD: usize = 4096;

/// How a client is identified for limiting purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    ApiKey(String),
    Anon(IpAddr),
}

impl ClientKey {
    fn cache_key(&self) -> String {
        match self {
            ClientKey::ApiKey(key) => format!("k:{key}"),
            ClientKey::Anon(ip) => format!("ip:{ip}"),
        }
    }
}

/// Outcome of one rate check, carrying everything the response headers need.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
    /// Present when denied.
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    window_start: Instant,
}

/// Sharded fixed-window counters; idle buckets fall out of each shard's LRU.
pub struct RateLimiter {
    shards: Vec<Mutex<LruCache<String, Bucket>>>,
    anon: RateTier,
    keyed: RateTier,
}

impl RateLimiter {
    #[must_use]
    pub fn new(anon: RateTier, keyed: RateTier) -> Self {
        let capacity = NonZeroUsize::new(BUCKETS_PER_SHARD).expect("nonzero");
        let shards = (0..SHARDS)
            .map(|_| Mutex::new(LruCache::new(capacity)))
            .collect();
        Self {
            shards,
            anon,
            keyed,
        }
    }

    /// Count this request against its client's window.
    pub fn check(&self, client: &ClientKey) -> RateLimitDecision {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &ClientKey, now: Instant) -> RateLimitDecision {
        let tier = match client {
            ClientKey::ApiKey(_) => self.keyed,
            ClientKey::Anon(_) => self.anon,
        };
        let key = client.cache_key();
        let shard = &self.shards[shard_index(&key)];
        let mut buckets = shard.lock();

        if !buckets.contains(&key) {
            buckets.push(
                key.clone(),
                Bucket {
                    count: 0,
                    window_start: now,
                },
            );
        }
        let bucket = buckets.get_mut(&key).expect("bucket present");
        if now.duration_since(bucket.window_start) >= tier.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        bucket.count = bucket.count.saturating_add(1);
        let elapsed = now.duration_since(bucket.window_start);
        let reset_secs = tier.window.saturating_sub(elapsed).as_secs().max(1);

        if bucket.count > tier.limit {
            RateLimitDecision {
                allowed: false,
                limit: tier.limit,
                remaining: 0,
                reset_secs,
                retry_after_secs: Some(reset_secs),
            }
        } else {
            RateLimitDecision {
                allowed: true,
                limit: tier.limit,
                remaining: tier.limit - bucket.count,
                reset_secs,
                retry_after_secs: None,
            }
        }
    }
}

fn shard_index(key: &str) -> usize {
    let mut hasher = std::hash::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARDS
}
