//! tollgate_ratelimit
//!
//! Fixed-window request counting keyed by (client, route class, window
//! start). Runs BEFORE authentication so a denial reveals nothing about
//! token validity. The window store is a trait so deployments can swap
//! the in-process map for an external key-value store with TTL puts;
//! the in-process store is the default and only built-in backend.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Extra lifetime granted to a bucket past its window end before the
/// sweep may evict it.
const BUCKET_GRACE_MS: u64 = 5_000;

/// Bucket-count threshold that triggers an opportunistic sweep.
const SWEEP_THRESHOLD: usize = 1_024;

/// The second key dimension of rate limiting. Unknown routes fall into
/// `Global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    Chat,
    Memory,
    Agents,
    Global,
}

impl RouteClass {
    pub fn classify(path: &str) -> Self {
        if path.starts_with("/v1/") {
            RouteClass::Chat
        } else if path == "/memory" || path.starts_with("/memory/") {
            RouteClass::Memory
        } else if path == "/agents" || path.starts_with("/agents/") {
            RouteClass::Agents
        } else {
            RouteClass::Global
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Chat => "chat",
            RouteClass::Memory => "memory",
            RouteClass::Agents => "agents",
            RouteClass::Global => "global",
        }
    }
}

/// Per-class limits over a shared window length.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub window_ms: u64,
    pub chat: u32,
    pub memory: u32,
    pub agents: u32,
    pub global: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            chat: 60,
            memory: 120,
            agents: 30,
            global: 200,
        }
    }
}

impl LimitConfig {
    fn limit_for(&self, class: RouteClass) -> u32 {
        match class {
            RouteClass::Chat => self.chat,
            RouteClass::Memory => self.memory,
            RouteClass::Agents => self.agents,
            RouteClass::Global => self.global,
        }
    }
}

/// Outcome of one limiter check. `remaining`/`reset_unix_s` feed the
/// `X-RateLimit-*` headers; `retry_after_s` is set only on denial.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_unix_s: u64,
    pub retry_after_s: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub client: String,
    pub class: RouteClass,
    pub window_start_ms: u64,
}

/// Storage seam: atomically bump a window counter, honoring the bucket's
/// absolute expiry. External stores implement this as a TTL'd
/// read-modify-write.
pub trait WindowStore: Send + Sync {
    /// Increment and return the post-increment count for `key`. The entry
    /// must expire (and never be resurrected) after `expires_at_ms`.
    fn incr(&self, key: WindowKey, expires_at_ms: u64, now_ms: u64) -> u32;
}

struct Bucket {
    count: u32,
    expires_at_ms: u64,
}

/// In-process window store: mutexed map with an opportunistic sweep.
/// The sweep runs when the map grows past a threshold and is
/// O(buckets_expired) amortized; eviction of an expired bucket can race
/// an insert only for the *current* window key, which by construction
/// has not expired.
#[derive(Default)]
pub struct MemoryWindowStore {
    buckets: Mutex<HashMap<WindowKey, Bucket>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl WindowStore for MemoryWindowStore {
    fn incr(&self, key: WindowKey, expires_at_ms: u64, now_ms: u64) -> u32 {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if buckets.len() > SWEEP_THRESHOLD {
            buckets.retain(|_, b| b.expires_at_ms > now_ms);
        }
        let bucket = buckets.entry(key).or_insert(Bucket {
            count: 0,
            expires_at_ms,
        });
        bucket.count = bucket.count.saturating_add(1);
        bucket.count
    }
}

/// Fixed-window limiter front door.
pub struct RateLimiter<S: WindowStore = MemoryWindowStore> {
    config: LimitConfig,
    store: S,
}

impl RateLimiter<MemoryWindowStore> {
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            store: MemoryWindowStore::new(),
        }
    }
}

impl<S: WindowStore> RateLimiter<S> {
    pub fn with_store(config: LimitConfig, store: S) -> Self {
        Self { config, store }
    }

    /// Check (and count) one request from `client` on `class` at wall
    /// time `now_ms` (epoch milliseconds).
    pub fn check(&self, client: &str, class: RouteClass, now_ms: u64) -> Decision {
        let window_ms = self.config.window_ms.max(1);
        let window_start = (now_ms / window_ms) * window_ms;
        let window_end = window_start + window_ms;
        let limit = self.config.limit_for(class);

        let key = WindowKey {
            client: client.to_string(),
            class,
            window_start_ms: window_start,
        };
        let count = self
            .store
            .incr(key, window_end + BUCKET_GRACE_MS, now_ms);

        let reset_unix_s = window_end / 1000;
        if count > limit {
            // ceil((window_end - now) / 1000)
            let retry_after_s = (window_end - now_ms).div_ceil(1000).max(1);
            Decision {
                allowed: false,
                limit,
                remaining: 0,
                reset_unix_s,
                retry_after_s,
            }
        } else {
            Decision {
                allowed: true,
                limit,
                remaining: limit - count,
                reset_unix_s,
                retry_after_s: 0,
            }
        }
    }
}
