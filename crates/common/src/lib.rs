//! tollgate_common
//!
//! Canonical JSON serialization + SHA-256 hashing utilities shared by the
//! chained logs (audit, memory, task lineage).
//! - Hashes are computed over canonical bytes (sorted keys, no whitespace).
//! - Chain digests bind predecessor hash, content, and timestamp.
//! - The monotone clock never regresses within a process.
//!
//! IMPORTANT: Do not "pretty print". The canonicalization used on append
//! MUST be the canonicalization used on verify.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Sentinel `prev_hash` of the first record in every chain.
pub const GENESIS: &str = "GENESIS";

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize to a canonical JSON string:
/// - stable key ordering (enforced via Value roundtrip)
/// - no whitespace
/// - UTF-8
pub fn canonical_json_string<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_string(&sorted)?)
}

/// Return the lowercase 64-hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// First 16 hex characters of the SHA-256 of `bytes`. Used by redactive
/// erasure markers, where only a short fingerprint of the original
/// content may survive.
pub fn sha256_hex_short(bytes: &[u8]) -> String {
    let mut h = sha256_hex(bytes);
    h.truncate(16);
    h
}

/// Digest of a chained record: SHA-256 over
/// `prev_hash ":" canonical_content ":" timestamp_ns`.
pub fn chain_digest(prev_hash: &str, canonical_content: &str, timestamp_ns: u64) -> String {
    sha256_hex(format!("{prev_hash}:{canonical_content}:{timestamp_ns}").as_bytes())
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

/// Epoch-nanosecond clock that never moves backwards. If the wall clock
/// regresses (NTP step, VM migration), the next read is clamped to
/// `last + 1` so chain timestamps stay strictly ordered.
#[derive(Debug, Default)]
pub struct MonotoneClock {
    last_ns: AtomicU64,
}

impl MonotoneClock {
    pub fn new() -> Self {
        Self { last_ns: AtomicU64::new(0) }
    }

    /// Seed the clock from a replayed journal so appends after restart
    /// stay ahead of persisted records.
    pub fn advance_to(&self, ns: u64) {
        self.last_ns.fetch_max(ns, Ordering::SeqCst);
    }

    pub fn now_ns(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut prev = self.last_ns.load(Ordering::SeqCst);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self.last_ns.compare_exchange_weak(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}
