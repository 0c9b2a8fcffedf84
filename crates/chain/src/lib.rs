//! tollgate_chain
//!
//! Append-only record chain with SHA-256 linkage. One `Chain` instance
//! backs each of the audit log, the memory chain, and the task lineage —
//! they are distinct chains with distinct GENESIS origins so one
//! subsystem's appends can never invalidate another's verification.
//!
//! - Each record links to its predecessor: `hash = sha256(prev:content:ts)`
//! - Erasure replaces content with `[ERASED:<16-hex>]` and never rewrites
//!   `hash`/`prev_hash`, so successors keep verifying.
//! - Optional JSONL journal, one canonical record per line, replayed on
//!   open. Erasures are journaled as overlay lines for the same hash.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tollgate_common::{
    canonical_json_string, chain_digest, sha256_hex_short, MonotoneClock, GENESIS,
};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] tollgate_common::CanonError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecord {
    pub hash: String,      // 64-hex
    pub prev_hash: String, // predecessor hash, or "GENESIS" at index 0
    pub timestamp_ns: u64, // epoch nanoseconds, non-decreasing per chain
    pub content: JsonValue,
    pub erased: bool,
}

/// Filter for `Chain::list`. Equality on top-level content fields;
/// erased records are excluded unless explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub content_fields: Vec<(String, JsonValue)>,
    pub include_erased: bool,
}

impl ListFilter {
    pub fn field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.content_fields.push((key.into(), value.into()));
        self
    }

    pub fn with_erased(mut self) -> Self {
        self.include_erased = true;
        self
    }

    fn matches(&self, rec: &ChainRecord) -> bool {
        if rec.erased && !self.include_erased {
            return false;
        }
        self.content_fields
            .iter()
            .all(|(k, want)| rec.content.get(k) == Some(want))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub valid: bool,
    /// Records ever appended, including any trimmed from memory.
    pub total: u64,
    /// Records actually walked by this verification pass.
    pub checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid: Option<String>,
}

struct ChainInner {
    records: VecDeque<ChainRecord>,
    /// Records trimmed from the front in bounded mode.
    dropped: u64,
    last_hash: String,
    journal: Option<File>,
    cap: Option<usize>,
}

/// A single hash chain. Append is serialized: the critical section covers
/// reading `prev_hash`, stamping the timestamp, computing the digest,
/// pushing, and the journal line write, so on-disk order equals in-memory
/// order. Readers take the same lock briefly and clone a snapshot.
pub struct Chain {
    inner: Mutex<ChainInner>,
    clock: MonotoneClock,
}

impl Chain {
    /// Unbounded in-memory chain (journal-less). Used by tests and by
    /// deployments that accept losing history on restart.
    pub fn in_memory() -> Self {
        Self::build(None, None)
    }

    /// In-memory chain retaining only the `cap` most recent records.
    /// The audit log runs in this mode when no journal is configured.
    pub fn bounded(cap: usize) -> Self {
        Self::build(None, Some(cap))
    }

    /// Journaled chain: replays existing lines, seeds `prev_hash` and the
    /// clock from the last valid record, then appends to the same file.
    /// A trailing partial or invalid line (torn write on crash) stops the
    /// replay with a warning rather than failing startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut records: VecDeque<ChainRecord> = VecDeque::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let rec: ChainRecord = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(
                            line = idx + 1,
                            error = %e,
                            path = %path.display(),
                            "journal replay stopped at invalid line"
                        );
                        break;
                    }
                };
                if rec.erased {
                    // Erasure overlay: rewrite the already-replayed record
                    // in place instead of appending a duplicate.
                    if let Some(existing) = records.iter_mut().find(|r| r.hash == rec.hash) {
                        *existing = rec;
                        continue;
                    }
                }
                records.push_back(rec);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let chain = Self::build(Some(file), None);
        {
            let mut inner = chain.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = records.back() {
                inner.last_hash = last.hash.clone();
                chain.clock.advance_to(last.timestamp_ns);
            }
            inner.records = records;
        }
        Ok(chain)
    }

    fn build(journal: Option<File>, cap: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(ChainInner {
                records: VecDeque::new(),
                dropped: 0,
                last_hash: GENESIS.to_string(),
                journal,
                cap,
            }),
            clock: MonotoneClock::new(),
        }
    }

    /// Append a content payload, returning the stored record.
    pub fn append(&self, content: JsonValue) -> Result<ChainRecord, ChainError> {
        let canonical = canonical_json_string(&content)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let timestamp_ns = self.clock.now_ns();
        let prev_hash = inner.last_hash.clone();
        let hash = chain_digest(&prev_hash, &canonical, timestamp_ns);
        let record = ChainRecord {
            hash: hash.clone(),
            prev_hash,
            timestamp_ns,
            content,
            erased: false,
        };

        Self::journal_line(&mut inner, &record)?;
        inner.last_hash = hash;
        inner.records.push_back(record.clone());
        if let Some(cap) = inner.cap {
            while inner.records.len() > cap {
                inner.records.pop_front();
                inner.dropped += 1;
            }
        }
        Ok(record)
    }

    fn journal_line(inner: &mut ChainInner, record: &ChainRecord) -> Result<(), ChainError> {
        if let Some(file) = inner.journal.as_mut() {
            let line = canonical_json_string(record)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(())
    }

    /// Records matching `filter`, newest last, plus the total match count
    /// before pagination.
    pub fn list(
        &self,
        filter: &ListFilter,
        limit: usize,
        offset: usize,
    ) -> (Vec<ChainRecord>, usize) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let matches: Vec<&ChainRecord> =
            inner.records.iter().filter(|r| filter.matches(r)).collect();
        let total = matches.len();
        let page = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    pub fn get(&self, hash: &str) -> Option<ChainRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.iter().find(|r| r.hash == hash).cloned()
    }

    /// Newest record whose content field `key` equals `value`.
    pub fn find_latest(&self, key: &str, value: &JsonValue) -> Option<ChainRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .records
            .iter()
            .rev()
            .find(|r| r.content.get(key) == Some(value))
            .cloned()
    }

    /// Redactive erasure: replace the record's content with
    /// `[ERASED:<16-hex-of-original>]`, keep `hash`/`prev_hash` intact,
    /// journal the overlay. Returns false when the hash is unknown.
    pub fn erase(&self, hash: &str) -> Result<bool, ChainError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let idx = match inner.records.iter().position(|r| r.hash == hash) {
            Some(i) => i,
            None => return Ok(false),
        };
        if inner.records[idx].erased {
            return Ok(true);
        }
        let canonical = canonical_json_string(&inner.records[idx].content)?;
        let marker = format!("[ERASED:{}]", sha256_hex_short(canonical.as_bytes()));
        inner.records[idx].content = JsonValue::String(marker);
        inner.records[idx].erased = true;
        let overlay = inner.records[idx].clone();
        Self::journal_line(&mut inner, &overlay)?;
        Ok(true)
    }

    /// Walk the retained records, checking predecessor linkage for every
    /// record and recomputing the digest of non-erased records. Stops at
    /// the first deviation.
    pub fn verify(&self) -> VerifyReport {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = inner.dropped + inner.records.len() as u64;
        let mut checked = 0u64;
        let mut expected_prev: Option<&str> = if inner.dropped == 0 {
            Some(GENESIS)
        } else {
            // Bounded mode trimmed the head; linkage resumes at the first
            // retained record's own prev_hash.
            None
        };

        for rec in inner.records.iter() {
            if let Some(expected) = expected_prev {
                if rec.prev_hash != expected {
                    return VerifyReport {
                        valid: false,
                        total,
                        checked,
                        first_invalid: Some(rec.hash.clone()),
                    };
                }
            }
            if !rec.erased {
                let canonical = match canonical_json_string(&rec.content) {
                    Ok(c) => c,
                    Err(_) => {
                        return VerifyReport {
                            valid: false,
                            total,
                            checked,
                            first_invalid: Some(rec.hash.clone()),
                        }
                    }
                };
                let recomputed = chain_digest(&rec.prev_hash, &canonical, rec.timestamp_ns);
                if recomputed != rec.hash {
                    return VerifyReport {
                        valid: false,
                        total,
                        checked,
                        first_invalid: Some(rec.hash.clone()),
                    };
                }
            }
            checked += 1;
            expected_prev = Some(&rec.hash);
        }

        VerifyReport {
            valid: true,
            total,
            checked,
            first_invalid: None,
        }
    }

    /// Number of records ever appended (retained + trimmed).
    pub fn len(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.dropped + inner.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_hash(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_hash.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_link_and_verify() {
        let chain = Chain::in_memory();
        for i in 0..5 {
            chain.append(json!({"n": i})).unwrap();
        }
        let report = chain.verify();
        assert!(report.valid);
        assert_eq!(report.total, 5);
        assert_eq!(report.checked, 5);

        let (records, total) = chain.list(&ListFilter::default(), 100, 0);
        assert_eq!(total, 5);
        assert_eq!(records[0].prev_hash, GENESIS);
        for pair in records.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
            assert!(pair[1].timestamp_ns > pair[0].timestamp_ns);
        }
    }

    #[test]
    fn erase_preserves_chain_and_neighbors() {
        let chain = Chain::in_memory();
        let a = chain.append(json!({"v": "a"})).unwrap();
        let b = chain.append(json!({"v": "b"})).unwrap();
        let c = chain.append(json!({"v": "c"})).unwrap();

        assert!(chain.erase(&b.hash).unwrap());

        let report = chain.verify();
        assert!(report.valid, "erase must not break verification");
        assert_eq!(report.total, 3);

        let erased = chain.get(&b.hash).unwrap();
        assert!(erased.erased);
        let marker = erased.content.as_str().unwrap();
        assert!(marker.starts_with("[ERASED:"));
        assert!(marker.ends_with(']'));
        assert_eq!(marker.len(), "[ERASED:]".len() + 16);

        // hash/prev_hash untouched; successor still points at it
        assert_eq!(erased.hash, b.hash);
        assert_eq!(chain.get(&c.hash).unwrap().prev_hash, b.hash);
        assert_eq!(chain.get(&a.hash).unwrap().hash, a.hash);
    }

    #[test]
    fn erase_unknown_hash_is_false() {
        let chain = Chain::in_memory();
        chain.append(json!({"v": 1})).unwrap();
        assert!(!chain.erase("deadbeef").unwrap());
    }

    #[test]
    fn list_filters_and_paginates() {
        let chain = Chain::in_memory();
        for i in 0..10 {
            let kind = if i % 2 == 0 { "even" } else { "odd" };
            chain.append(json!({"kind": kind, "n": i})).unwrap();
        }
        let (evens, total) = chain.list(&ListFilter::default().field("kind", "even"), 100, 0);
        assert_eq!(total, 5);
        assert!(evens.iter().all(|r| r.content["kind"] == "even"));

        let (page, total) = chain.list(&ListFilter::default(), 3, 4);
        assert_eq!(total, 10);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].content["n"], 4);
    }

    #[test]
    fn list_hides_erased_unless_requested() {
        let chain = Chain::in_memory();
        let a = chain.append(json!({"v": "a"})).unwrap();
        chain.append(json!({"v": "b"})).unwrap();
        chain.erase(&a.hash).unwrap();

        let (visible, total) = chain.list(&ListFilter::default(), 100, 0);
        assert_eq!(total, 1);
        assert_eq!(visible[0].content["v"], "b");

        let (all, total) = chain.list(&ListFilter::default().with_erased(), 100, 0);
        assert_eq!(total, 2);
        assert!(all[0].erased);
    }

    #[test]
    fn tampered_content_fails_verification() {
        let chain = Chain::in_memory();
        chain.append(json!({"v": "a"})).unwrap();
        let victim = chain.append(json!({"v": "b"})).unwrap();
        chain.append(json!({"v": "c"})).unwrap();

        {
            let mut inner = chain.inner.lock().unwrap();
            let rec = inner
                .records
                .iter_mut()
                .find(|r| r.hash == victim.hash)
                .unwrap();
            rec.content = json!({"v": "tampered"});
        }

        let report = chain.verify();
        assert!(!report.valid);
        assert_eq!(report.first_invalid.as_deref(), Some(victim.hash.as_str()));
        assert_eq!(report.checked, 1);
    }

    #[test]
    fn bounded_mode_trims_but_keeps_counting() {
        let chain = Chain::bounded(3);
        for i in 0..10 {
            chain.append(json!({"n": i})).unwrap();
        }
        assert_eq!(chain.len(), 10);
        let (records, total) = chain.list(&ListFilter::default(), 100, 0);
        assert_eq!(total, 3);
        assert_eq!(records[0].content["n"], 7);

        let report = chain.verify();
        assert!(report.valid);
        assert_eq!(report.total, 10);
        assert_eq!(report.checked, 3);
    }

    #[test]
    fn journal_roundtrip_restores_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");

        let first = {
            let chain = Chain::open(&path).unwrap();
            chain.append(json!({"v": "a"})).unwrap();
            chain.append(json!({"v": "b"})).unwrap()
        };

        let chain = Chain::open(&path).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.last_hash(), first.hash);
        assert!(chain.verify().valid);

        // appends after replay keep linking
        let next = chain.append(json!({"v": "c"})).unwrap();
        assert_eq!(next.prev_hash, first.hash);
        assert!(next.timestamp_ns > first.timestamp_ns);
        assert!(chain.verify().valid);
    }

    #[test]
    fn journal_replay_applies_erasure_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");

        let victim = {
            let chain = Chain::open(&path).unwrap();
            chain.append(json!({"v": "secret"})).unwrap();
            let victim = chain.append(json!({"v": "target"})).unwrap();
            chain.append(json!({"v": "after"})).unwrap();
            chain.erase(&victim.hash).unwrap();
            victim
        };

        let chain = Chain::open(&path).unwrap();
        assert_eq!(chain.len(), 3);
        let rec = chain.get(&victim.hash).unwrap();
        assert!(rec.erased);
        assert!(rec.content.as_str().unwrap().starts_with("[ERASED:"));
        assert!(chain.verify().valid);
    }

    #[test]
    fn journal_replay_tolerates_trailing_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.jsonl");

        {
            let chain = Chain::open(&path).unwrap();
            chain.append(json!({"v": "a"})).unwrap();
            chain.append(json!({"v": "b"})).unwrap();
        }
        // simulate a torn write
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{\"hash\":\"trunc").unwrap();
        }

        let chain = Chain::open(&path).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain.verify().valid);
    }
}
