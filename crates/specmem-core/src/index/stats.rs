//! Counters for one indexing run and the summary they produce

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::embedding::EmbeddingErrorKind;

/// Why a file was left out before any embedding work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Binary,
    Empty,
    Oversized,
    Unreadable,
}

/// Which pipeline shape a run used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Standard,
    StoreThenEmbed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Exclusions {
    pub binary: usize,
    pub empty: usize,
    pub oversized: usize,
    pub unreadable: usize,
}

/// Outcome of an indexing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub schema: String,
    pub mode: IndexMode,
    pub embeddings_enabled: bool,
    pub files_scanned: usize,
    pub files_indexed: usize,
    /// Unchanged since the last run
    pub files_skipped: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub excluded: Exclusions,
    pub definitions_extracted: usize,
    pub files_truncated: usize,
    pub embeddings_generated: usize,
    pub embeddings_failed: usize,
    pub embeddings_skipped: usize,
    pub errors: BTreeMap<EmbeddingErrorKind, usize>,
    pub elapsed_ms: u64,
}

/// Lock-free counters shared by pipeline workers
#[derive(Debug, Default)]
pub struct RunStats {
    pub files_scanned: AtomicUsize,
    pub files_indexed: AtomicUsize,
    pub files_skipped: AtomicUsize,
    pub files_removed: AtomicUsize,
    pub files_failed: AtomicUsize,
    pub binary: AtomicUsize,
    pub empty: AtomicUsize,
    pub oversized: AtomicUsize,
    pub unreadable: AtomicUsize,
    pub definitions_extracted: AtomicUsize,
    pub files_truncated: AtomicUsize,
    pub embeddings_generated: AtomicUsize,
    pub embeddings_failed: AtomicUsize,
    pub embeddings_skipped: AtomicUsize,
    errors: Mutex<BTreeMap<EmbeddingErrorKind, usize>>,
}

impl RunStats {
    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn exclude(&self, reason: Exclusion) {
        let counter = match reason {
            Exclusion::Binary => &self.binary,
            Exclusion::Empty => &self.empty,
            Exclusion::Oversized => &self.oversized,
            Exclusion::Unreadable => &self.unreadable,
        };
        Self::add(counter, 1);
    }

    pub fn record_error(&self, kind: EmbeddingErrorKind) {
        *self.errors.lock().entry(kind).or_insert(0) += 1;
    }

    /// Count a batch of embedding results
    pub fn record_embeddings(&self, results: &[Option<Vec<f32>>]) {
        let generated = results.iter().filter(|r| r.is_some()).count();
        Self::add(&self.embeddings_generated, generated);
        Self::add(&self.embeddings_failed, results.len() - generated);
    }

    pub fn summary(
        &self,
        schema: &str,
        mode: IndexMode,
        embeddings_enabled: bool,
        elapsed: Duration,
    ) -> IndexSummary {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        IndexSummary {
            schema: schema.to_string(),
            mode,
            embeddings_enabled,
            files_scanned: get(&self.files_scanned),
            files_indexed: get(&self.files_indexed),
            files_skipped: get(&self.files_skipped),
            files_removed: get(&self.files_removed),
            files_failed: get(&self.files_failed),
            excluded: Exclusions {
                binary: get(&self.binary),
                empty: get(&self.empty),
                oversized: get(&self.oversized),
                unreadable: get(&self.unreadable),
            },
            definitions_extracted: get(&self.definitions_extracted),
            files_truncated: get(&self.files_truncated),
            embeddings_generated: get(&self.embeddings_generated),
            embeddings_failed: get(&self.embeddings_failed),
            embeddings_skipped: get(&self.embeddings_skipped),
            errors: self.errors.lock().clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}
