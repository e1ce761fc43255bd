//! Indexing pipeline
//!
//! Files are processed in batches. Each batch runs five phases, each on the
//! bounded worker pool: read, embed files, write files, embed definitions,
//! write definitions. Large codebases are stored first and embedded
//! server-side, with a client-side backfill for whatever the server leaves.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cancellation::RunCancellation;
use super::extractor::{self, Definition};
use super::pool::run_pool;
use super::scanner::{FileScanner, ScannedFile, Unreadable};
use super::stats::{Exclusion, IndexMode, IndexSummary, RunStats};
use super::store::{self, FileRecord, FileState, IndexStore, ProjectSchema, StoreError};
use crate::config::{IndexConfig, SpecmemConfig};
use crate::embedding::protocol::truncate_chars;
use crate::embedding::{BulkRequest, BulkTarget, EmbeddingBackend};
use crate::error::IndexError;

/// Bytes inspected for a null byte when sniffing binary files
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// `"<relative path>\n<content>"`, cut to the character budget
pub fn file_embedding_text(relative_path: &str, content: &str, max_chars: usize) -> String {
    let text = format!("{relative_path}\n{content}");
    truncate_chars(&text, max_chars).to_string()
}

/// A file read, hashed and extracted, waiting for its embedding
#[derive(Debug)]
struct PreparedFile {
    record: FileRecord,
    definitions: Vec<Definition>,
    truncated: bool,
}

#[derive(Debug)]
enum ReadOutcome {
    Unchanged,
    Excluded(Exclusion),
    Ready(Box<PreparedFile>),
}

#[derive(Debug, Clone)]
struct ReadLimits {
    project_path: String,
    max_file_size: u64,
    max_definitions: usize,
    /// Treat a hash match as unchanged even without a stored embedding
    skip_unembedded: bool,
}

/// Per-run state shared by all phases
struct RunContext {
    schema: ProjectSchema,
    existing: HashMap<String, FileState>,
    stats: RunStats,
    cancel: RunCancellation,
    token: CancellationToken,
    embeddings_enabled: bool,
    concurrency: usize,
}

/// Drives one project through the indexing pipeline
pub struct IndexCoordinator {
    project_root: PathBuf,
    project_path: String,
    /// Explicit schema; derived from the project path when unset
    schema_name: Option<String>,
    index: IndexConfig,
    max_text_chars: usize,
    store: Arc<IndexStore>,
    backend: Arc<dyn EmbeddingBackend>,
}

impl IndexCoordinator {
    pub fn new(
        project_root: &Path,
        config: &SpecmemConfig,
        store: Arc<IndexStore>,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            project_path: project_root.to_string_lossy().into_owned(),
            schema_name: None,
            index: config.index.clone(),
            max_text_chars: config.embedding.max_text_chars,
            store,
            backend,
        }
    }

    /// Use an explicit schema instead of the one derived from the path
    pub fn with_schema_name(mut self, name: impl Into<String>) -> Self {
        self.schema_name = Some(name.into());
        self
    }

    /// Index the project once.
    ///
    /// Embedding failures are counted in the summary; only store failures
    /// that make persistence impossible end the run with an error.
    pub async fn run(&self) -> Result<IndexSummary, IndexError> {
        let started = Instant::now();
        let schema = match &self.schema_name {
            Some(name) => self.store.ensure_named_schema(name).await?,
            None => self.store.ensure_schema(&self.project_root).await?,
        };
        self.store.ensure_tables(&schema).await?;

        let embeddings_enabled = match self.backend.ensure_ready().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Embedding server unavailable, indexing without embeddings");
                false
            }
        };

        let existing = self
            .store
            .load_file_states(&schema, &self.project_path)
            .await?;
        let (files, unreadable) = self.scan().await?;

        let cancel = RunCancellation::new();
        let ctx = RunContext {
            schema,
            existing,
            stats: RunStats::default(),
            token: cancel.child_token(),
            cancel,
            embeddings_enabled,
            concurrency: self.index.concurrency_for(files.len()),
        };
        RunStats::add(&ctx.stats.files_scanned, files.len());

        self.remove_missing(&ctx, &files, &unreadable).await?;

        let mode = if embeddings_enabled && files.len() > self.index.large_codebase_threshold {
            IndexMode::StoreThenEmbed
        } else {
            IndexMode::Standard
        };
        info!(
            project = %self.project_path,
            schema = %ctx.schema.name,
            files = files.len(),
            concurrency = ctx.concurrency,
            ?mode,
            "Indexing project"
        );

        match mode {
            IndexMode::Standard => {
                for batch in files.chunks(self.index.file_batch_size.max(1)) {
                    self.process_batch(&ctx, batch, embeddings_enabled).await?;
                }
            }
            IndexMode::StoreThenEmbed => self.store_then_embed(&ctx, &files).await?,
        }

        let summary = ctx
            .stats
            .summary(&ctx.schema.name, mode, embeddings_enabled, started.elapsed());
        info!(
            indexed = summary.files_indexed,
            skipped = summary.files_skipped,
            removed = summary.files_removed,
            definitions = summary.definitions_extracted,
            embedded = summary.embeddings_generated,
            failed = summary.embeddings_failed,
            elapsed_ms = summary.elapsed_ms,
            "Indexing complete"
        );
        Ok(summary)
    }

    async fn scan(&self) -> Result<(Vec<ScannedFile>, Unreadable), IndexError> {
        let scanner = FileScanner::new(&self.project_root, &self.index);
        let scanned = tokio::task::spawn_blocking(move || {
            let files: Vec<ScannedFile> = scanner.scan().collect();
            (files, scanner.unreadable())
        })
        .await?;
        debug!(files = scanned.0.len(), "Scan complete");
        Ok(scanned)
    }

    /// Drop stored files the scanner no longer finds.
    ///
    /// Rows under a part of the tree the walk could not read are kept.
    async fn remove_missing(
        &self,
        ctx: &RunContext,
        files: &[ScannedFile],
        unreadable: &Unreadable,
    ) -> Result<(), IndexError> {
        let present: HashSet<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        let (kept, missing): (Vec<String>, Vec<String>) = ctx
            .existing
            .keys()
            .filter(|path| !present.contains(path.as_str()))
            .cloned()
            .partition(|path| unreadable.covers(path));
        if !kept.is_empty() {
            warn!(kept = kept.len(), "Keeping stored files under unreadable paths");
        }
        if missing.is_empty() {
            return Ok(());
        }

        let removed = self
            .store
            .remove_files(&ctx.schema, &self.project_path, missing)
            .await?;
        info!(removed, "Removed files no longer on disk");
        RunStats::add(&ctx.stats.files_removed, removed);
        Ok(())
    }

    async fn process_batch(
        &self,
        ctx: &RunContext,
        files: &[ScannedFile],
        embed: bool,
    ) -> Result<(), IndexError> {
        // Phase 1: read, hash, extract
        let outcomes = run_pool(files, ctx.concurrency, &ctx.token, |file| {
            self.read_file(ctx, file)
        })
        .await;
        let mut prepared = Vec::new();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                ReadOutcome::Unchanged => RunStats::add(&ctx.stats.files_skipped, 1),
                ReadOutcome::Excluded(reason) => ctx.stats.exclude(reason),
                ReadOutcome::Ready(file) => {
                    RunStats::add(&ctx.stats.definitions_extracted, file.definitions.len());
                    if file.truncated {
                        RunStats::add(&ctx.stats.files_truncated, 1);
                    }
                    prepared.push(*file);
                }
            }
        }
        self.check_cancelled(ctx)?;
        if prepared.is_empty() {
            return Ok(());
        }

        // Phase 2: embed files
        if embed {
            let texts = prepared
                .iter()
                .map(|p| {
                    file_embedding_text(
                        &p.record.relative_path,
                        &p.record.content,
                        self.max_text_chars,
                    )
                })
                .collect();
            let embeddings = self.embed_texts(ctx, texts).await;
            for (file, embedding) in prepared.iter_mut().zip(embeddings) {
                file.record.embedding = embedding;
            }
        } else if !ctx.embeddings_enabled {
            RunStats::add(&ctx.stats.embeddings_skipped, prepared.len());
        }

        // Phase 3: write files
        let written = run_pool(&prepared, ctx.concurrency, &ctx.token, |file| {
            self.write_file(ctx, file)
        })
        .await;
        self.check_cancelled(ctx)?;
        let mut stored: Vec<PreparedFile> = prepared
            .into_iter()
            .zip(written)
            .filter_map(|(file, ok)| (ok == Some(true)).then_some(file))
            .collect();

        // Phase 4: embed definitions
        let definition_count: usize = stored.iter().map(|f| f.definitions.len()).sum();
        if embed && definition_count > 0 {
            let texts = stored
                .iter()
                .flat_map(|f| f.definitions.iter().map(Definition::embedding_text))
                .collect();
            let mut embeddings = self.embed_texts(ctx, texts).await.into_iter();
            for def in stored.iter_mut().flat_map(|f| f.definitions.iter_mut()) {
                def.embedding = embeddings.next().flatten();
            }
        } else if !ctx.embeddings_enabled {
            RunStats::add(&ctx.stats.embeddings_skipped, definition_count);
        }

        // Phase 5: write definitions
        run_pool(&stored, ctx.concurrency, &ctx.token, |file| {
            self.write_definitions(ctx, file)
        })
        .await;
        self.check_cancelled(ctx)
    }

    async fn read_file(&self, ctx: &RunContext, file: &ScannedFile) -> ReadOutcome {
        let prior = ctx.existing.get(&file.relative_path).cloned();
        let limits = ReadLimits {
            project_path: self.project_path.clone(),
            max_file_size: self.index.max_file_size,
            max_definitions: self.index.max_definitions_per_file,
            skip_unembedded: !ctx.embeddings_enabled,
        };
        let file = file.clone();
        let path = file.relative_path.clone();

        match tokio::task::spawn_blocking(move || prepare_file(file, prior, &limits)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(path = %path, error = %e, "File preparation task failed");
                ReadOutcome::Excluded(Exclusion::Unreadable)
            }
        }
    }

    async fn write_file(&self, ctx: &RunContext, file: &PreparedFile) -> bool {
        match self.store.upsert_file(&ctx.schema, file.record.clone()).await {
            Ok(()) => {
                RunStats::add(&ctx.stats.files_indexed, 1);
                true
            }
            Err(e) => {
                self.store_failure(ctx, &file.record.relative_path, e);
                false
            }
        }
    }

    async fn write_definitions(&self, ctx: &RunContext, file: &PreparedFile) {
        let result = self
            .store
            .upsert_definitions(
                &ctx.schema,
                &self.project_path,
                &file.record.id,
                file.definitions.clone(),
            )
            .await;
        if let Err(e) = result {
            self.store_failure(ctx, &file.record.relative_path, e);
        }
    }

    fn store_failure(&self, ctx: &RunContext, path: &str, err: StoreError) {
        if err.is_fatal() {
            ctx.cancel.abort(err);
        } else {
            warn!(path = %path, error = %err, "Failed to persist file");
            RunStats::add(&ctx.stats.files_failed, 1);
        }
    }

    fn check_cancelled(&self, ctx: &RunContext) -> Result<(), IndexError> {
        if !ctx.cancel.is_cancelled() {
            return Ok(());
        }
        Err(ctx
            .cancel
            .take_fatal()
            .map(IndexError::Store)
            .unwrap_or(IndexError::Cancelled))
    }

    /// Embed in fixed-size sub-batches, a bounded number in flight.
    ///
    /// The result always has one entry per text; a failed sub-batch yields
    /// `None` for each of its texts.
    async fn embed_texts(&self, ctx: &RunContext, texts: Vec<String>) -> Vec<Option<Vec<f32>>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let batch_size = self.index.embed_batch_size.max(1);
        let in_flight = self.index.max_concurrent_batches.max(1);

        let batches: Vec<Vec<Option<Vec<f32>>>> = stream::iter(texts.chunks(batch_size))
            .map(|chunk| async move {
                match self.backend.embed_batch(chunk).await {
                    Ok(mut embeddings) => {
                        embeddings.resize(chunk.len(), None);
                        embeddings
                    }
                    Err(e) => {
                        warn!(
                            texts = chunk.len(),
                            kind = %e.kind,
                            error = %e.message,
                            "Embedding batch failed"
                        );
                        ctx.stats.record_error(e.kind);
                        vec![None; chunk.len()]
                    }
                }
            })
            .buffered(in_flight)
            .collect()
            .await;

        let embeddings: Vec<Option<Vec<f32>>> = batches.into_iter().flatten().collect();
        ctx.stats.record_embeddings(&embeddings);
        embeddings
    }

    /// Store everything without embeddings, then let the server embed it
    async fn store_then_embed(
        &self,
        ctx: &RunContext,
        files: &[ScannedFile],
    ) -> Result<(), IndexError> {
        for batch in files.chunks(self.index.file_batch_size.max(1)) {
            self.process_batch(ctx, batch, false).await?;
        }

        let files_done = !self.has_pending(ctx, BulkTarget::Files).await?
            || self.bulk(ctx, BulkTarget::Files).await;
        let definitions_done = !self.has_pending(ctx, BulkTarget::Definitions).await?
            || self.bulk(ctx, BulkTarget::Definitions).await;

        if !files_done {
            self.backfill_files(ctx).await?;
        }
        if !definitions_done {
            self.backfill_definitions(ctx).await?;
        }
        Ok(())
    }

    /// Whether any stored row of `target` still lacks an embedding
    async fn has_pending(&self, ctx: &RunContext, target: BulkTarget) -> Result<bool, IndexError> {
        let pending = match target {
            BulkTarget::Files => !self
                .store
                .pending_files(&ctx.schema, &self.project_path, None, 1)
                .await?
                .is_empty(),
            BulkTarget::Definitions => !self
                .store
                .pending_definitions(&ctx.schema, &self.project_path, None, 1)
                .await?
                .is_empty(),
        };
        if !pending {
            debug!(?target, "Nothing left to embed, skipping server-side pass");
        }
        Ok(pending)
    }

    /// One server-side bulk pass; `true` when nothing is left to embed
    async fn bulk(&self, ctx: &RunContext, target: BulkTarget) -> bool {
        let request = BulkRequest {
            target,
            batch_size: self.index.file_batch_size,
            limit: 0,
            project_path: self.project_path.clone(),
            schema: ctx.schema.name.clone(),
            db_path: ctx.schema.db_path.to_string_lossy().into_owned(),
        };
        match self.backend.process_bulk(request).await {
            Ok(outcome) => {
                info!(
                    ?target,
                    processed = outcome.processed,
                    errors = outcome.errors,
                    remaining = outcome.remaining,
                    "Server-side embedding pass finished"
                );
                RunStats::add(&ctx.stats.embeddings_generated, outcome.processed);
                outcome.remaining == 0 && outcome.errors == 0
            }
            Err(e) => {
                warn!(
                    ?target,
                    kind = %e.kind,
                    error = %e.message,
                    "Server-side embedding failed, falling back to client"
                );
                ctx.stats.record_error(e.kind);
                false
            }
        }
    }

    async fn backfill_files(&self, ctx: &RunContext) -> Result<(), IndexError> {
        let page_size = self.index.file_batch_size.max(1);
        let mut after = None;
        loop {
            let page = self
                .store
                .pending_files(&ctx.schema, &self.project_path, after.take(), page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            let texts = page
                .iter()
                .map(|p| file_embedding_text(&p.relative_path, &p.content, self.max_text_chars))
                .collect();
            let embeddings = self.embed_texts(ctx, texts).await;
            let updates: Vec<(String, Vec<f32>)> = page
                .into_iter()
                .zip(embeddings)
                .filter_map(|(p, e)| e.map(|e| (p.id, e)))
                .collect();
            self.store.set_file_embeddings(&ctx.schema, updates).await?;
        }
        Ok(())
    }

    async fn backfill_definitions(&self, ctx: &RunContext) -> Result<(), IndexError> {
        let page_size = self.index.file_batch_size.max(1);
        let mut after = None;
        loop {
            let page = self
                .store
                .pending_definitions(&ctx.schema, &self.project_path, after.take(), page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());

            let texts = page.iter().map(|d| d.embedding_text()).collect();
            let embeddings = self.embed_texts(ctx, texts).await;
            let updates: Vec<(String, Vec<f32>)> = page
                .into_iter()
                .zip(embeddings)
                .filter_map(|(d, e)| e.map(|e| (d.id, e)))
                .collect();
            self.store.set_definition_embeddings(&ctx.schema, updates).await?;
        }
        Ok(())
    }
}

/// Read, sniff, hash and extract one file. Runs on the blocking pool.
fn prepare_file(file: ScannedFile, prior: Option<FileState>, limits: &ReadLimits) -> ReadOutcome {
    let path = &file.absolute_path;
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %file.relative_path, error = %e, "Cannot stat file");
            return ReadOutcome::Excluded(Exclusion::Unreadable);
        }
    };
    if metadata.len() > limits.max_file_size {
        debug!(path = %file.relative_path, size = metadata.len(), "Skipping oversized file");
        return ReadOutcome::Excluded(Exclusion::Oversized);
    }

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            warn!(path = %file.relative_path, error = %e, "Cannot read file");
            return ReadOutcome::Excluded(Exclusion::Unreadable);
        }
    };
    if bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
        return ReadOutcome::Excluded(Exclusion::Binary);
    }

    let content = match String::from_utf8(bytes) {
        Ok(c) => c,
        Err(_) => {
            debug!(path = %file.relative_path, "Skipping non-UTF-8 file");
            return ReadOutcome::Excluded(Exclusion::Unreadable);
        }
    };
    if content.trim().is_empty() {
        return ReadOutcome::Excluded(Exclusion::Empty);
    }

    let hash = store::content_hash(content.as_bytes());
    if let Some(prior) = prior {
        if prior.content_hash == hash && (prior.has_embedding || limits.skip_unembedded) {
            return ReadOutcome::Unchanged;
        }
    }

    let id = store::file_id(&limits.project_path, &file.relative_path);
    let extraction = extractor::extract(
        &content,
        &file.language,
        &id,
        &file.relative_path,
        limits.max_definitions,
    );
    if extraction.truncated {
        warn!(
            path = %file.relative_path,
            kept = extraction.definitions.len(),
            "Definition limit reached, remaining definitions dropped"
        );
    }

    let record = FileRecord {
        id,
        project_path: limits.project_path.clone(),
        absolute_path: file.absolute_path.to_string_lossy().into_owned(),
        relative_path: file.relative_path,
        language_id: file.language.id.to_string(),
        language_name: file.language.name.to_string(),
        size_bytes: metadata.len(),
        line_count: content.lines().count(),
        content_hash: hash,
        content,
        embedding: None,
    };
    ReadOutcome::Ready(Box::new(PreparedFile {
        record,
        definitions: extraction.definitions,
        truncated: extraction.truncated,
    }))
}
