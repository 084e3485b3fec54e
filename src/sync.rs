//! One synchronization run: diff the library against the stored records,
//! extract and normalize what changed, embed, enrich, update the index and
//! commit.
//!
//! Nothing a search can observe changes until the final metadata write.
//! Generation files are staged before it, caches and old generations are
//! cleaned up after it, and a run that stops anywhere in between leaves the
//! previous knowledge base intact.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    data_dir::DataDir,
    doc_id::RecordId,
    embedding::{
        EmbedOutcome,
        EmbedRequest,
        Embedder,
        EmbeddingPipeline,
        malformed_reason,
    },
    enrichment::{EnrichmentPipeline, ResilientClient},
    error::{Error, Result},
    incremental::{Fingerprint, content_hash, diff_library},
    index::IndexMaintainer,
    library::{SourceDocument, SourceLibrary},
    normalize::normalize,
    record::{ContentIdentity, Record, RecordStore},
    text_cache::TextCache,
    vector_cache::VectorCache,
};

/// Cooperative cancellation shared between the CLI's signal handler and a
/// running sync.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Process only what changed since the last committed run.
    #[default]
    Incremental,
    /// Reprocess every document and write a fresh index. Also the way out of
    /// a model change or an inconsistent knowledge base.
    FullRebuild,
    /// Replace the knowledge base with the given library, offline.
    Seed,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::Incremental => "incremental",
            SyncMode::FullRebuild => "full rebuild",
            SyncMode::Seed => "seed",
        })
    }
}

/// A document left out of this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Records scored from the API this run.
    pub enriched: usize,
    /// Records that fell back to the heuristic score this run.
    pub degraded: usize,
    /// Degraded records skipped by the open circuit breaker.
    pub breaker_open: usize,
    /// Records whose score came from an interrupted run's checkpoint.
    pub resumed: usize,
    pub skipped: Vec<SkippedDocument>,
    /// Documents handed to the library's extractor.
    pub extracted: usize,
    pub text_cache_hits: usize,
    pub vectors_computed: usize,
    pub vector_cache_hits: usize,
    /// Whether the index was rebuilt rather than appended to.
    pub rebuilt: bool,
    /// Committed index generation after the run.
    pub generation: Option<u64>,
    /// The run stopped before committing; running again resumes it.
    pub resumable: bool,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0
            && self.updated == 0
            && self.removed == 0
            && self.skipped.is_empty()
            && !self.resumable
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resumable {
            writeln!(
                f,
                "{} sync interrupted before commit; run it again to resume",
                self.mode
            )?;
        } else {
            writeln!(
                f,
                "{} sync: {} added, {} updated, {} removed, {} unchanged",
                self.mode, self.added, self.updated, self.removed, self.unchanged
            )?;
        }
        write!(
            f,
            "  enrichment: {} from API, {} heuristic fallback",
            self.enriched, self.degraded
        )?;
        if self.breaker_open > 0 {
            write!(f, " ({} with the breaker open)", self.breaker_open)?;
        }
        if self.resumed > 0 {
            write!(f, ", {} resumed from checkpoint", self.resumed)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "  caches: {} texts reused, {} extracted, {} vectors reused, {} computed",
            self.text_cache_hits,
            self.extracted,
            self.vector_cache_hits,
            self.vectors_computed
        )?;
        if let Some(generation) = self.generation {
            writeln!(
                f,
                "  index: generation {generation}{}",
                if self.rebuilt { " (rebuilt)" } else { "" }
            )?;
        }
        for skipped in &self.skipped {
            writeln!(f, "  skipped {}: {}", skipped.key, skipped.reason)?;
        }
        Ok(())
    }
}

/// Text of one document, from the cache or a fresh extraction.
struct Extracted {
    doc: SourceDocument,
    text: String,
    content_hash: String,
}

enum Extraction {
    Cached(Extracted),
    Fresh(Extracted),
    Failed(SkippedDocument),
}

/// A record produced by this run, not yet in the store.
struct Pending {
    record: Record,
    /// The record needs a new vector (new text, or a full rebuild).
    embed: bool,
    text: String,
}

/// Runs synchronizations of one library into one knowledge base.
pub struct Synchronizer<'a> {
    data_dir: &'a DataDir,
    library: &'a dyn SourceLibrary,
    text_cache: &'a dyn TextCache,
    vector_cache: &'a dyn VectorCache,
    embedder: &'a dyn Embedder,
    config: &'a SyncConfig,
    metadata_client: Option<Arc<ResilientClient>>,
    cancel: CancelFlag,
    current_year: Option<i32>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        data_dir: &'a DataDir,
        library: &'a dyn SourceLibrary,
        text_cache: &'a dyn TextCache,
        vector_cache: &'a dyn VectorCache,
        embedder: &'a dyn Embedder,
        config: &'a SyncConfig,
    ) -> Self {
        Self {
            data_dir,
            library,
            text_cache,
            vector_cache,
            embedder,
            config,
            metadata_client: None,
            cancel: CancelFlag::default(),
            current_year: None,
        }
    }

    /// Client for the metadata API. Without one, or with `offline` set in
    /// the config, every record gets a heuristic score.
    pub fn with_metadata_client(
        mut self,
        client: Arc<ResilientClient>,
    ) -> Self {
        self.metadata_client = Some(client);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Score recency against a fixed year instead of the current one.
    pub fn with_year(mut self, year: i32) -> Self {
        self.current_year = Some(year);
        self
    }

    pub async fn run(&self, mode: SyncMode) -> Result<SyncReport> {
        self.config.validate()?;
        let metadata_path = self.data_dir.metadata_file();
        let index_dir = self.data_dir.index_dir()?;
        let model_id = self.embedder.model_id().to_string();
        let mut report = SyncReport {
            mode,
            ..SyncReport::default()
        };

        let mut store = load_store(mode, &metadata_path)?;
        let previous_generation = store.index_generation;

        let mut index = if mode == SyncMode::Incremental {
            if let Some(indexed) = &store.model_id
                && *indexed != model_id
            {
                return Err(Error::ModelMismatch {
                    indexed: indexed.clone(),
                    requested: model_id,
                });
            }
            let index =
                IndexMaintainer::open(&index_dir, store.index_generation)?;
            index.current().verify(&store.ids())?;
            index
        } else {
            open_for_rebuild(&index_dir, &store, &model_id)?
        };

        let snapshot = self.library.snapshot()?;
        let mut diff = diff_library(&snapshot, &store.records);
        let positions = store.positions();
        if mode != SyncMode::Incremental {
            let docs: HashMap<&str, &SourceDocument> =
                snapshot.iter().map(|d| (d.key.as_str(), d)).collect();
            for id in std::mem::take(&mut diff.unchanged) {
                if let Some(record) = store.get_at(&positions, id)
                    && let Some(doc) = docs.get(record.identity.key.as_str())
                {
                    diff.updated.push((id, (*doc).clone()));
                }
            }
        }
        report.unchanged = diff.unchanged.len();
        info!(
            %mode,
            new = diff.new.len(),
            updated = diff.updated.len(),
            deleted = diff.deleted.len(),
            unchanged = diff.unchanged.len(),
            "library scanned"
        );

        if mode == SyncMode::Incremental && diff.is_empty() {
            info!("knowledge base is up to date");
            report.generation = store.index_generation;
            return Ok(report);
        }

        // Extraction. IDs go to new documents in key order.
        diff.new.sort_by(|a, b| a.key.cmp(&b.key));
        let new_texts = self.extract_all(&diff.new, &mut report)?;
        let updated_docs: Vec<SourceDocument> =
            diff.updated.iter().map(|(_, doc)| doc.clone()).collect();
        let updated_texts = self.extract_all(&updated_docs, &mut report)?;
        if self.cancel.is_cancelled() {
            return Ok(self.interrupted(report));
        }

        // Normalization.
        let source = self.library.name().to_string();
        let mut pending = Vec::new();
        for ((id, _), extracted) in diff.updated.iter().zip(updated_texts) {
            // A failed update keeps the record as it was.
            let Some(extracted) = extracted else { continue };
            if let Some(reason) = self.reject_malformed(&extracted, &mut report) {
                debug!(record = %id, reason, "keeping previous version");
                continue;
            }
            let previous = store.get_at(&positions, *id);
            let mut record = build_record(*id, &source, &extracted);
            let same_text = previous
                .is_some_and(|p| p.content_hash == extracted.content_hash);
            if same_text {
                // Scores depend only on the text and the metadata API, so an
                // identical text keeps its score in every mode.
                record.quality = previous.and_then(|p| p.quality.clone());
            }
            pending.push(Pending {
                record,
                embed: !same_text || mode != SyncMode::Incremental,
                text: extracted.text,
            });
        }
        for extracted in new_texts.into_iter().flatten() {
            if self.reject_malformed(&extracted, &mut report).is_some() {
                continue;
            }
            let id = store.allocate_id();
            pending.push(Pending {
                record: build_record(id, &source, &extracted),
                embed: true,
                text: extracted.text,
            });
        }

        // Embedding. Fails fast when the model itself is unusable.
        let embedded = self.embed(&pending)?;
        report.vectors_computed = embedded.computed;
        report.vector_cache_hits = embedded.cache_hits;
        let rejected: HashSet<RecordId> =
            embedded.skipped.iter().map(|(id, _)| *id).collect();
        for (id, reason) in &embedded.skipped {
            if let Some(p) = pending.iter().find(|p| p.record.id == *id) {
                report.skipped.push(SkippedDocument {
                    key: p.record.identity.key.clone(),
                    reason: reason.clone(),
                });
            }
        }
        pending.retain(|p| !rejected.contains(&p.record.id));
        if self.cancel.is_cancelled() {
            return Ok(self.interrupted(report));
        }

        // Apply to the store.
        let deleted_keys: Vec<String> = diff
            .deleted
            .iter()
            .filter_map(|id| store.get_at(&positions, *id))
            .map(|r| r.identity.key.clone())
            .collect();
        if mode != SyncMode::Incremental {
            // A record that could not be reprocessed keeps its previous
            // version while a vector for it exists. Without one, a document
            // that no longer extracts is dropped, but a record is never lost
            // to an embedding failure.
            let reprocessed: HashSet<RecordId> =
                pending.iter().map(|p| p.record.id).collect();
            for (id, _) in &diff.updated {
                if reprocessed.contains(id) {
                    continue;
                }
                let Some(previous) = store.get_at(&positions, *id) else {
                    continue;
                };
                if self
                    .find_vector(previous, &embedded, &index, &model_id)
                    .is_some()
                {
                    debug!(record = %id, "keeping previous version");
                } else if rejected.contains(id) {
                    return Err(Error::Embedding(format!(
                        "record {id} could not be embedded and has no \
                         previous vector"
                    )));
                } else {
                    diff.deleted.push(*id);
                }
            }
        }
        report.removed = store.remove(&diff.deleted);
        let existing: HashSet<RecordId> =
            store.records.iter().map(|r| r.id).collect();
        let content_changed = pending
            .iter()
            .any(|p| p.embed && existing.contains(&p.record.id));
        let mut appended = Vec::new();
        let mut records = Vec::with_capacity(pending.len());
        for p in pending {
            if existing.contains(&p.record.id) {
                report.updated += 1;
            } else {
                report.added += 1;
                appended.push((p.record.id, p.record.content_hash.clone()));
            }
            records.push(p.record);
        }
        store.upsert_all(records);

        // Enrichment of every record without a score.
        let enrichment = self.enrichment_pipeline(mode)?;
        let unscored: Vec<Record> = store
            .records
            .iter()
            .filter(|r| r.quality.is_none())
            .cloned()
            .collect();
        let enriched = enrichment.run(&unscored).await?;
        report.enriched = enriched.enriched;
        report.degraded = enriched.degraded;
        report.breaker_open = enriched.breaker_open;
        report.resumed = enriched.resumed;
        if enriched.cancelled {
            return Ok(self.interrupted(report));
        }
        for record in &mut store.records {
            if let Some(state) = enriched.results.get(&record.id) {
                record.quality = state.quality().cloned();
            }
        }

        // Index.
        report.rebuilt = mode != SyncMode::Incremental
            || !diff.deleted.is_empty()
            || content_changed;
        let index_changed = report.rebuilt || !appended.is_empty();
        if report.rebuilt {
            let mut ids = Vec::with_capacity(store.len());
            let mut vectors = Vec::with_capacity(store.len());
            for record in &store.records {
                ids.push(record.id);
                vectors.push(self.vector_for(
                    record, &embedded, &index, &model_id,
                )?);
            }
            index.rebuild(&ids, &vectors)?;
        } else {
            appended.sort();
            for (id, hash) in &appended {
                let vector = embedded.vectors.get(hash).ok_or_else(|| {
                    Error::Structural(format!(
                        "no vector computed for record {id}"
                    ))
                })?;
                index.append(*id, vector)?;
            }
        }
        index.current().verify(&store.ids())?;

        // Commit.
        let live: HashSet<String> =
            store.records.iter().map(|r| r.content_hash.clone()).collect();
        let pruned = self.vector_cache.retain(&live);
        if pruned > 0 {
            debug!(pruned, "pruned stale vectors");
        }
        self.vector_cache.flush()?;

        let generation = if index_changed {
            Some(index.stage()?)
        } else {
            store.index_generation
        };
        store.model_id = Some(model_id);
        store.index_generation = generation;
        store.save(&metadata_path)?;

        if let Some(generation) = generation {
            index.mark_committed(generation);
            let keep: Vec<u64> = [Some(generation), previous_generation]
                .into_iter()
                .flatten()
                .collect();
            if let Err(e) = index.gc(&keep) {
                warn!(error = %e, "could not remove old index generations");
            }
        }
        let deleted_keys: Vec<&str> =
            deleted_keys.iter().map(String::as_str).collect();
        if let Err(e) = self.text_cache.remove(&deleted_keys) {
            warn!(error = %e, "could not prune text cache");
        }
        if let Err(e) = enrichment.finish().await {
            warn!(error = %e, "could not remove enrichment checkpoint");
        }

        report.generation = generation;
        info!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            degraded = report.degraded,
            breaker_open = report.breaker_open,
            skipped = report.skipped.len(),
            generation,
            "sync committed"
        );
        Ok(report)
    }

    /// Extract every document, in input order. Failures are recorded in the
    /// report and come back as `None`.
    fn extract_all(
        &self,
        docs: &[SourceDocument],
        report: &mut SyncReport,
    ) -> Result<Vec<Option<Extracted>>> {
        let results: Vec<Result<Extraction>> =
            docs.par_iter().map(|doc| self.extract_one(doc)).collect();

        let mut out = Vec::with_capacity(docs.len());
        for result in results {
            match result? {
                Extraction::Cached(extracted) => {
                    report.text_cache_hits += 1;
                    out.push(Some(extracted));
                }
                Extraction::Fresh(extracted) => {
                    report.extracted += 1;
                    out.push(Some(extracted));
                }
                Extraction::Failed(skipped) => {
                    report.extracted += 1;
                    report.skipped.push(skipped);
                    out.push(None);
                }
            }
        }
        Ok(out)
    }

    fn extract_one(&self, doc: &SourceDocument) -> Result<Extraction> {
        let fingerprint = Fingerprint::of(doc);
        if let Some(cached) = self.text_cache.get(&doc.key, &fingerprint)? {
            return Ok(Extraction::Cached(Extracted {
                doc: doc.clone(),
                content_hash: content_hash(&cached.text),
                text: cached.text,
            }));
        }

        match self.library.extract(&doc.key) {
            Ok(text) => {
                let hash = content_hash(&text);
                self.text_cache.put(
                    &doc.key,
                    &fingerprint.with_hash(hash.clone()),
                    &text,
                )?;
                Ok(Extraction::Fresh(Extracted {
                    doc: doc.clone(),
                    text,
                    content_hash: hash,
                }))
            }
            Err(e) => {
                warn!(
                    key = %doc.key,
                    error = %e,
                    "extraction failed, skipping document"
                );
                Ok(Extraction::Failed(SkippedDocument {
                    key: doc.key.clone(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    fn reject_malformed(
        &self,
        extracted: &Extracted,
        report: &mut SyncReport,
    ) -> Option<&'static str> {
        let reason = malformed_reason(&extracted.text)?;
        warn!(key = %extracted.doc.key, reason, "skipping document");
        report.skipped.push(SkippedDocument {
            key: extracted.doc.key.clone(),
            reason: reason.to_string(),
        });
        Some(reason)
    }

    fn embed(&self, pending: &[Pending]) -> Result<EmbedOutcome> {
        let requests: Vec<EmbedRequest> = pending
            .iter()
            .filter(|p| p.embed)
            .map(|p| EmbedRequest {
                id: p.record.id,
                content_hash: p.record.content_hash.clone(),
                text: p.text.clone(),
            })
            .collect();
        if requests.is_empty() {
            return Ok(EmbedOutcome::default());
        }
        EmbeddingPipeline::new(
            self.embedder,
            self.vector_cache,
            self.config.embedding_workers,
        )?
        .run(&requests)
    }

    fn enrichment_pipeline(&self, mode: SyncMode) -> Result<EnrichmentPipeline> {
        let client = if self.config.offline || mode == SyncMode::Seed {
            None
        } else {
            self.metadata_client.clone()
        };
        let pipeline = EnrichmentPipeline::new(
            client,
            self.config,
            Some(self.data_dir.checkpoint_file()),
            self.cancel.clone(),
        )?;
        Ok(match self.current_year {
            Some(year) => pipeline.with_year(year),
            None => pipeline,
        })
    }

    /// Vector for a record going into a rebuilt index: this run's output,
    /// then the committed generation, then the cache.
    fn find_vector(
        &self,
        record: &Record,
        embedded: &EmbedOutcome,
        index: &IndexMaintainer,
        model_id: &str,
    ) -> Option<Vec<f32>> {
        if let Some(vector) = embedded.vectors.get(&record.content_hash) {
            return Some(vector.clone());
        }
        if let Some(vector) = index.current().vector_of(record.id) {
            return Some(vector.to_vec());
        }
        self.vector_cache.get(&record.content_hash, model_id)
    }

    fn vector_for(
        &self,
        record: &Record,
        embedded: &EmbedOutcome,
        index: &IndexMaintainer,
        model_id: &str,
    ) -> Result<Vec<f32>> {
        self.find_vector(record, embedded, index, model_id)
            .ok_or_else(|| {
                Error::Structural(format!(
                    "no vector available for record {}",
                    record.id
                ))
            })
    }

    /// Stop without committing. Computed vectors are kept for the next run.
    fn interrupted(&self, mut report: SyncReport) -> SyncReport {
        if let Err(e) = self.vector_cache.flush() {
            warn!(error = %e, "could not save vector cache");
        }
        info!("sync cancelled before commit");
        report.resumable = true;
        report
    }
}

fn load_store(mode: SyncMode, path: &Path) -> Result<RecordStore> {
    match mode {
        SyncMode::Incremental => RecordStore::load(path),
        SyncMode::FullRebuild => match RecordStore::load(path) {
            Ok(store) => Ok(store),
            Err(e @ (Error::Structural(_) | Error::FormatVersion { .. })) => {
                warn!(
                    error = %e,
                    "existing metadata unusable, rebuilding from scratch"
                );
                Ok(RecordStore::default())
            }
            Err(e) => Err(e),
        },
        SyncMode::Seed => Ok(RecordStore::default()),
    }
}

/// Index to rebuild from. The committed generation is kept as a source of
/// vectors when it was built by the same model and still reads back cleanly;
/// otherwise the rebuild starts empty.
fn open_for_rebuild(
    dir: &Path,
    store: &RecordStore,
    model_id: &str,
) -> Result<IndexMaintainer> {
    if let Some(generation) = store.index_generation
        && store.model_id.as_deref() == Some(model_id)
    {
        match IndexMaintainer::open(dir, Some(generation)) {
            Ok(index) => return Ok(index),
            Err(e) => {
                warn!(error = %e, "ignoring unreadable index generation");
            }
        }
    }
    IndexMaintainer::open(dir, None)
}

fn build_record(id: RecordId, source: &str, extracted: &Extracted) -> Record {
    normalize(&extracted.text, &extracted.doc.key).into_record(
        id,
        ContentIdentity {
            source: source.to_string(),
            key: extracted.doc.key.clone(),
            size: extracted.doc.size,
            mtime: extracted.doc.mtime,
        },
        extracted.content_hash.clone(),
    )
}
