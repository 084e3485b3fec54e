//! Dense vectors for records.
//!
//! [`Embedder`] is the model seam. [`EmbeddingPipeline`] sits in front of it:
//! it consults the vector cache, batches the misses, isolates texts the model
//! rejects, and writes fresh vectors back to the cache.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    doc_id::RecordId,
    error::{Error, Result},
    model_manager::{self, ModelManager},
    vector_cache::VectorCache,
};

/// Model id of the built-in hashing embedder.
pub const HASHING_MODEL_ID: &str = "hashing-v1";
pub const HASHING_DIMENSION: usize = 256;

/// Upper bound on the text handed to the model for one record.
const MAX_EMBED_CHARS: usize = 16_384;

pub trait Embedder: Send + Sync {
    /// Identifier recorded alongside every vector this embedder produces.
    fn model_id(&self) -> &str;

    /// One vector per input, in input order.
    ///
    /// Must be deterministic: the vector for a text may not depend on which
    /// other texts share its batch.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v {
            *x /= norm;
        }
    }
}

/// Signed feature hashing over lowercase word unigrams and bigrams.
///
/// Needs no model download, so it backs demo mode and tests. Quality is far
/// below a neural model but similar texts do land near each other.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimension: HASHING_DIMENSION,
        }
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(reason) = malformed_reason(text) {
            return Err(Error::TextRejected(reason.to_string()));
        }

        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut v = vec![0.0f32; self.dimension];
        let mut add = |feature: &str| {
            let hash = blake3::hash(feature.as_bytes());
            let bytes = hash.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                bytes[6], bytes[7],
            ]) % self.dimension as u64;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket as usize] += sign;
        };

        for word in &words {
            add(word);
        }
        for pair in words.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]));
        }

        l2_normalize(&mut v);
        Ok(v)
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        HASHING_MODEL_ID
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}

/// ColBERT-backed embedder producing one pooled vector per text.
pub struct ColbertEmbedder {
    model_id: String,
    manager: Mutex<ModelManager>,
}

impl ColbertEmbedder {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            manager: Mutex::new(ModelManager::new(model_id)),
        }
    }
}

impl Embedder for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(reason) = texts.iter().find_map(|t| malformed_reason(t)) {
            return Err(Error::TextRejected(reason.to_string()));
        }
        let mut manager = self.manager.lock().unwrap_or_else(|e| e.into_inner());
        manager.encode_pooled(texts)
    }
}

impl std::fmt::Debug for ColbertEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColbertEmbedder")
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Build the embedder for a model id.
pub fn embedder_for(model_id: &str) -> Box<dyn Embedder> {
    if model_id == HASHING_MODEL_ID {
        Box::new(HashingEmbedder::default())
    } else {
        Box::new(ColbertEmbedder::new(model_id))
    }
}

/// Why a text cannot be embedded, if it cannot.
pub fn malformed_reason(text: &str) -> Option<&'static str> {
    if text.trim().is_empty() {
        Some("text is empty")
    } else if text.contains('\0') {
        Some("text contains NUL bytes")
    } else {
        None
    }
}

/// Free memory reported by the OS, in bytes.
pub fn available_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * 1024)
    })
}

/// Pick a batch size from free memory and accelerator presence.
///
/// Purely a throughput knob: vectors do not depend on it.
pub fn choose_batch_size(available_memory: Option<u64>, accelerator: bool) -> usize {
    const GIB: u64 = 1024 * 1024 * 1024;
    if accelerator {
        return 64;
    }
    match available_memory {
        None => 16,
        Some(bytes) if bytes < 2 * GIB => 4,
        Some(bytes) if bytes < 8 * GIB => 16,
        Some(_) => 32,
    }
}

/// A text to embed on behalf of a record.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub id: RecordId,
    pub content_hash: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct EmbedOutcome {
    /// Vector per content hash, for every request that succeeded.
    pub vectors: HashMap<String, Vec<f32>>,
    pub cache_hits: usize,
    pub computed: usize,
    /// Records whose text could not be embedded, with the reason.
    pub skipped: Vec<(RecordId, String)>,
}

pub struct EmbeddingPipeline<'a> {
    embedder: &'a dyn Embedder,
    cache: &'a dyn VectorCache,
    batch_size: usize,
    pool: Option<rayon::ThreadPool>,
}

impl<'a> EmbeddingPipeline<'a> {
    /// `workers == 0` runs on rayon's global pool.
    pub fn new(
        embedder: &'a dyn Embedder,
        cache: &'a dyn VectorCache,
        workers: usize,
    ) -> Result<Self> {
        let pool = if workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("embed-{i}"))
                    .build()
                    .map_err(|e| {
                        Error::Config(format!("cannot start embedding pool: {e}"))
                    })?,
            )
        } else {
            None
        };

        Ok(Self {
            embedder,
            cache,
            batch_size: choose_batch_size(
                available_memory(),
                model_manager::has_accelerator(),
            ),
            pool,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed texts in order. Malformed texts come back as `None` and are
    /// logged; the rest of the batch is unaffected.
    ///
    /// Returns an error only when the model itself is unusable (it cannot be
    /// loaded, or it fails for reasons unrelated to the input).
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let chunks: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        let run = || -> Vec<Result<Vec<Option<Vec<f32>>>>> {
            chunks.par_iter().map(|chunk| self.embed_chunk(chunk)).collect()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        let mut out = Vec::with_capacity(texts.len());
        for result in results {
            out.extend(result?);
        }
        Ok(out)
    }

    fn embed_chunk(&self, chunk: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let prepared: Vec<String> = chunk.iter().map(|t| truncate(t)).collect();

        let mut out: Vec<Option<Vec<f32>>> = vec![None; chunk.len()];
        let valid: Vec<usize> = prepared
            .iter()
            .enumerate()
            .filter_map(|(i, text)| match malformed_reason(text) {
                Some(reason) => {
                    warn!(position = i, reason, "skipping text that cannot be embedded");
                    None
                }
                None => Some(i),
            })
            .collect();
        if valid.is_empty() {
            return Ok(out);
        }

        let batch: Vec<String> = valid.iter().map(|&i| prepared[i].clone()).collect();
        match self.embedder.embed(&batch) {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (&i, v) in valid.iter().zip(vectors) {
                    out[i] = Some(v);
                }
                Ok(out)
            }
            Ok(vectors) => Err(Error::Embedding(format!(
                "model returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            ))),
            Err(batch_err) if is_per_text(&batch_err) => {
                // Find the offending text(s) by embedding one at a time.
                debug!(error = %batch_err, "batch failed, retrying texts individually");
                for &i in &valid {
                    match self.embedder.embed(std::slice::from_ref(&prepared[i])) {
                        Ok(mut v) if v.len() == 1 => out[i] = v.pop(),
                        Ok(v) => {
                            return Err(Error::Embedding(format!(
                                "model returned {} vectors for 1 text",
                                v.len()
                            )));
                        }
                        Err(e) if is_per_text(&e) => {
                            warn!(position = i, error = %e, "skipping text the model rejected");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            }
            Err(e) => Err(e),
        }
    }

    /// Produce a vector for every request, from the cache where possible.
    ///
    /// Identical texts are embedded once; the repeats count as cache hits.
    /// Fresh vectors are written back to the cache (not flushed; the caller
    /// decides when to persist).
    ///
    /// A model that rejects every well-formed text it is given is treated as
    /// unusable, not as a batch of bad documents.
    pub fn run(&self, requests: &[EmbedRequest]) -> Result<EmbedOutcome> {
        let model_id = self.embedder.model_id();
        let mut outcome = EmbedOutcome::default();

        let mut misses: Vec<&EmbedRequest> = Vec::new();
        let mut repeats: Vec<&EmbedRequest> = Vec::new();
        let mut queued: HashSet<&str> = HashSet::new();
        for req in requests {
            if outcome.vectors.contains_key(&req.content_hash) {
                outcome.cache_hits += 1;
                continue;
            }
            if let Some(v) = self.cache.get(&req.content_hash, model_id) {
                outcome.vectors.insert(req.content_hash.clone(), v);
                outcome.cache_hits += 1;
            } else if queued.insert(req.content_hash.as_str()) {
                misses.push(req);
            } else {
                repeats.push(req);
            }
        }

        if !misses.is_empty() {
            info!(
                count = misses.len(),
                batch_size = self.batch_size,
                "embedding texts"
            );
            let texts: Vec<String> = misses.iter().map(|r| r.text.clone()).collect();
            let vectors = self.embed_batch(&texts)?;

            for (req, vector) in misses.iter().zip(vectors) {
                if let Some(v) = vector {
                    self.cache.put(&req.content_hash, model_id, v.clone())?;
                    outcome.vectors.insert(req.content_hash.clone(), v);
                    outcome.computed += 1;
                }
            }

            let well_formed = texts
                .iter()
                .filter(|t| malformed_reason(&truncate(t)).is_none())
                .count();
            if well_formed > 0 && outcome.computed == 0 {
                return Err(Error::Embedding(format!(
                    "model {model_id} rejected all {well_formed} texts"
                )));
            }
        }

        outcome.cache_hits += repeats
            .iter()
            .filter(|r| outcome.vectors.contains_key(&r.content_hash))
            .count();

        for req in requests {
            if !outcome.vectors.contains_key(&req.content_hash) {
                let reason = malformed_reason(&truncate(&req.text))
                    .unwrap_or("rejected by the embedding model");
                outcome.skipped.push((req.id, reason.to_string()));
            }
        }

        Ok(outcome)
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_EMBED_CHARS {
        return text.to_string();
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Rejections of one input, as opposed to the model being unusable.
fn is_per_text(err: &Error) -> bool {
    matches!(err, Error::TextRejected(_))
}
