//! Vector cache keyed by content hash.
//!
//! Vectors are reusable across runs only for the model that produced them:
//! opening the cache for a different model, or storing a vector under a new
//! model, discards every entry.
//!
//! On disk the cache is two files:
//! - `vector_cache.json`: side table of `{model_id, dimension, entries}` where
//!   each entry maps a content hash to a row and a checksum of that row
//! - `vector_cache.bin`: 4 bytes row count (u32 LE), 4 bytes dimension
//!   (u32 LE), then `rows * dimension` f32 values in row-major order
//!
//! Entries are validated one by one on load; a row that is out of range or
//! fails its checksum is dropped with a warning and the rest are kept.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::RwLock,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    data_dir::write_atomic,
    error::{Error, Result},
};

/// Header size: 4 bytes row count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

pub trait VectorCache: Send + Sync {
    /// The cached vector for `content_hash`, if it was computed by
    /// `model_id`.
    fn get(&self, content_hash: &str, model_id: &str) -> Option<Vec<f32>>;

    /// Store a vector. A `model_id` different from the cache's current
    /// model invalidates every existing entry first.
    fn put(&self, content_hash: &str, model_id: &str, vector: Vec<f32>)
    -> Result<()>;

    /// Drop every entry whose hash is not in `keep`; returns how many went.
    fn retain(&self, keep: &HashSet<String>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist pending changes, if the implementation is persistent.
    fn flush(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct CacheState {
    model_id: Option<String>,
    dimension: Option<usize>,
    entries: HashMap<String, Vec<f32>>,
    dirty: bool,
}

impl CacheState {
    fn get(&self, content_hash: &str, model_id: &str) -> Option<Vec<f32>> {
        if self.model_id.as_deref() != Some(model_id) {
            return None;
        }
        self.entries.get(content_hash).cloned()
    }

    fn put(
        &mut self,
        content_hash: &str,
        model_id: &str,
        vector: Vec<f32>,
    ) -> Result<()> {
        if self.model_id.as_deref() != Some(model_id) {
            if !self.entries.is_empty() {
                info!(
                    from = self.model_id.as_deref().unwrap_or("none"),
                    to = model_id,
                    dropped = self.entries.len(),
                    "embedding model changed, invalidating vector cache"
                );
            }
            self.entries.clear();
            self.model_id = Some(model_id.to_string());
            self.dimension = None;
        }

        match self.dimension {
            Some(dim) if dim != vector.len() => {
                return Err(Error::Embedding(format!(
                    "vector for {content_hash} has dimension {} but the \
                     cache holds dimension {dim}",
                    vector.len()
                )));
            }
            Some(_) => {}
            None => self.dimension = Some(vector.len()),
        }

        self.entries.insert(content_hash.to_string(), vector);
        self.dirty = true;
        Ok(())
    }

    fn retain(&mut self, keep: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|hash, _| keep.contains(hash));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SideTable {
    model_id: String,
    dimension: usize,
    entries: BTreeMap<String, SideEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SideEntry {
    row: usize,
    checksum: String,
}

fn row_checksum(vector: &[f32]) -> String {
    let hash = blake3::hash(bytemuck::cast_slice(vector));
    hash.to_hex()[..16].to_string()
}

/// File-backed vector cache. Reads are served from memory; `flush` rewrites
/// the blob and side table.
pub struct FileVectorCache {
    meta_path: PathBuf,
    blob_path: PathBuf,
    state: RwLock<CacheState>,
}

impl FileVectorCache {
    /// Load the cache for `model_id`. Entries from another model are
    /// discarded.
    pub fn open(meta_path: &Path, blob_path: &Path, model_id: &str) -> Result<Self> {
        let mut state = CacheState {
            model_id: Some(model_id.to_string()),
            ..CacheState::default()
        };

        if let Some(table) = load_side_table(meta_path) {
            if table.model_id != model_id {
                info!(
                    cached = %table.model_id,
                    configured = model_id,
                    "embedding model changed, invalidating vector cache"
                );
                state.dirty = true;
            } else {
                let (entries, dropped) = load_rows(blob_path, &table);
                if dropped > 0 {
                    warn!(dropped, "dropped unreadable vector cache entries");
                    state.dirty = true;
                }
                if !entries.is_empty() {
                    state.dimension = Some(table.dimension);
                }
                state.entries = entries;
            }
        }

        Ok(Self {
            meta_path: meta_path.to_path_buf(),
            blob_path: blob_path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_side_table(path: &Path) -> Option<SideTable> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read vector cache");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "vector cache side table is unreadable, starting empty"
            );
            None
        }
    }
}

/// Read every row the side table points at, keeping only rows that are in
/// range and match their checksum.
fn load_rows(
    blob_path: &Path,
    table: &SideTable,
) -> (HashMap<String, Vec<f32>>, usize) {
    let bytes = match std::fs::read(blob_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %blob_path.display(), error = %e, "cannot read vector blob");
            return (HashMap::new(), table.entries.len());
        }
    };

    if bytes.len() < HEADER_SIZE {
        return (HashMap::new(), table.entries.len());
    }
    let rows = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let dimension =
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if dimension != table.dimension {
        warn!(
            blob = dimension,
            table = table.dimension,
            "vector blob dimension disagrees with side table"
        );
        return (HashMap::new(), table.entries.len());
    }

    let row_bytes = dimension * 4;
    let available_rows = (bytes.len() - HEADER_SIZE) / row_bytes.max(1);
    let rows = rows.min(available_rows);

    let mut entries = HashMap::with_capacity(table.entries.len());
    let mut dropped = 0;
    for (hash, entry) in &table.entries {
        if entry.row >= rows {
            warn!(hash = %hash, row = entry.row, "vector cache row out of range");
            dropped += 1;
            continue;
        }
        let start = HEADER_SIZE + entry.row * row_bytes;
        let vector: Vec<f32> = bytes[start..start + row_bytes]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();
        if row_checksum(&vector) != entry.checksum {
            warn!(hash = %hash, "vector cache row failed its checksum");
            dropped += 1;
            continue;
        }
        entries.insert(hash.clone(), vector);
    }
    (entries, dropped)
}

impl VectorCache for FileVectorCache {
    fn get(&self, content_hash: &str, model_id: &str) -> Option<Vec<f32>> {
        self.read().get(content_hash, model_id)
    }

    fn put(
        &self,
        content_hash: &str,
        model_id: &str,
        vector: Vec<f32>,
    ) -> Result<()> {
        self.write().put(content_hash, model_id, vector)
    }

    fn retain(&self, keep: &HashSet<String>) -> usize {
        self.write().retain(keep)
    }

    fn len(&self) -> usize {
        self.read().entries.len()
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.write();
        if !state.dirty {
            return Ok(());
        }

        let model_id = state.model_id.clone().unwrap_or_default();
        let dimension = state.dimension.unwrap_or(0);

        let mut hashes: Vec<&String> = state.entries.keys().collect();
        hashes.sort();

        let mut blob = Vec::with_capacity(
            HEADER_SIZE + hashes.len() * dimension * 4,
        );
        blob.extend_from_slice(&(hashes.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(dimension as u32).to_le_bytes());

        let mut entries = BTreeMap::new();
        for (row, hash) in hashes.iter().enumerate() {
            let vector = &state.entries[*hash];
            blob.extend_from_slice(bytemuck::cast_slice(vector));
            entries.insert(
                (*hash).clone(),
                SideEntry {
                    row,
                    checksum: row_checksum(vector),
                },
            );
        }

        let table = SideTable {
            model_id,
            dimension,
            entries,
        };

        // Blob first: if we stop between the two renames the old side
        // table's checksums reject the rows that moved, nothing worse.
        write_atomic(&self.blob_path, &blob)?;
        write_atomic(&self.meta_path, &serde_json::to_vec(&table)?)?;
        state.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for FileVectorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileVectorCache")
            .field("meta_path", &self.meta_path)
            .finish_non_exhaustive()
    }
}

/// In-memory vector cache for demo runs and tests.
#[derive(Debug, Default)]
pub struct MemoryVectorCache {
    state: RwLock<CacheState>,
}

impl MemoryVectorCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorCache for MemoryVectorCache {
    fn get(&self, content_hash: &str, model_id: &str) -> Option<Vec<f32>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(content_hash, model_id)
    }

    fn put(
        &self,
        content_hash: &str,
        model_id: &str,
        vector: Vec<f32>,
    ) -> Result<()> {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .put(content_hash, model_id, vector)
    }

    fn retain(&self, keep: &HashSet<String>) -> usize {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(keep)
    }

    fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(tmp: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (
            tmp.path().join("vector_cache.json"),
            tmp.path().join("vector_cache.bin"),
        )
    }

    #[test]
    fn put_get_flush_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let (meta, blob) = paths(&tmp);

        {
            let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
            cache.put("h1", "m1", vec![1.0, 2.0, 3.0]).unwrap();
            cache.put("h2", "m1", vec![4.0, 5.0, 6.0]).unwrap();
            cache.flush().unwrap();
        }

        let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("h1", "m1").unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.get("h2", "m1").unwrap(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn vectors_survive_bit_for_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let (meta, blob) = paths(&tmp);
        let v = vec![f32::MIN_POSITIVE, -0.0, 1.0 / 3.0];

        {
            let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
            cache.put("h", "m1", v.clone()).unwrap();
            cache.flush().unwrap();
        }
        let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
        let back = cache.get("h", "m1").unwrap();
        let bits = |x: &[f32]| x.iter().map(|f| f.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back), bits(&v));
    }

    #[test]
    fn other_model_is_a_miss() {
        let cache = MemoryVectorCache::new();
        cache.put("h1", "m1", vec![1.0]).unwrap();
        assert!(cache.get("h1", "m2").is_none());
    }

    #[test]
    fn model_change_on_open_invalidates_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let (meta, blob) = paths(&tmp);
        {
            let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
            cache.put("h1", "m1", vec![1.0, 2.0]).unwrap();
            cache.flush().unwrap();
        }

        let cache = FileVectorCache::open(&meta, &blob, "m2").unwrap();
        assert!(cache.is_empty());
        assert!(cache.get("h1", "m1").is_none());
    }

    #[test]
    fn model_change_on_put_invalidates_everything() {
        let cache = MemoryVectorCache::new();
        cache.put("h1", "m1", vec![1.0, 2.0]).unwrap();
        cache.put("h2", "m2", vec![3.0]).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.get("h1", "m1").is_none());
        assert_eq!(cache.get("h2", "m2").unwrap(), vec![3.0]);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let cache = MemoryVectorCache::new();
        cache.put("h1", "m1", vec![1.0, 2.0]).unwrap();
        assert!(cache.put("h2", "m1", vec![1.0]).is_err());
    }

    #[test]
    fn corrupted_row_is_dropped_and_rest_survive() {
        let tmp = tempfile::tempdir().unwrap();
        let (meta, blob) = paths(&tmp);
        {
            let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
            cache.put("a", "m1", vec![1.0, 1.0]).unwrap();
            cache.put("b", "m1", vec![2.0, 2.0]).unwrap();
            cache.flush().unwrap();
        }

        // Rows are written in hash order, so "a" is row 0. Flip one of its
        // bytes.
        let mut bytes = std::fs::read(&blob).unwrap();
        bytes[HEADER_SIZE] ^= 0xff;
        std::fs::write(&blob, bytes).unwrap();

        let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a", "m1").is_none());
        assert_eq!(cache.get("b", "m1").unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn truncated_blob_drops_only_missing_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let (meta, blob) = paths(&tmp);
        {
            let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
            cache.put("a", "m1", vec![1.0]).unwrap();
            cache.put("b", "m1", vec![2.0]).unwrap();
            cache.flush().unwrap();
        }

        let bytes = std::fs::read(&blob).unwrap();
        std::fs::write(&blob, &bytes[..bytes.len() - 4]).unwrap();

        let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a", "m1").is_some());
    }

    #[test]
    fn garbage_side_table_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let (meta, blob) = paths(&tmp);
        std::fs::write(&meta, "{{{").unwrap();

        let cache = FileVectorCache::open(&meta, &blob, "m1").unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn retain_prunes_unreferenced_hashes() {
        let cache = MemoryVectorCache::new();
        cache.put("a", "m1", vec![1.0]).unwrap();
        cache.put("b", "m1", vec![2.0]).unwrap();

        let keep: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(cache.retain(&keep), 1);
        assert!(cache.get("b", "m1").is_none());
    }
}
