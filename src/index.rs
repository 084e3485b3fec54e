//! The vector index and its record-ID mapping.
//!
//! An index generation is an immutable pair of files in the index directory:
//! - `gen-NNNNNN.vectors`: 4 bytes row count (u32 LE), 4 bytes dimension
//!   (u32 LE), then `rows * dimension` f32 values in row-major order
//! - `gen-NNNNNN.ids.json`: the record ID of every row (row = slot), plus the
//!   row count, dimension and a blake3 checksum of the vectors file
//!
//! A new generation is always written to fresh file names and never touched
//! again, so staging one cannot disturb the committed one. It only becomes
//! current once the metadata file names it; see [`crate::sync`].

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    data_dir::write_atomic,
    doc_id::RecordId,
    error::{Error, Result},
};

/// Header size: 4 bytes row count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// Record ID to vector slot.
pub type SlotMapping = BTreeMap<RecordId, usize>;

fn vectors_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("gen-{generation:06}.vectors"))
}

fn ids_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("gen-{generation:06}.ids.json"))
}

/// Generation number encoded in an index file name.
fn parse_generation(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix("gen-")?;
    let (number, ext) = rest.split_once('.')?;
    if ext != "vectors" && ext != "ids.json" {
        return None;
    }
    number.parse().ok()
}

/// Highest generation with any file on disk, committed or not.
fn highest_generation(dir: &Path) -> Result<Option<u64>> {
    let mut highest = None;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(generation) = name.to_str().and_then(parse_generation) {
            highest = highest.max(Some(generation));
        }
    }
    Ok(highest)
}

#[derive(Debug, Serialize, Deserialize)]
struct IdsFile {
    generation: u64,
    rows: usize,
    dimension: usize,
    checksum: String,
    ids: Vec<RecordId>,
}

/// One index generation held in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub number: u64,
    dimension: usize,
    ids: Vec<RecordId>,
    /// Row-major, `ids.len() * dimension` values.
    vectors: Vec<f32>,
    slots: HashMap<RecordId, usize>,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: RecordId,
    pub slot: usize,
    pub score: f32,
}

impl Generation {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Vector dimension; 0 for an empty generation.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    pub fn slot_of(&self, id: RecordId) -> Option<usize> {
        self.slots.get(&id).copied()
    }

    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        if slot >= self.ids.len() {
            return None;
        }
        let start = slot * self.dimension;
        Some(&self.vectors[start..start + self.dimension])
    }

    pub fn vector_of(&self, id: RecordId) -> Option<&[f32]> {
        self.slot_of(id).and_then(|slot| self.vector(slot))
    }

    pub fn mapping(&self) -> SlotMapping {
        self.ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (*id, slot))
            .collect()
    }

    /// Check that the slots cover exactly `expected`: every record has one
    /// slot and no slot belongs to an unknown record.
    pub fn verify(&self, expected: &[RecordId]) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.ids.len());
        for id in &self.ids {
            if !seen.insert(*id) {
                return Err(Error::Structural(format!(
                    "index generation {} has two slots for record {id}",
                    self.number
                )));
            }
        }

        let expected: HashSet<RecordId> = expected.iter().copied().collect();
        if let Some(missing) = expected.iter().find(|id| !seen.contains(id)) {
            return Err(Error::Structural(format!(
                "record {missing} has no slot in index generation {}",
                self.number
            )));
        }
        if let Some(orphan) = self.ids.iter().find(|id| !expected.contains(id)) {
            return Err(Error::Structural(format!(
                "index generation {} has an orphan slot for record {orphan}",
                self.number
            )));
        }
        Ok(())
    }

    /// Exact cosine nearest neighbours, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "query has dimension {} but the index has {}",
                query.len(),
                self.dimension
            )));
        }

        let query_norm = norm(query);
        let mut hits: Vec<Neighbor> = self
            .vectors
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(slot, row)| {
                let denom = query_norm * norm(row);
                let dot: f32 = query.iter().zip(row).map(|(a, b)| a * b).sum();
                Neighbor {
                    id: self.ids[slot],
                    slot,
                    score: if denom > 0.0 { dot / denom } else { 0.0 },
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Read and cross-check a committed generation.
///
/// Any disagreement between the two files is a structural error: the index
/// cannot be trusted and must be rebuilt.
pub fn open_generation(dir: &Path, generation: u64) -> Result<Generation> {
    let ids_file = ids_path(dir, generation);
    let vectors_file = vectors_path(dir, generation);

    let raw_ids = std::fs::read(&ids_file).map_err(|e| {
        Error::Structural(format!(
            "cannot read {}: {e}",
            ids_file.display()
        ))
    })?;
    let ids: IdsFile = serde_json::from_slice(&raw_ids).map_err(|e| {
        Error::Structural(format!("{} is unreadable: {e}", ids_file.display()))
    })?;
    let bytes = std::fs::read(&vectors_file).map_err(|e| {
        Error::Structural(format!(
            "cannot read {}: {e}",
            vectors_file.display()
        ))
    })?;

    let mismatch = |what: &str| {
        Error::Structural(format!(
            "index generation {generation}: vectors and id mapping disagree \
             on {what}"
        ))
    };

    if ids.generation != generation {
        return Err(mismatch("generation number"));
    }
    if blake3::hash(&bytes).to_hex().as_str() != ids.checksum {
        return Err(mismatch("checksum"));
    }
    if bytes.len() < HEADER_SIZE {
        return Err(mismatch("header"));
    }
    let rows = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let dimension =
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if rows != ids.rows || rows != ids.ids.len() {
        return Err(mismatch("row count"));
    }
    if dimension != ids.dimension {
        return Err(mismatch("dimension"));
    }
    if bytes.len() != HEADER_SIZE + rows * dimension * 4 {
        return Err(mismatch("file length"));
    }

    let vectors: Vec<f32> = bytes[HEADER_SIZE..]
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();

    // First slot wins for a duplicated ID; `verify` reports the duplicate.
    let mut slots = HashMap::with_capacity(rows);
    for (slot, id) in ids.ids.iter().enumerate() {
        slots.entry(*id).or_insert(slot);
    }

    debug!(generation, rows, dimension, "opened index generation");
    Ok(Generation {
        number: generation,
        dimension,
        ids: ids.ids,
        vectors,
        slots,
    })
}

/// Sole owner of the index files.
///
/// Changes are made to an in-memory working generation, seeded from the
/// committed one, and written out as a new generation by
/// [`IndexMaintainer::stage`].
#[derive(Debug)]
pub struct IndexMaintainer {
    dir: PathBuf,
    committed: Option<u64>,
    working: Generation,
}

impl IndexMaintainer {
    /// Open the index directory at the committed generation, if any.
    pub fn open(dir: &Path, committed: Option<u64>) -> Result<Self> {
        let working = match committed {
            Some(generation) => open_generation(dir, generation)?,
            None => Generation::default(),
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            committed,
            working,
        })
    }

    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// The working generation, including unstaged changes.
    pub fn current(&self) -> &Generation {
        &self.working
    }

    fn check_dimension(&mut self, vector: &[f32]) -> Result<()> {
        if self.working.is_empty() {
            self.working.dimension = vector.len();
        }
        if vector.is_empty() || vector.len() != self.working.dimension {
            return Err(Error::Structural(format!(
                "vector of dimension {} does not fit an index of dimension {}",
                vector.len(),
                self.working.dimension
            )));
        }
        Ok(())
    }

    /// Add one record in the next free slot. Existing slots do not move.
    pub fn append(&mut self, id: RecordId, vector: &[f32]) -> Result<usize> {
        if self.working.slot_of(id).is_some() {
            return Err(Error::Structural(format!(
                "record {id} already has a slot"
            )));
        }
        self.check_dimension(vector)?;
        let slot = self.working.ids.len();
        self.working.ids.push(id);
        self.working.vectors.extend_from_slice(vector);
        self.working.slots.insert(id, slot);
        Ok(slot)
    }

    /// Replace the whole working generation. Slots are renumbered densely in
    /// record-ID order.
    pub fn rebuild(
        &mut self,
        ids: &[RecordId],
        vectors: &[Vec<f32>],
    ) -> Result<SlotMapping> {
        if ids.len() != vectors.len() {
            return Err(Error::Structural(format!(
                "rebuild given {} ids but {} vectors",
                ids.len(),
                vectors.len()
            )));
        }

        let mut rows: Vec<(RecordId, &Vec<f32>)> =
            ids.iter().copied().zip(vectors).collect();
        rows.sort_by_key(|(id, _)| *id);

        self.working = Generation::default();
        for (id, vector) in rows {
            self.append(id, vector)?;
        }
        info!(rows = self.working.len(), "rebuilt index");
        Ok(self.working.mapping())
    }

    /// Write the working generation as a new, immutable generation and
    /// return its number. Nothing reads it until metadata names it.
    pub fn stage(&mut self) -> Result<u64> {
        // Never overwrite files of an older run, even uncommitted ones.
        let generation = self
            .committed
            .max(highest_generation(&self.dir)?)
            .map_or(1, |g| g + 1);
        let rows = self.working.len();
        let dimension = self.working.dimension;

        let mut bytes =
            Vec::with_capacity(HEADER_SIZE + self.working.vectors.len() * 4);
        bytes.extend_from_slice(&(rows as u32).to_le_bytes());
        bytes.extend_from_slice(&(dimension as u32).to_le_bytes());
        for value in &self.working.vectors {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let ids = IdsFile {
            generation,
            rows,
            dimension,
            checksum: blake3::hash(&bytes).to_hex().to_string(),
            ids: self.working.ids.clone(),
        };

        write_atomic(&vectors_path(&self.dir, generation), &bytes)?;
        write_atomic(
            &ids_path(&self.dir, generation),
            &serde_json::to_vec(&ids)?,
        )?;

        self.working.number = generation;
        debug!(generation, rows, "staged index generation");
        Ok(generation)
    }

    /// Record that `generation` is now the committed one.
    pub fn mark_committed(&mut self, generation: u64) {
        self.committed = Some(generation);
        self.working.number = generation;
    }

    /// Delete every generation except those in `keep`; returns how many
    /// generations were removed.
    pub fn gc(&self, keep: &[u64]) -> Result<usize> {
        let mut removed = HashSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(generation) = name.to_str().and_then(parse_generation)
            else {
                continue;
            };
            if keep.contains(&generation) {
                continue;
            }
            std::fs::remove_file(entry.path())?;
            removed.insert(generation);
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), "removed old index generations");
        }
        Ok(removed.len())
    }
}
