//! Records and the metadata file that lists them.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    data_dir::write_atomic,
    doc_id::RecordId,
    error::{Error, Result},
    incremental::Fingerprint,
    quality::QualityAssessment,
};

/// Version tag of the metadata file layout this build reads and writes.
pub const FORMAT_VERSION: u32 = 1;

/// Where a record came from, and what the source looked like when it was
/// last processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentIdentity {
    /// Name of the source library.
    pub source: String,
    /// Document identity within the source library.
    pub key: String,
    pub size: u64,
    pub mtime: u64,
}

/// Study design / document classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum StudyType {
    MetaAnalysis,
    SystematicReview,
    Rct,
    Cohort,
    CaseControl,
    CrossSectional,
    CaseReport,
    Review,
    Guideline,
    #[default]
    Other,
}

impl StudyType {
    pub fn as_str(self) -> &'static str {
        match self {
            StudyType::MetaAnalysis => "meta-analysis",
            StudyType::SystematicReview => "systematic-review",
            StudyType::Rct => "rct",
            StudyType::Cohort => "cohort",
            StudyType::CaseControl => "case-control",
            StudyType::CrossSectional => "cross-sectional",
            StudyType::CaseReport => "case-report",
            StudyType::Review => "review",
            StudyType::Guideline => "guideline",
            StudyType::Other => "other",
        }
    }
}

impl fmt::Display for StudyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document's canonical metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(
        default,
        rename = "abstract",
        skip_serializing_if = "Option::is_none"
    )]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub study_type: StudyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<u64>,
    /// Quality score, its breakdown and which mode produced it. `None` until
    /// the enrichment stage has run for this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityAssessment>,
    pub has_full_text: bool,
    pub identity: ContentIdentity,
    /// blake3 hash of the extracted text; also the vector cache key.
    pub content_hash: String,
}

impl Record {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            size: self.identity.size,
            mtime: self.identity.mtime,
            content_hash: Some(self.content_hash.clone()),
        }
    }
}

/// Minimal view of the metadata file used to check the version before
/// attempting a full parse.
#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// The metadata file: every record plus the ID counter, format version and
/// the index generation the records belong to.
///
/// This file is the commit point of a run. It is always written last and
/// atomically, so whatever generation it names is the committed one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordStore {
    pub version: u32,
    /// Number of IDs ever assigned. Never decreases, so IDs are not reused.
    pub total_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_generation: Option<u64>,
    pub updated_at: DateTime<Utc>,
    pub records: Vec<Record>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            total_count: 0,
            model_id: None,
            index_generation: None,
            updated_at: Utc::now(),
            records: Vec::new(),
        }
    }
}

impl RecordStore {
    /// Load the metadata file, or an empty store if it does not exist yet.
    ///
    /// An unreadable or incompatible file is a structural error: the records
    /// are authoritative, so guessing would risk a silently wrong index.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read(path)?;

        let header: VersionHeader = serde_json::from_slice(&raw).map_err(|e| {
            Error::Structural(format!(
                "metadata file {} is unreadable: {e}",
                path.display()
            ))
        })?;
        if header.version != FORMAT_VERSION {
            return Err(Error::FormatVersion {
                found: header.version,
                expected: FORMAT_VERSION,
            });
        }

        let store: Self = serde_json::from_slice(&raw).map_err(|e| {
            Error::Structural(format!(
                "metadata file {} is unreadable: {e}",
                path.display()
            ))
        })?;
        store.check_ids()?;
        Ok(store)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.records.sort_by_key(|r| r.id);
        self.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }

    fn check_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for record in &self.records {
            if !seen.insert(record.id) {
                return Err(Error::Structural(format!(
                    "record id {} appears more than once",
                    record.id
                )));
            }
            if record.id.value() == 0 || record.id.value() > self.total_count {
                return Err(Error::Structural(format!(
                    "record id {} is outside the assigned range 1..={}",
                    record.id, self.total_count
                )));
            }
        }
        Ok(())
    }

    /// Assign the next sequential ID.
    pub fn allocate_id(&mut self) -> RecordId {
        self.total_count += 1;
        RecordId::new(self.total_count)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<_> = self.records.iter().map(|r| r.id).collect();
        ids.sort();
        ids
    }

    /// Records indexed by their source key.
    pub fn by_key(&self) -> HashMap<&str, &Record> {
        self.records
            .iter()
            .map(|r| (r.identity.key.as_str(), r))
            .collect()
    }

    /// Position of every record in `records`. Valid until the next change.
    pub fn positions(&self) -> HashMap<RecordId, usize> {
        self.records
            .iter()
            .enumerate()
            .map(|(position, r)| (r.id, position))
            .collect()
    }

    /// [`RecordStore::get`] through a map from [`RecordStore::positions`].
    /// A stale map yields `None` rather than the wrong record.
    pub fn get_at(
        &self,
        positions: &HashMap<RecordId, usize>,
        id: RecordId,
    ) -> Option<&Record> {
        positions
            .get(&id)
            .and_then(|&position| self.records.get(position))
            .filter(|r| r.id == id)
    }

    /// Insert a record, replacing any existing record with the same ID.
    pub fn upsert(&mut self, record: Record) {
        self.upsert_all([record]);
    }

    /// Insert many records, replacing existing ones with the same ID.
    pub fn upsert_all(&mut self, records: impl IntoIterator<Item = Record>) {
        let mut positions = self.positions();
        for record in records {
            match positions.get(&record.id) {
                Some(&position) => self.records[position] = record,
                None => {
                    positions.insert(record.id, self.records.len());
                    self.records.push(record);
                }
            }
        }
    }

    /// Remove records by ID; returns how many were removed.
    pub fn remove(&mut self, ids: &[RecordId]) -> usize {
        let doomed: HashSet<RecordId> = ids.iter().copied().collect();
        let before = self.records.len();
        self.records.retain(|r| !doomed.contains(&r.id));
        before - self.records.len()
    }
}
