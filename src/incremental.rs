use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{doc_id::RecordId, library::SourceDocument, record::Record};

/// Lightweight descriptor used to decide whether a source document changed.
///
/// Size and mtime are known from a library snapshot alone; the content hash
/// only after extraction, so it is optional.
///
/// # Examples
///
/// ```
/// use litbase::incremental::Fingerprint;
///
/// let seen = Fingerprint { size: 10, mtime: 5, content_hash: None };
/// let cached = seen.clone().with_hash("abc");
/// assert!(cached.matches(&seen));
/// assert!(!cached.matches(&Fingerprint { size: 11, mtime: 5, content_hash: None }));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub mtime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl Fingerprint {
    pub fn of(doc: &SourceDocument) -> Self {
        Self {
            size: doc.size,
            mtime: doc.mtime,
            content_hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Size and mtime must agree; hashes are compared only when both sides
    /// carry one.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        if self.size != other.size || self.mtime != other.mtime {
            return false;
        }
        match (&self.content_hash, &other.content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// blake3 hash of extracted text, hex-encoded.
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Result of comparing a library snapshot against the stored records.
///
/// `new`, `updated` and `deleted` are disjoint and together with `unchanged`
/// cover every document on either side exactly once.
#[derive(Debug, Default)]
pub struct LibraryDiff {
    /// Documents with no record yet.
    pub new: Vec<SourceDocument>,
    /// Documents whose fingerprint no longer matches their record.
    pub updated: Vec<(RecordId, SourceDocument)>,
    /// Records whose document is gone from the library.
    pub deleted: Vec<RecordId>,
    pub unchanged: Vec<RecordId>,
}

impl LibraryDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Compare a library snapshot against stored records.
///
/// Pure: no I/O, and the result depends only on the two inputs.
pub fn diff_library(
    snapshot: &[SourceDocument],
    records: &[Record],
) -> LibraryDiff {
    let known: HashMap<&str, &Record> = records
        .iter()
        .map(|r| (r.identity.key.as_str(), r))
        .collect();

    let mut diff = LibraryDiff::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for doc in snapshot {
        // A key listed twice by a misbehaving library is handled once.
        if !seen.insert(doc.key.as_str()) {
            continue;
        }
        match known.get(doc.key.as_str()) {
            None => diff.new.push(doc.clone()),
            Some(record) => {
                if record.fingerprint().matches(&Fingerprint::of(doc)) {
                    diff.unchanged.push(record.id);
                } else {
                    diff.updated.push((record.id, doc.clone()));
                }
            }
        }
    }

    for record in records {
        if !seen.contains(record.identity.key.as_str()) {
            diff.deleted.push(record.id);
        }
    }

    diff
}
