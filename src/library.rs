//! The source library: where documents come from.
//!
//! The sync engine only needs two capabilities from a library: enumerate what
//! is there (identity, size, mtime) and turn one document into text. Both are
//! behind [`SourceLibrary`] so a directory on disk and an in-memory corpus
//! (demo mode, tests) are interchangeable.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::SystemTime,
};

use crate::error::{Error, Result};

/// Extensions the directory library can extract without an external
/// converter.
const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// One entry of a library snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Identity of the document within its library (a relative path for
    /// directory libraries).
    pub key: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: u64,
}

pub trait SourceLibrary: Send + Sync {
    /// Short name used as the source-system prefix of record identities.
    fn name(&self) -> &str;

    /// Enumerate every document currently in the library.
    fn snapshot(&self) -> Result<Vec<SourceDocument>>;

    /// Convert one document to plain text.
    ///
    /// Failures are per-document; the caller decides whether they matter.
    fn extract(&self, key: &str) -> Result<String>;
}

/// A directory tree of markdown and text files.
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    name: String,
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            Error::Config(format!(
                "cannot open library {}: {e}",
                root.display()
            ))
        })?;
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "library path is not a directory: {}",
                root.display()
            )));
        }
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "library".to_string());
        Ok(Self { name, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceLibrary for DirectoryLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Result<Vec<SourceDocument>> {
        let mut docs = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }

                let path = entry.path();
                let file_type = entry.file_type()?;
                let target = if file_type.is_symlink() {
                    // Broken links are skipped; links to directories are not
                    // followed so a link back into the tree cannot loop.
                    match path.canonicalize() {
                        Ok(resolved) if resolved.is_file() => resolved,
                        _ => continue,
                    }
                } else if file_type.is_dir() {
                    pending.push(path);
                    continue;
                } else {
                    path.clone()
                };

                if !is_supported(&target) {
                    continue;
                }

                let meta = std::fs::metadata(&target)?;
                let mtime = meta
                    .modified()
                    .unwrap_or(SystemTime::UNIX_EPOCH)
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let key = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");

                docs.push(SourceDocument {
                    key,
                    size: meta.len(),
                    mtime,
                });
            }
        }

        docs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(docs)
    }

    fn extract(&self, key: &str) -> Result<String> {
        let path = self.root.join(key);
        let bytes = std::fs::read(&path).map_err(|e| Error::Extraction {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        String::from_utf8(bytes).map_err(|_| Error::Extraction {
            key: key.to_string(),
            reason: "file is not valid UTF-8".to_string(),
        })
    }
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

#[derive(Debug, Clone)]
enum MemoryEntry {
    Text { text: String, mtime: u64 },
    Unreadable { size: u64, mtime: u64 },
}

/// An in-memory library. Backs demo mode and lets tests mutate the source
/// between runs and count extraction calls.
#[derive(Debug, Default)]
pub struct MemoryLibrary {
    name: String,
    docs: RwLock<BTreeMap<String, MemoryEntry>>,
    extractions: AtomicUsize,
}

impl MemoryLibrary {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Add or replace a document.
    pub fn insert(&self, key: &str, text: &str, mtime: u64) {
        self.write().insert(
            key.to_string(),
            MemoryEntry::Text {
                text: text.to_string(),
                mtime,
            },
        );
    }

    /// Add a document whose extraction always fails.
    pub fn insert_unreadable(&self, key: &str, size: u64, mtime: u64) {
        self.write()
            .insert(key.to_string(), MemoryEntry::Unreadable { size, mtime });
    }

    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Number of successful or failed `extract` calls so far.
    pub fn extraction_count(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, MemoryEntry>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, MemoryEntry>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl SourceLibrary for MemoryLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Result<Vec<SourceDocument>> {
        Ok(self
            .read()
            .iter()
            .map(|(key, entry)| {
                let (size, mtime) = match entry {
                    MemoryEntry::Text { text, mtime } => {
                        (text.len() as u64, *mtime)
                    }
                    MemoryEntry::Unreadable { size, mtime } => (*size, *mtime),
                };
                SourceDocument {
                    key: key.clone(),
                    size,
                    mtime,
                }
            })
            .collect())
    }

    fn extract(&self, key: &str) -> Result<String> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        match self.read().get(key) {
            Some(MemoryEntry::Text { text, .. }) => Ok(text.clone()),
            Some(MemoryEntry::Unreadable { .. }) => Err(Error::Extraction {
                key: key.to_string(),
                reason: "converter rejected the document".to_string(),
            }),
            None => Err(Error::NotFound {
                kind: "document",
                name: key.to_string(),
            }),
        }
    }
}
