//! Extracted-text cache.
//!
//! Extraction is the slowest per-document step, so its output is cached per
//! source key together with the fingerprint it was produced from. A cached
//! text is only handed back while that fingerprint still matches the source.

use std::{
    collections::HashMap,
    path::Path,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use redb::{
    Database,
    ReadOnlyDatabase,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::Result, incremental::Fingerprint};

const TEXTS: TableDefinition<&str, &[u8]> = TableDefinition::new("texts");

/// A cached extraction result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedText {
    pub text: String,
    pub fingerprint: Fingerprint,
    pub cached_at: DateTime<Utc>,
}

pub trait TextCache: Send + Sync {
    /// Return the cached text for `key` if it was produced from a source
    /// matching `fingerprint`.
    fn get(&self, key: &str, fingerprint: &Fingerprint)
    -> Result<Option<CachedText>>;

    /// Atomically replace whatever is cached for `key`.
    fn put(&self, key: &str, fingerprint: &Fingerprint, text: &str) -> Result<()>;

    fn remove(&self, keys: &[&str]) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn encode(fingerprint: &Fingerprint, text: &str) -> Result<Vec<u8>> {
    let entry = CachedText {
        text: text.to_string(),
        fingerprint: fingerprint.clone(),
        cached_at: Utc::now(),
    };
    Ok(serde_json::to_vec(&entry)?)
}

/// Text cache stored in a redb database: one transaction per write, so an
/// entry is either fully replaced or untouched.
pub struct RedbTextCache {
    db: Database,
}

impl RedbTextCache {
    /// Open or create the cache, dropping entries that no longer parse.
    ///
    /// A database file too damaged to open at all is moved aside and a fresh
    /// cache is started; the cache only ever costs re-extraction.
    pub fn open(path: &Path) -> Result<Self> {
        let db = match Database::create(path) {
            Ok(db) => db,
            Err(redb::DatabaseError::Storage(redb::StorageError::Corrupted(
                reason,
            ))) => {
                let aside = path.with_extension("redb.corrupt");
                warn!(
                    path = %path.display(),
                    %reason,
                    "text cache is corrupted, starting a new one"
                );
                std::fs::rename(path, &aside)?;
                Database::create(path)?
            }
            Err(e) => return Err(e.into()),
        };

        let txn = db.begin_write()?;
        txn.open_table(TEXTS)?;
        txn.commit()?;

        let cache = Self { db };
        let dropped = cache.drop_unparseable()?;
        if dropped > 0 {
            warn!(dropped, "removed unreadable text cache entries");
        }
        Ok(cache)
    }

    /// Number of entries in the cache at `path`, without creating, repairing
    /// or writing to it. A missing cache has none.
    pub fn count_entries(path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let db = ReadOnlyDatabase::open(path)?;
        let txn = db.begin_read()?;
        let table = match txn.open_table(TEXTS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        Ok(table.len()? as usize)
    }

    fn drop_unparseable(&self) -> Result<usize> {
        let bad: Vec<String> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(TEXTS)?;
            let mut bad = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                if serde_json::from_slice::<CachedText>(v.value()).is_err() {
                    warn!(key = k.value(), "dropping unreadable text cache entry");
                    bad.push(k.value().to_string());
                }
            }
            bad
        };

        if !bad.is_empty() {
            let txn = self.db.begin_write()?;
            {
                let mut table = txn.open_table(TEXTS)?;
                for key in &bad {
                    table.remove(key.as_str())?;
                }
            }
            txn.commit()?;
        }
        Ok(bad.len())
    }

    /// Write a raw value, bypassing encoding. Lets tests plant corruption.
    #[cfg(test)]
    fn put_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TEXTS)?;
            table.insert(key, bytes)?;
        }
        txn.commit()?;
        Ok(())
    }
}

impl TextCache for RedbTextCache {
    fn get(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CachedText>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TEXTS)?;
        let Some(guard) = table.get(key)? else {
            return Ok(None);
        };

        let entry: CachedText = match serde_json::from_slice(guard.value()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "unreadable text cache entry, treating as miss");
                return Ok(None);
            }
        };

        if entry.fingerprint.matches(fingerprint) {
            Ok(Some(entry))
        } else {
            debug!(key, "text cache entry is stale");
            Ok(None)
        }
    }

    fn put(&self, key: &str, fingerprint: &Fingerprint, text: &str) -> Result<()> {
        let bytes = encode(fingerprint, text)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TEXTS)?;
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TEXTS)?;
            for key in keys {
                table.remove(*key)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TEXTS)?;
        Ok(table.len()? as usize)
    }
}

impl std::fmt::Debug for RedbTextCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbTextCache").finish_non_exhaustive()
    }
}

/// In-memory text cache for demo runs and tests.
#[derive(Debug, Default)]
pub struct MemoryTextCache {
    entries: RwLock<HashMap<String, CachedText>>,
}

impl MemoryTextCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TextCache for MemoryTextCache {
    fn get(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CachedText>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|e| e.fingerprint.matches(fingerprint))
            .cloned())
    }

    fn put(&self, key: &str, fingerprint: &Fingerprint, text: &str) -> Result<()> {
        let entry = CachedText {
            text: text.to_string(),
            fingerprint: fingerprint.clone(),
            cached_at: Utc::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut entries =
            self.entries.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(size: u64, mtime: u64) -> Fingerprint {
        Fingerprint {
            size,
            mtime,
            content_hash: None,
        }
    }

    fn test_cache() -> (tempfile::TempDir, RedbTextCache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = RedbTextCache::open(&tmp.path().join("text.redb")).unwrap();
        (tmp, cache)
    }

    #[test]
    fn put_then_get_with_same_fingerprint() {
        let (_tmp, cache) = test_cache();
        cache.put("a.md", &fp(5, 100), "hello").unwrap();

        let hit = cache.get("a.md", &fp(5, 100)).unwrap().unwrap();
        assert_eq!(hit.text, "hello");
        assert_eq!(hit.fingerprint, fp(5, 100));
    }

    #[test]
    fn mismatched_fingerprint_is_miss() {
        let (_tmp, cache) = test_cache();
        cache.put("a.md", &fp(5, 100), "hello").unwrap();

        assert!(cache.get("a.md", &fp(5, 101)).unwrap().is_none());
        assert!(cache.get("a.md", &fp(6, 100)).unwrap().is_none());
    }

    #[test]
    fn put_overwrites() {
        let (_tmp, cache) = test_cache();
        cache.put("a.md", &fp(5, 100), "old").unwrap();
        cache.put("a.md", &fp(3, 200), "new").unwrap();

        assert!(cache.get("a.md", &fp(5, 100)).unwrap().is_none());
        assert_eq!(cache.get("a.md", &fp(3, 200)).unwrap().unwrap().text, "new");
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn remove_entries() {
        let (_tmp, cache) = test_cache();
        cache.put("a.md", &fp(1, 1), "a").unwrap();
        cache.put("b.md", &fp(1, 1), "b").unwrap();

        cache.remove(&["a.md"]).unwrap();
        assert!(cache.get("a.md", &fp(1, 1)).unwrap().is_none());
        assert!(cache.get("b.md", &fp(1, 1)).unwrap().is_some());
    }

    #[test]
    fn corrupt_entry_is_dropped_on_open_and_rest_survive() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("text.redb");

        {
            let cache = RedbTextCache::open(&path).unwrap();
            cache.put("good.md", &fp(1, 1), "kept").unwrap();
            cache.put_raw("bad.md", b"{not json").unwrap();
            // Unreadable entries read as a miss even before reopening.
            assert!(cache.get("bad.md", &fp(1, 1)).unwrap().is_none());
        }

        let cache = RedbTextCache::open(&path).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get("good.md", &fp(1, 1)).unwrap().unwrap().text, "kept");
    }

    #[test]
    fn reopen_preserves_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("text.redb");
        {
            let cache = RedbTextCache::open(&path).unwrap();
            cache.put("a.md", &fp(1, 1), "persisted").unwrap();
        }
        let cache = RedbTextCache::open(&path).unwrap();
        assert_eq!(cache.get("a.md", &fp(1, 1)).unwrap().unwrap().text, "persisted");
    }

    #[test]
    fn counting_entries_leaves_the_cache_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("text.redb");
        assert_eq!(RedbTextCache::count_entries(&path).unwrap(), 0);
        assert!(!path.exists());

        {
            let cache = RedbTextCache::open(&path).unwrap();
            cache.put("a.md", &fp(1, 1), "a").unwrap();
            cache.put("b.md", &fp(2, 2), "b").unwrap();
        }
        let before = std::fs::read(&path).unwrap();
        assert_eq!(RedbTextCache::count_entries(&path).unwrap(), 2);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn memory_cache_honours_fingerprint() {
        let cache = MemoryTextCache::new();
        cache.put("a", &fp(1, 1), "x").unwrap();
        assert!(cache.get("a", &fp(1, 1)).unwrap().is_some());
        assert!(cache.get("a", &fp(1, 2)).unwrap().is_none());
        cache.remove(&["a"]).unwrap();
        assert!(cache.is_empty().unwrap());
    }
}
