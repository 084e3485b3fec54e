use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "LITBASE_DATA_DIR";

/// Files backing one text cache and one vector cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub text_db: PathBuf,
    pub vector_meta: PathBuf,
    pub vector_blob: PathBuf,
}

/// On-disk layout of one knowledge base.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The LITBASE_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/litbase/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("litbase")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Record list, total count and format version.
    pub fn metadata_file(&self) -> PathBuf {
        self.root.join("metadata.json")
    }

    pub fn text_cache_db(&self) -> PathBuf {
        self.root.join("text_cache.redb")
    }

    /// JSON side table of the vector cache.
    pub fn vector_cache_meta(&self) -> PathBuf {
        self.root.join("vector_cache.json")
    }

    /// Raw f32 blob of the vector cache.
    pub fn vector_cache_blob(&self) -> PathBuf {
        self.root.join("vector_cache.bin")
    }

    /// Caches for the configured library.
    pub fn caches(&self) -> CachePaths {
        CachePaths {
            text_db: self.text_cache_db(),
            vector_meta: self.vector_cache_meta(),
            vector_blob: self.vector_cache_blob(),
        }
    }

    /// Caches for the demo corpus. Seeding never reads, prunes or
    /// invalidates the library's caches.
    pub fn demo_caches(&self) -> CachePaths {
        CachePaths {
            text_db: self.root.join("demo_text_cache.redb"),
            vector_meta: self.root.join("demo_vector_cache.json"),
            vector_blob: self.root.join("demo_vector_cache.bin"),
        }
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.root.join("enrichment.checkpoint.json")
    }

    pub fn index_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("index");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}

/// Write `bytes` to `path` atomically: a temp file in the same directory is
/// fsynced and then renamed over the destination.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
