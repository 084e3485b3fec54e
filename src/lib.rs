//! litbase - keeps a semantic knowledge base in sync with a document library.
//!
//! Documents are extracted to text, normalized into records, embedded into
//! vectors and scored for quality with the help of an external metadata API.
//! Each stage is incremental: unchanged documents are never re-extracted,
//! unchanged texts are never re-embedded, and an interrupted enrichment run
//! resumes from its checkpoint. Every run ends in a single atomic commit, so
//! searches always see a consistent index.
//!
//! # Quick start
//!
//! ```no_run
//! use litbase::{DataDir, SyncConfig, SyncMode, Synchronizer};
//! use litbase::embedding::HashingEmbedder;
//! use litbase::library::DirectoryLibrary;
//! use litbase::text_cache::MemoryTextCache;
//! use litbase::vector_cache::MemoryVectorCache;
//!
//! # async fn run() -> litbase::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let library = DirectoryLibrary::open("papers".as_ref())?;
//! let (texts, vectors) = (MemoryTextCache::new(), MemoryVectorCache::new());
//! let embedder = HashingEmbedder::default();
//! let config = SyncConfig { offline: true, ..SyncConfig::default() };
//!
//! let report = Synchronizer::new(
//!     &data_dir, &library, &texts, &vectors, &embedder, &config,
//! )
//! .run(SyncMode::Incremental)
//! .await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod data_dir;
pub mod demo;
pub mod doc_id;
pub mod embedding;
pub mod enrichment;
pub mod error;
pub mod incremental;
pub mod index;
pub mod library;
pub mod model_manager;
pub mod normalize;
pub mod quality;
pub mod record;
pub mod search;
pub mod sync;
pub mod text_cache;
pub mod vector_cache;

pub use config::SyncConfig;
pub use data_dir::DataDir;
pub use doc_id::RecordId;
pub use error::{Error, Result};
pub use record::{Record, RecordStore};
pub use search::KnowledgeBase;
pub use sync::{CancelFlag, SyncMode, SyncReport, Synchronizer};
