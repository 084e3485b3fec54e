use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error(
        "knowledge base format version {found} is not supported \
         (expected {expected}); run `litbase rebuild` to start over"
    )]
    FormatVersion { found: u32, expected: u32 },

    #[error(
        "knowledge base is inconsistent: {0}; run `litbase rebuild` to \
         recreate the index from scratch"
    )]
    Structural(String),

    #[error(
        "index was built with model '{indexed}' but '{requested}' is \
         configured; run `litbase rebuild` to re-embed"
    )]
    ModelMismatch { indexed: String, requested: String },

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("text cannot be embedded: {0}")]
    TextRejected(String),

    #[error("extraction failed for {key}: {reason}")]
    Extraction { key: String, reason: String },

    #[error("run cancelled; progress was checkpointed and can be resumed")]
    Cancelled,
}
