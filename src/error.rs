//! Error types for StrataLake

use std::fmt;

/// Result type alias for StrataLake operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for StrataLake
#[derive(Debug)]
pub enum Error {
    /// Arrow-related errors
    Arrow(arrow::error::ArrowError),
    /// Parquet-related errors
    Parquet(parquet::errors::ParquetError),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Invalid schema
    InvalidSchema(String),
    /// Write-ahead log errors
    Wal(String),
    /// The WAL hit an unrecoverable flush failure; durability is gone
    WalPoisoned(String),
    /// Catalog errors
    Catalog(String),
    /// Query error
    Query(String),
    /// Compaction error
    Compaction(String),
    /// Unknown data source
    SourceNotFound(String),
    /// Data source already registered
    SourceExists(String),
    /// Write was logged but failed downstream; entry is marked failed, not rolled back
    WriteFailed { write_id: String, reason: String },
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Arrow(e) => Some(e),
            Error::Parquet(e) => Some(e),
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Arrow(e) => write!(f, "Arrow error: {}", e),
            Error::Parquet(e) => write!(f, "Parquet error: {}", e),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidSchema(msg) => write!(f, "Invalid schema: {}", msg),
            Error::Wal(msg) => write!(f, "WAL error: {}", msg),
            Error::WalPoisoned(msg) => write!(f, "WAL poisoned by flush failure: {}", msg),
            Error::Catalog(msg) => write!(f, "Catalog error: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Compaction(msg) => write!(f, "Compaction error: {}", msg),
            Error::SourceNotFound(id) => write!(f, "Data source not found: {}", id),
            Error::SourceExists(id) => write!(f, "Data source already registered: {}", id),
            Error::WriteFailed { write_id, reason } => {
                write!(f, "Write {} failed after WAL append: {}", write_id, reason)
            }
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(e: arrow::error::ArrowError) -> Self {
        Error::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Error::Parquet(e)
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
