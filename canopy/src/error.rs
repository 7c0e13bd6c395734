//! Error types for cache operations
//!
//! Reads against a store degrade to empty datasets instead of surfacing these
//! errors; writes, explicit refreshes and configuration always surface them.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Configuration error - unrecognized backend, missing settings
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No cached data exists and the caller did not ask for a refresh
    #[error("Cache is empty for '{key}'. Request a refresh (force_update) to fetch data from the metadata source.")]
    CacheMiss { key: String },

    /// Remote metadata source failure - network, auth or malformed documents
    #[error("Metadata source error: {0}")]
    SourceError(String),

    /// Write-boundary failure in a cache backend
    #[error("Storage error: {0}")]
    StorageError(String),

    /// No sidecar metadata has been written for the key
    #[error("No column metadata found for '{key}'")]
    MetadataNotFound { key: String },

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Arrow or Parquet codec error
    #[error("Columnar codec error: {0}")]
    ColumnarError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for CacheError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        CacheError::ColumnarError(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for CacheError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        CacheError::ColumnarError(err.to_string())
    }
}

impl From<object_store::Error> for CacheError {
    fn from(err: object_store::Error) -> Self {
        CacheError::StorageError(err.to_string())
    }
}

impl From<tokio_postgres::Error> for CacheError {
    fn from(err: tokio_postgres::Error) -> Self {
        CacheError::StorageError(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for CacheError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        CacheError::StorageError(format!("Warehouse connection pool: {}", err))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::SourceError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::ConfigError("unknown backend".to_string());
        assert_eq!(error.to_string(), "Configuration error: unknown backend");

        let miss = CacheError::CacheMiss {
            key: "asset_basics".to_string(),
        };
        let message = miss.to_string();
        assert!(message.contains("asset_basics"));
        assert!(message.contains("force_update"));

        let missing = CacheError::MetadataNotFound {
            key: "qc/123".to_string(),
        };
        assert!(missing.to_string().contains("qc/123"));
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: CacheError = json_err.into();
        assert!(matches!(error, CacheError::SerializationError(_)));
    }
}
