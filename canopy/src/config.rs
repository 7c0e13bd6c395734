//! Configuration for stores, the metadata source and synchronization
//!
//! Everything is resolved once at process start. The backend selector is an
//! explicit enumeration: an unrecognized value fails startup instead of
//! silently falling back to the in-memory store.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable selecting the cache backend
pub const BACKEND_ENV: &str = "CANOPY_BACKEND";

/// Which cache store implementation to run with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process map, lost at exit
    #[default]
    Memory,
    /// Parquet objects in a bucket
    ObjectStore,
    /// Tables in a PostgreSQL-protocol warehouse
    Warehouse,
}

impl BackendKind {
    /// Accepted selector values
    pub const ACCEPTED: &'static [&'static str] =
        &["memory", "s3", "object_store", "redshift", "warehouse"];
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "s3" | "object_store" => Ok(BackendKind::ObjectStore),
            "redshift" | "warehouse" => Ok(BackendKind::Warehouse),
            other => Err(CacheError::ConfigError(format!(
                "Unrecognized cache backend '{}'; expected one of: {}",
                other,
                BackendKind::ACCEPTED.join(", ")
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::ObjectStore => write!(f, "object_store"),
            BackendKind::Warehouse => write!(f, "warehouse"),
        }
    }
}

/// Naming convention for stored artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNaming {
    /// Namespace token prepended to every key
    pub prefix: String,
    /// File extension for object-store tables
    pub extension: String,
    /// Key families whose members share a single sidecar
    pub grouped_namespaces: Vec<String>,
}

impl Default for TableNaming {
    fn default() -> Self {
        Self {
            prefix: "zs_".to_string(),
            extension: ".pqt".to_string(),
            grouped_namespaces: vec!["qc".to_string()],
        }
    }
}

/// Object store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Bucket name (required for the object-store backend)
    pub bucket: Option<String>,
    /// Path inside the bucket under which all caches live
    pub root: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            root: "application-caches".to_string(),
        }
    }
}

/// Warehouse connection settings
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5439,
            dbname: "dev".to_string(),
            user: "canopy".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Remote metadata source settings
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub host: String,
    pub version: String,
    pub database: String,
    pub collection: String,
    /// Timeout for a single request
    pub timeout: Duration,
    /// Maximum number of retry attempts for transient failures
    pub max_retries: u32,
    /// Base delay between retry attempts
    pub retry_delay: Duration,
    /// Records per page when an unlimited retrieval is paginated
    pub page_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "api.allenneuraldynamics.org".to_string(),
            version: "v2".to_string(),
            database: "metadata_index".to_string(),
            collection: "data_assets".to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            page_size: 500,
        }
    }
}

/// Synchronization settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on concurrently refreshing groups during fan-out
    pub max_workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { max_workers: 8 }
    }
}

/// Complete process configuration
#[derive(Debug, Clone, Default)]
pub struct CanopyConfig {
    pub backend: BackendKind,
    pub naming: TableNaming,
    pub object_store: ObjectStoreConfig,
    pub warehouse: WarehouseConfig,
    pub source: SourceConfig,
    pub sync: SyncConfig,
}

impl CanopyConfig {
    /// Create a new builder
    pub fn builder() -> CanopyConfigBuilder {
        CanopyConfigBuilder::default()
    }

    /// Load `.env` (if present) and read the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CanopyConfig::default();

        let backend = match lookup(BACKEND_ENV) {
            Some(value) => value.parse()?,
            None => defaults.backend,
        };

        let naming = TableNaming {
            prefix: lookup("CANOPY_TABLE_PREFIX").unwrap_or(defaults.naming.prefix),
            ..defaults.naming
        };

        let object_store = ObjectStoreConfig {
            bucket: lookup("CANOPY_BUCKET").filter(|b| !b.is_empty()),
            root: lookup("CANOPY_CACHE_ROOT").unwrap_or(defaults.object_store.root),
        };

        let warehouse = WarehouseConfig {
            host: lookup("CANOPY_WAREHOUSE_HOST").unwrap_or(defaults.warehouse.host),
            port: parse_or(&lookup, "CANOPY_WAREHOUSE_PORT", defaults.warehouse.port)?,
            dbname: lookup("CANOPY_WAREHOUSE_DB").unwrap_or(defaults.warehouse.dbname),
            user: lookup("CANOPY_WAREHOUSE_USER").unwrap_or(defaults.warehouse.user),
            password: lookup("CANOPY_WAREHOUSE_PASSWORD").unwrap_or_default(),
            max_size: parse_or(&lookup, "CANOPY_WAREHOUSE_POOL_SIZE", defaults.warehouse.max_size)?,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "CANOPY_WAREHOUSE_TIMEOUT",
                defaults.warehouse.timeout.as_secs(),
            )?),
        };

        let source = SourceConfig {
            host: lookup("CANOPY_SOURCE_HOST").unwrap_or(defaults.source.host),
            version: lookup("CANOPY_SOURCE_VERSION").unwrap_or(defaults.source.version),
            database: lookup("CANOPY_SOURCE_DATABASE").unwrap_or(defaults.source.database),
            collection: lookup("CANOPY_SOURCE_COLLECTION").unwrap_or(defaults.source.collection),
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "CANOPY_SOURCE_TIMEOUT",
                defaults.source.timeout.as_secs(),
            )?),
            max_retries: parse_or(&lookup, "CANOPY_SOURCE_RETRIES", defaults.source.max_retries)?,
            page_size: parse_or(&lookup, "CANOPY_SOURCE_PAGE_SIZE", defaults.source.page_size)?,
            ..defaults.source
        };

        let sync = SyncConfig {
            max_workers: parse_or(&lookup, "CANOPY_SYNC_WORKERS", defaults.sync.max_workers)?,
        };

        let config = CanopyConfig {
            backend,
            naming,
            object_store,
            warehouse,
            source,
            sync,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::ObjectStore && self.object_store.bucket.is_none() {
            return Err(CacheError::ConfigError(
                "CANOPY_BUCKET must be set for the object_store backend".to_string(),
            ));
        }

        if self.sync.max_workers == 0 {
            return Err(CacheError::ConfigError(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.source.page_size == 0 {
            return Err(CacheError::ConfigError(
                "page_size must be greater than 0".to_string(),
            ));
        }

        if self.naming.prefix.is_empty() {
            return Err(CacheError::ConfigError(
                "table prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            CacheError::ConfigError(format!("Invalid value '{}' for {}", raw, name))
        }),
        None => Ok(default),
    }
}

/// Builder for process configuration
#[derive(Debug, Default)]
pub struct CanopyConfigBuilder {
    backend: Option<BackendKind>,
    naming: Option<TableNaming>,
    bucket: Option<String>,
    root: Option<String>,
    warehouse: Option<WarehouseConfig>,
    source: Option<SourceConfig>,
    max_workers: Option<usize>,
}

impl CanopyConfigBuilder {
    /// Set the backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the artifact naming convention
    pub fn naming(mut self, naming: TableNaming) -> Self {
        self.naming = Some(naming);
        self
    }

    /// Set the object store bucket
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object store root path
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Set warehouse connection settings
    pub fn warehouse(mut self, warehouse: WarehouseConfig) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Set metadata source settings
    pub fn source(mut self, source: SourceConfig) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the fan-out worker bound
    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    /// Build the configuration
    pub fn build(self) -> CanopyConfig {
        let defaults = CanopyConfig::default();

        CanopyConfig {
            backend: self.backend.unwrap_or(defaults.backend),
            naming: self.naming.unwrap_or(defaults.naming),
            object_store: ObjectStoreConfig {
                bucket: self.bucket.or(defaults.object_store.bucket),
                root: self.root.unwrap_or(defaults.object_store.root),
            },
            warehouse: self.warehouse.unwrap_or(defaults.warehouse),
            source: self.source.unwrap_or(defaults.source),
            sync: SyncConfig {
                max_workers: self.max_workers.unwrap_or(defaults.sync.max_workers),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CanopyConfig::default();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.naming.prefix, "zs_");
        assert_eq!(config.sync.max_workers, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::ObjectStore);
        assert_eq!("Redshift".parse::<BackendKind>().unwrap(), BackendKind::Warehouse);

        let err = "dynamo".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));
        assert!(err.to_string().contains("dynamo"));
    }

    #[test]
    fn test_from_lookup_unrecognized_backend_is_fatal() {
        let result = CanopyConfig::from_lookup(lookup(&[(BACKEND_ENV, "sqlite")]));
        assert!(matches!(result, Err(CacheError::ConfigError(_))));
    }

    #[test]
    fn test_from_lookup_object_store_requires_bucket() {
        let result = CanopyConfig::from_lookup(lookup(&[(BACKEND_ENV, "s3")]));
        assert!(result.is_err());

        let config = CanopyConfig::from_lookup(lookup(&[
            (BACKEND_ENV, "s3"),
            ("CANOPY_BUCKET", "scratch"),
            ("CANOPY_SYNC_WORKERS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.backend, BackendKind::ObjectStore);
        assert_eq!(config.object_store.bucket.as_deref(), Some("scratch"));
        assert_eq!(config.sync.max_workers, 3);
    }

    #[test]
    fn test_from_lookup_rejects_bad_numbers() {
        let result = CanopyConfig::from_lookup(lookup(&[("CANOPY_SYNC_WORKERS", "many")]));
        assert!(result.is_err());

        let result = CanopyConfig::from_lookup(lookup(&[("CANOPY_SYNC_WORKERS", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = CanopyConfig::builder()
            .backend(BackendKind::ObjectStore)
            .bucket("bucket")
            .root("caches")
            .max_workers(2)
            .build();

        assert_eq!(config.backend, BackendKind::ObjectStore);
        assert_eq!(config.object_store.root, "caches");
        assert_eq!(config.sync.max_workers, 2);
        assert!(config.validate().is_ok());
    }
}
