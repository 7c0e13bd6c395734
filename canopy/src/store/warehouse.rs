//! Relational warehouse backend
//!
//! Each key maps to one table, `<prefix><escaped key>`; see
//! [`TableNaming::table_ident`]. A write replaces the table and its sidecar
//! table inside one transaction, so readers see either the previous snapshot
//! or the new one, and the sidecar always matches the table beside it.

use crate::columnar::{cell_json, cell_text, ColumnKind};
use crate::config::{TableNaming, WarehouseConfig};
use crate::dataset::Dataset;
use crate::error::{CacheError, Result};
use crate::store::{SidecarMetadata, Store};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde_json::{Number, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Column holding one column name per row in sidecar tables
pub const SIDECAR_COLUMN: &str = "column_name";

/// Column comment marking JSON-text columns
pub const JSON_COLUMN_COMMENT: &str = "canopy:json";

/// Upper bound on bind parameters per INSERT statement
const MAX_PARAMS_PER_STATEMENT: usize = 16_000;

/// PostgreSQL truncates longer identifiers
const MAX_IDENT_BYTES: usize = 63;

/// Table-level operations a warehouse must support
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Replace every listed table wholesale (drop-and-recreate semantics)
    ///
    /// All tables are replaced or, on error, none of them is.
    async fn overwrite_tables(&self, tables: &[(&str, &Dataset)]) -> Result<()>;

    /// Full scan of the table
    async fn read_table(&self, name: &str) -> Result<Dataset>;
}

/// Store backed by a [`Warehouse`]
pub struct WarehouseStore {
    warehouse: Arc<dyn Warehouse>,
    naming: TableNaming,
}

impl WarehouseStore {
    pub fn new(warehouse: Arc<dyn Warehouse>, naming: TableNaming) -> Self {
        Self { warehouse, naming }
    }
}

#[async_trait]
impl Store for WarehouseStore {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    async fn write(&self, key: &str, data: &Dataset, write_sidecar: bool) -> Result<()> {
        let table = self.naming.table_ident(key);
        let sidecar = write_sidecar.then(|| {
            (
                self.naming.sidecar_ident(key),
                sidecar_dataset(&SidecarMetadata::of(data)),
            )
        });

        let mut tables: Vec<(&str, &Dataset)> = vec![(table.as_str(), data)];
        if let Some((name, meta)) = &sidecar {
            tables.push((name.as_str(), meta));
        }
        self.warehouse.overwrite_tables(&tables).await?;

        info!(
            store = self.name(),
            key,
            table = %table,
            rows = data.len(),
            sidecar = sidecar.is_some(),
            "Stored cache table"
        );
        Ok(())
    }

    async fn read(&self, key: &str) -> Dataset {
        let table = self.naming.table_ident(key);
        match self.warehouse.read_table(&table).await {
            Ok(data) => {
                debug!(store = self.name(), key, rows = data.len(), "Retrieved cache table");
                data
            }
            Err(e) => {
                warn!(store = self.name(), key, error = %e, "Error fetching from cache");
                Dataset::empty()
            }
        }
    }

    async fn columns(&self, key: &str) -> Result<Vec<String>> {
        let table = self.naming.sidecar_ident(key);
        let data = self.warehouse.read_table(&table).await.map_err(|e| {
            debug!(store = self.name(), key, error = %e, "Sidecar table unavailable");
            CacheError::MetadataNotFound {
                key: key.to_string(),
            }
        })?;

        Ok(data
            .column_values(SIDECAR_COLUMN)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

fn sidecar_dataset(meta: &SidecarMetadata) -> Dataset {
    Dataset::from_rows(
        vec![SIDECAR_COLUMN.to_string()],
        meta.columns
            .iter()
            .map(|c| vec![Value::String(c.clone())])
            .collect(),
    )
}

/// PostgreSQL-protocol warehouse (PostgreSQL, Redshift)
#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: Pool,
}

impl PostgresWarehouse {
    /// Create a connection pool; connections are opened lazily
    pub fn connect(config: &WarehouseConfig) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.dbname.clone());
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.connect_timeout = Some(config.timeout);
        cfg.pool = Some(PoolConfig::new(config.max_size));

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| CacheError::ConfigError(format!("Failed to create warehouse pool: {}", e)))?;

        info!(host = %config.host, dbname = %config.dbname, "Configured warehouse pool");
        Ok(Self { pool })
    }

    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Boolean => "BOOLEAN",
        ColumnKind::Integer => "BIGINT",
        ColumnKind::Float => "DOUBLE PRECISION",
        ColumnKind::Text | ColumnKind::Json => "VARCHAR(65535)",
    }
}

type Param = Box<dyn ToSql + Sync + Send>;

fn bind(kind: ColumnKind, value: &Value) -> Param {
    match kind {
        ColumnKind::Boolean => Box::new(value.as_bool()),
        ColumnKind::Integer => Box::new(value.as_i64()),
        ColumnKind::Float => Box::new(value.as_f64()),
        ColumnKind::Text => Box::new(cell_text(value)),
        ColumnKind::Json => Box::new(cell_json(value)),
    }
}

fn check_ident(name: &str) -> Result<()> {
    if name.len() > MAX_IDENT_BYTES {
        return Err(CacheError::StorageError(format!(
            "Warehouse table name '{}' exceeds {} bytes",
            name, MAX_IDENT_BYTES
        )));
    }
    Ok(())
}

/// Drop, recreate and fill one table inside an open transaction
async fn replace_table(tx: &tokio_postgres::Transaction<'_>, name: &str, data: &Dataset) -> Result<()> {
    check_ident(name)?;
    let table = quote_ident(name);
    let kinds: Vec<ColumnKind> = (0..data.columns().len())
        .map(|idx| ColumnKind::infer(data.rows().iter().map(|row| &row[idx])))
        .collect();

    let column_defs: Vec<String> = data
        .columns()
        .iter()
        .zip(&kinds)
        .map(|(name, kind)| format!("{} {}", quote_ident(name), sql_type(*kind)))
        .collect();

    tx.batch_execute(&format!("DROP TABLE IF EXISTS {}", table))
        .await?;
    tx.batch_execute(&format!("CREATE TABLE {} ({})", table, column_defs.join(", ")))
        .await?;

    for (column, kind) in data.columns().iter().zip(&kinds) {
        if *kind == ColumnKind::Json {
            tx.batch_execute(&format!(
                "COMMENT ON COLUMN {}.{} IS '{}'",
                table,
                quote_ident(column),
                JSON_COLUMN_COMMENT
            ))
            .await?;
        }
    }

    let width = kinds.len();
    if width > 0 && !data.is_empty() {
        let column_list: Vec<String> = data.columns().iter().map(|c| quote_ident(c)).collect();
        let rows_per_statement = (MAX_PARAMS_PER_STATEMENT / width).max(1);

        for chunk in data.rows().chunks(rows_per_statement) {
            let mut params: Vec<Param> = Vec::with_capacity(chunk.len() * width);
            let mut tuples = Vec::with_capacity(chunk.len());

            for row in chunk {
                let placeholders: Vec<String> = (0..width)
                    .map(|i| format!("${}", params.len() + i + 1))
                    .collect();
                tuples.push(format!("({})", placeholders.join(", ")));
                for (kind, value) in kinds.iter().zip(row) {
                    params.push(bind(*kind, value));
                }
            }

            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                table,
                column_list.join(", "),
                tuples.join(", ")
            );
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(sql.as_str(), &refs).await?;
        }
    }

    debug!(table = %name, rows = data.len(), "Replaced warehouse table");
    Ok(())
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn overwrite_tables(&self, tables: &[(&str, &Dataset)]) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        for (name, data) in tables {
            replace_table(&tx, name, data).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn read_table(&self, name: &str) -> Result<Dataset> {
        check_ident(name)?;
        let client = self.pool.get().await?;
        let statement = client
            .prepare(&format!("SELECT * FROM {}", quote_ident(name)))
            .await?;

        let json_columns: HashSet<String> = client
            .query(
                "SELECT a.attname::text FROM pg_catalog.pg_attribute a \
                 JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
                 JOIN pg_catalog.pg_description d ON d.objoid = a.attrelid AND d.objsubid = a.attnum \
                 WHERE c.relname = $1 AND pg_catalog.pg_table_is_visible(c.oid) AND d.description = $2",
                &[&name, &JSON_COLUMN_COMMENT],
            )
            .await?
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<std::result::Result<_, _>>()?;

        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let types: Vec<Type> = statement
            .columns()
            .iter()
            .map(|c| c.type_().clone())
            .collect();
        let is_json: Vec<bool> = columns.iter().map(|c| json_columns.contains(c)).collect();

        let rows = client.query(&statement, &[]).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(types.len());
            for (idx, ty) in types.iter().enumerate() {
                let value = cell(&row, idx, ty)?;
                values.push(match value {
                    Value::String(text) if is_json[idx] => serde_json::from_str(&text)?,
                    other => other,
                });
            }
            out.push(values);
        }

        Ok(Dataset::from_rows(columns, out))
    }
}

fn cell(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .and_then(|f| Number::from_f64(f as f64))
            .map(Value::Number),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .and_then(Number::from_f64)
            .map(Value::Number),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        ref other => {
            return Err(CacheError::StorageError(format!(
                "Unsupported warehouse column type {} at position {}",
                other, idx
            )))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnar;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Keeps tables as record batches so column typing matches a real warehouse
    #[derive(Default)]
    struct BatchWarehouse {
        tables: Mutex<HashMap<String, arrow_array::RecordBatch>>,
        /// Table names of every overwrite call, in order
        calls: Mutex<Vec<Vec<String>>>,
        /// Tables whose replacement fails the whole call
        reject: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Warehouse for BatchWarehouse {
        async fn overwrite_tables(&self, tables: &[(&str, &Dataset)]) -> Result<()> {
            let names: Vec<String> = tables.iter().map(|(name, _)| name.to_string()).collect();
            self.calls.lock().await.push(names.clone());

            let reject = self.reject.lock().await;
            if let Some(name) = names.iter().find(|n| reject.contains(n)) {
                return Err(CacheError::StorageError(format!("permission denied for {}", name)));
            }

            let mut batches = Vec::with_capacity(tables.len());
            for (name, data) in tables {
                batches.push((name.to_string(), columnar::to_record_batch(data)?));
            }
            self.tables.lock().await.extend(batches);
            Ok(())
        }

        async fn read_table(&self, name: &str) -> Result<Dataset> {
            let tables = self.tables.lock().await;
            let batch = tables
                .get(name)
                .ok_or_else(|| CacheError::StorageError(format!("relation {} does not exist", name)))?;
            columnar::from_record_batches(std::slice::from_ref(batch))
        }
    }

    fn store() -> (Arc<BatchWarehouse>, WarehouseStore) {
        let warehouse = Arc::new(BatchWarehouse::default());
        (warehouse.clone(), WarehouseStore::new(warehouse, TableNaming::default()))
    }

    fn single(column: &str, value: Value) -> Dataset {
        Dataset::from_rows(vec![column.to_string()], vec![vec![value]])
    }

    #[tokio::test]
    async fn test_round_trip_through_prefixed_table() {
        let (warehouse, store) = store();
        let data = Dataset::from_rows(
            vec!["subject_id".to_string(), "n".to_string()],
            vec![vec![json!("614173"), json!(2)]],
        );

        store.write("unique_subject_ids", &data, true).await.unwrap();
        assert_eq!(store.read("unique_subject_ids").await, data);

        let tables = warehouse.tables.lock().await;
        assert!(tables.contains_key("zs_unique__subject__ids"));
        assert!(tables.contains_key("zs_unique__subject__ids_columns"));
    }

    #[tokio::test]
    async fn test_table_and_sidecar_written_in_one_call() {
        let (warehouse, store) = store();
        store.write("source_data", &single("a", json!(1)), true).await.unwrap();
        store.write("qc/1", &single("a", json!(1)), false).await.unwrap();

        let calls = warehouse.calls.lock().await.clone();
        assert_eq!(
            calls,
            vec![
                vec!["zs_source__data".to_string(), "zs_source__data_columns".to_string()],
                vec!["zs_qc_s_1".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_sidecar_keeps_previous_snapshot() {
        let (warehouse, store) = store();
        let old = single("old_column", json!("kept"));
        store.write("source_data", &old, true).await.unwrap();

        warehouse
            .reject
            .lock()
            .await
            .push(TableNaming::default().sidecar_ident("source_data"));
        let result = store.write("source_data", &single("new_column", json!("lost")), true).await;

        assert!(matches!(result, Err(CacheError::StorageError(_))));
        assert_eq!(store.read("source_data").await, old);
        assert_eq!(store.columns("source_data").await.unwrap(), vec!["old_column"]);
    }

    #[tokio::test]
    async fn test_similar_keys_get_separate_tables() {
        let (_, store) = store();
        store.write("qc/a", &single("v", json!("family-member")), true).await.unwrap();
        store.write("qc_a", &single("v", json!("plain-key")), true).await.unwrap();
        store.write("qc/Mouse", &single("v", json!("upper")), false).await.unwrap();
        store.write("qc/mouse", &single("v", json!("lower")), false).await.unwrap();

        assert_eq!(store.read("qc/a").await.value(0, "v"), Some(&json!("family-member")));
        assert_eq!(store.read("qc_a").await.value(0, "v"), Some(&json!("plain-key")));
        assert_eq!(store.read("qc/Mouse").await.value(0, "v"), Some(&json!("upper")));
        assert_eq!(store.read("qc/mouse").await.value(0, "v"), Some(&json!("lower")));
    }

    #[tokio::test]
    async fn test_key_named_like_a_sidecar_does_not_clobber_it() {
        let (_, store) = store();
        store.write("asset_basics", &single("_id", json!("a1")), true).await.unwrap();
        store
            .write("asset_basics_columns", &single(SIDECAR_COLUMN, json!("bogus")), true)
            .await
            .unwrap();

        assert_eq!(store.columns("asset_basics").await.unwrap(), vec!["_id"]);
    }

    #[tokio::test]
    async fn test_missing_table_reads_empty() {
        let (_, store) = store();
        assert!(store.read("nothing").await.is_empty());
    }

    #[tokio::test]
    async fn test_columns_and_grouped_sidecar() {
        let (_, store) = store();
        let data = Dataset::from_rows(
            vec!["name".to_string(), "value".to_string()],
            vec![vec![json!("m"), json!("1")]],
        );

        assert!(store.columns("qc/1").await.is_err());
        store.write("qc/1", &data, true).await.unwrap();
        assert_eq!(store.columns("qc/2").await.unwrap(), vec!["name", "value"]);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("zs_qc"), "\"zs_qc\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_long_identifiers_are_rejected() {
        assert!(check_ident(&"x".repeat(MAX_IDENT_BYTES)).is_ok());
        assert!(check_ident(&"x".repeat(MAX_IDENT_BYTES + 1)).is_err());
    }
}
