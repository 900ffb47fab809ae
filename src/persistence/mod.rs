//! Configurable persistence engine.
//!
//! Tables are described by [`TableConfig`]; the engine converts canonical
//! records into rows via per-field source chains, batches writes, and
//! dispatches UPSERT/INSERT statements with PostgreSQL-compatible
//! `ON CONFLICT` clauses. Transient database errors are retried with
//! exponential backoff; constraint violations skip the row.

mod tables;

pub use tables::builtin_table_configs;

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::config::resolve_env_ref;
use crate::core::convert;
use crate::core::errors::DatacenterError;
use crate::models::{Record, ToRecord};

/// How rows are written to a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    Insert,
    #[default]
    Upsert,
    Append,
    Replace,
}

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[default]
    String,
    Integer,
    Float,
    Date,
    Datetime,
    Boolean,
    Json,
}

impl ColumnType {
    fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::String | ColumnType::Date | ColumnType::Datetime | ColumnType::Json => {
                "TEXT"
            }
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Float => "REAL",
        }
    }
}

/// One column: where its value comes from and how it is coerced.
#[derive(Debug, Clone)]
pub struct FieldConfig {
    pub name: String,
    pub source_fields: Vec<String>,
    pub column_type: ColumnType,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldConfig {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            source_fields: Vec::new(),
            column_type,
            required: false,
            default: None,
        }
    }

    pub fn sources(mut self, sources: &[&str]) -> Self {
        self.source_fields = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Pull this column's value out of a record: try each source field in
    /// order, fall back to the canonical name, then the default, then coerce.
    pub fn get_value(&self, record: &Record) -> Value {
        let mut value = None;
        for source in &self.source_fields {
            if let Some(v) = record.get(source) {
                value = Some(v.clone());
                break;
            }
        }
        let value = value
            .or_else(|| record.get(&self.name).cloned())
            .unwrap_or(Value::Null);

        let value = if value.is_null() {
            self.default.clone().unwrap_or(Value::Null)
        } else {
            value
        };

        self.coerce(value)
    }

    fn coerce(&self, value: Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self.column_type {
            ColumnType::String => convert::to_str(&value, None)
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnType::Integer => convert::to_int(&value, None)
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnType::Float => convert::to_float(&value, None)
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnType::Date => convert::to_date(&value, None)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            ColumnType::Datetime => convert::to_datetime(&value, None)
                .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()))
                .unwrap_or(Value::Null),
            ColumnType::Boolean => convert::to_bool(&value, None)
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            ColumnType::Json => value,
        }
    }
}

/// Full declaration of one target table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub table_name: String,
    pub schema_name: String,
    pub primary_key: Vec<String>,
    pub unique_keys: Vec<Vec<String>>,
    pub fields: Vec<FieldConfig>,
    pub save_mode: SaveMode,
    pub batch_size: Option<usize>,
    pub create_if_not_exists: bool,
    pub pre_save_hook: Option<String>,
    pub post_save_hook: Option<String>,
}

impl TableConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            schema_name: "main".to_string(),
            primary_key: vec!["id".to_string()],
            unique_keys: Vec::new(),
            fields: Vec::new(),
            save_mode: SaveMode::Upsert,
            batch_size: None,
            create_if_not_exists: true,
            pre_save_hook: None,
            post_save_hook: None,
        }
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self.unique_keys = vec![self.primary_key.clone()];
        self
    }

    pub fn field(mut self, field: FieldConfig) -> Self {
        self.fields.push(field);
        self
    }

    pub fn save_mode(mut self, mode: SaveMode) -> Self {
        self.save_mode = mode;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn full_table_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Conflict target: first unique key, else the primary key.
    pub fn conflict_columns(&self) -> &[String] {
        self.unique_keys
            .first()
            .map(|k| k.as_slice())
            .unwrap_or(&self.primary_key)
    }

    fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    fn insert_sql(&self) -> String {
        let columns = self.column_names();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.full_table_name(),
            columns.join(", "),
            placeholders.join(", ")
        )
    }

    fn upsert_sql(&self) -> String {
        let base = self.insert_sql();
        let conflict = self.conflict_columns().join(", ");

        let updates: Vec<String> = self
            .column_names()
            .iter()
            .filter(|c| !self.primary_key.iter().any(|pk| pk == *c))
            .map(|c| {
                format!(
                    "{c} = COALESCE(excluded.{c}, {table}.{c})",
                    table = self.table_name
                )
            })
            .collect();

        if updates.is_empty() {
            format!("{base} ON CONFLICT ({conflict}) DO NOTHING")
        } else {
            format!(
                "{base} ON CONFLICT ({conflict}) DO UPDATE SET {}",
                updates.join(", ")
            )
        }
    }

    fn ddl(&self) -> String {
        let mut columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                let mut col = format!("{} {}", f.name, f.column_type.sql_type());
                if f.required {
                    col.push_str(" NOT NULL");
                }
                col
            })
            .collect();

        if !self.primary_key.is_empty() {
            columns.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        for unique in self.unique_keys.iter().filter(|u| **u != self.primary_key) {
            columns.push(format!("UNIQUE ({})", unique.join(", ")));
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.full_table_name(),
            columns.join(", ")
        )
    }
}

// -- YAML shapes ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawFieldSpec {
    #[serde(rename = "type", default)]
    column_type: ColumnType,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    source_fields: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTableSpec {
    #[serde(default)]
    schema_name: Option<String>,
    #[serde(default)]
    primary_key: Vec<String>,
    #[serde(default)]
    unique_keys: Vec<Vec<String>>,
    #[serde(default)]
    fields: std::collections::BTreeMap<String, RawFieldSpec>,
    #[serde(default)]
    save_mode: SaveMode,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default = "default_create")]
    create_if_not_exists: bool,
    #[serde(default)]
    pre_save_hook: Option<String>,
    #[serde(default)]
    post_save_hook: Option<String>,
}

fn default_create() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawPersistenceSpec {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    pool_size: Option<u32>,
    #[serde(default)]
    default_batch_size: Option<usize>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_delay: Option<f64>,
    #[serde(default)]
    tables: std::collections::BTreeMap<String, RawTableSpec>,
}

/// Engine-level persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub database_url: String,
    pub pool_size: u32,
    pub default_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub tables: HashMap<String, TableConfig>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://findata.db".to_string(),
            pool_size: 10,
            default_batch_size: 500,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            tables: HashMap::new(),
        }
    }
}

impl PersistenceConfig {
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite://:memory:".to_string(),
            ..Default::default()
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, DatacenterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DatacenterError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, DatacenterError> {
        let spec: RawPersistenceSpec = serde_yaml::from_str(raw).map_err(|e| {
            DatacenterError::configuration(format!("malformed persistence config: {e}"))
        })?;

        let mut config = Self::default();
        if let Some(url) = spec.database_url {
            config.database_url = url;
        }
        if let Some(pool) = spec.pool_size {
            config.pool_size = pool;
        }
        if let Some(batch) = spec.default_batch_size {
            config.default_batch_size = batch;
        }
        if let Some(retries) = spec.max_retries {
            config.max_retries = retries;
        }
        if let Some(delay) = spec.retry_delay {
            config.retry_delay = Duration::from_secs_f64(delay);
        }

        for (table_name, table_spec) in spec.tables {
            let mut table = TableConfig::new(&table_name);
            if let Some(schema) = table_spec.schema_name {
                table.schema_name = schema;
            }
            if !table_spec.primary_key.is_empty() {
                table.primary_key = table_spec.primary_key;
            }
            table.unique_keys = if table_spec.unique_keys.is_empty() {
                vec![table.primary_key.clone()]
            } else {
                table_spec.unique_keys
            };
            for (field_name, field_spec) in table_spec.fields {
                let mut field = FieldConfig::new(&field_name, field_spec.column_type);
                field.required = field_spec.required;
                field.default = field_spec.default;
                field.source_fields = field_spec.source_fields;
                table.fields.push(field);
            }
            table.save_mode = table_spec.save_mode;
            table.batch_size = table_spec.batch_size;
            table.create_if_not_exists = table_spec.create_if_not_exists;
            table.pre_save_hook = table_spec.pre_save_hook;
            table.post_save_hook = table_spec.post_save_hook;
            config.tables.insert(table_name, table);
        }

        Ok(config)
    }
}

pub type PreSaveHook = Arc<dyn Fn(&mut Record) + Send + Sync>;
pub type PostSaveHook = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Table-config-driven persistence over the relational store.
pub struct ConfigurablePersistence {
    config: PersistenceConfig,
    tables: RwLock<HashMap<String, Arc<TableConfig>>>,
    conn: Arc<Mutex<Connection>>,
    pre_save_hooks: RwLock<HashMap<String, PreSaveHook>>,
    post_save_hooks: RwLock<HashMap<String, PostSaveHook>>,
}

impl ConfigurablePersistence {
    pub fn new(config: PersistenceConfig) -> Result<Self, DatacenterError> {
        let conn = open_connection(&config.database_url)?;

        let engine = Self {
            tables: RwLock::new(HashMap::new()),
            conn: Arc::new(Mutex::new(conn)),
            pre_save_hooks: RwLock::new(HashMap::new()),
            post_save_hooks: RwLock::new(HashMap::new()),
            config,
        };

        for table in builtin_table_configs() {
            // Config-file tables win over builtins.
            if !engine.config.tables.contains_key(&table.table_name) {
                engine.register_table(table)?;
            }
        }
        let configured: Vec<TableConfig> = engine.config.tables.values().cloned().collect();
        for table in configured {
            engine.register_table(table)?;
        }

        info!(
            url = %engine.config.database_url,
            tables = engine.tables.read().len(),
            "persistence engine initialized"
        );
        Ok(engine)
    }

    pub fn in_memory() -> Result<Self, DatacenterError> {
        Self::new(PersistenceConfig::in_memory())
    }

    /// Register (or replace) a table configuration, creating the table when
    /// asked to.
    pub fn register_table(&self, table: TableConfig) -> Result<(), DatacenterError> {
        if table.create_if_not_exists {
            let ddl = table.ddl();
            self.conn.lock().execute_batch(&ddl).map_err(|e| {
                DatacenterError::storage_table(
                    format!("DDL failed: {e}"),
                    table.table_name.clone(),
                    "create",
                )
            })?;
        }
        self.tables
            .write()
            .insert(table.table_name.clone(), Arc::new(table));
        Ok(())
    }

    pub fn table_config(&self, table_name: &str) -> Option<Arc<TableConfig>> {
        self.tables.read().get(table_name).cloned()
    }

    pub fn register_pre_save_hook(
        &self,
        name: impl Into<String>,
        hook: impl Fn(&mut Record) + Send + Sync + 'static,
    ) {
        self.pre_save_hooks
            .write()
            .insert(name.into(), Arc::new(hook));
    }

    pub fn register_post_save_hook(
        &self,
        name: impl Into<String>,
        hook: impl Fn(&str, usize) + Send + Sync + 'static,
    ) {
        self.post_save_hooks
            .write()
            .insert(name.into(), Arc::new(hook));
    }

    /// Save records to a configured table. Returns the number of rows
    /// written. Transient database errors (busy/locked) retry with
    /// exponential backoff; constraint violations are skipped per row and
    /// never retried.
    pub async fn save<T: ToRecord>(
        &self,
        table_name: &str,
        items: &[T],
    ) -> Result<usize, DatacenterError> {
        if items.is_empty() {
            return Ok(0);
        }

        let table = self.table_config(table_name).ok_or_else(|| {
            DatacenterError::configuration_key(
                format!("no table configuration for '{table_name}'"),
                table_name.to_string(),
            )
        })?;

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match item.to_record() {
                Ok(record) => records.push(record),
                Err(e) => warn!(table = table_name, "skipping unconvertible record: {e}"),
            }
        }

        let pre_hook = table
            .pre_save_hook
            .as_ref()
            .and_then(|name| self.pre_save_hooks.read().get(name).cloned());
        if let Some(hook) = &pre_hook {
            for record in &mut records {
                hook(record);
            }
        }

        let mut last_error: Option<DatacenterError> = None;
        let mut saved = 0;
        for attempt in 0..self.config.max_retries.max(1) {
            match self.save_records(&table, &records) {
                Ok(count) => {
                    saved = count;
                    last_error = None;
                    break;
                }
                Err(e) if e.transient => {
                    last_error = Some(e.error);
                    if attempt + 1 < self.config.max_retries.max(1) {
                        let delay = Duration::from_secs_f64(
                            self.config.retry_delay.as_secs_f64() * 2f64.powi(attempt as i32),
                        );
                        warn!(
                            table = table_name,
                            attempt = attempt + 1,
                            "transient database error, retrying in {:.1}s",
                            delay.as_secs_f64()
                        );
                        sleep(delay).await;
                    }
                }
                Err(e) => return Err(e.error),
            }
        }
        if let Some(error) = last_error {
            return Err(error);
        }

        if let Some(name) = &table.post_save_hook {
            if let Some(hook) = self.post_save_hooks.read().get(name).cloned() {
                hook(table_name, saved);
            }
        }

        info!(
            table = table_name,
            saved,
            total = records.len(),
            "records saved"
        );
        Ok(saved)
    }

    /// One save attempt over all batches. Each batch runs in its own
    /// transaction: commit at the batch boundary, roll back the batch on a
    /// batch-level error.
    fn save_records(&self, table: &TableConfig, records: &[Record]) -> Result<usize, SaveError> {
        let batch_size = table
            .batch_size
            .unwrap_or(self.config.default_batch_size)
            .max(1);

        let sql = match table.save_mode {
            SaveMode::Upsert => table.upsert_sql(),
            SaveMode::Insert | SaveMode::Append | SaveMode::Replace => table.insert_sql(),
        };

        let mut conn = self.conn.lock();
        let mut saved = 0;

        for batch in records.chunks(batch_size) {
            let tx = conn.transaction().map_err(SaveError::from_rusqlite)?;
            {
                let mut stmt = tx.prepare_cached(&sql).map_err(SaveError::from_rusqlite)?;
                for record in batch {
                    let row = process_record(table, record);
                    match stmt.execute(params_from_iter(row.iter())) {
                        Ok(_) => saved += 1,
                        Err(e) if is_constraint_violation(&e) => {
                            debug!(table = %table.table_name, "skipping conflicting row: {e}");
                        }
                        Err(e) if is_transient(&e) => {
                            drop(stmt);
                            tx.rollback().ok();
                            return Err(SaveError::transient(e, &table.table_name));
                        }
                        Err(e) => {
                            warn!(table = %table.table_name, "failed to save row: {e}");
                        }
                    }
                }
            }
            tx.commit().map_err(SaveError::from_rusqlite)?;
        }

        Ok(saved)
    }

    /// Per-table row counts.
    pub fn stats(&self) -> Value {
        let tables = self.tables.read();
        let conn = self.conn.lock();
        let counts: HashMap<String, i64> = tables
            .values()
            .map(|table| {
                let count = conn
                    .query_row(
                        &format!("SELECT COUNT(*) FROM {}", table.full_table_name()),
                        [],
                        |row| row.get(0),
                    )
                    .unwrap_or(0);
                (table.table_name.clone(), count)
            })
            .collect();
        json!(counts)
    }

    /// Distinct quote dates with at least `min_symbols` reporting codes.
    pub fn quote_trading_days(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        min_symbols: u32,
    ) -> Result<Vec<NaiveDate>, DatacenterError> {
        let mut sql = String::from(
            "SELECT trade_date FROM main.stock_daily_quote WHERE trade_date IS NOT NULL",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(start) = start {
            sql.push_str(&format!(" AND trade_date >= ?{}", args.len() + 1));
            args.push(start.format("%Y-%m-%d").to_string());
        }
        if let Some(end) = end {
            sql.push_str(&format!(" AND trade_date <= ?{}", args.len() + 1));
            args.push(end.format("%Y-%m-%d").to_string());
        }
        sql.push_str(&format!(
            " GROUP BY trade_date HAVING COUNT(DISTINCT code) >= ?{} ORDER BY trade_date",
            args.len() + 1
        ));
        args.push(min_symbols.to_string());

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| DatacenterError::storage(format!("trading day query failed: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                row.get::<_, String>(0)
            })
            .map_err(|e| DatacenterError::storage(format!("trading day query failed: {e}")))?;

        let mut days = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| DatacenterError::storage(e.to_string()))?;
            if let Ok(date) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
                days.push(date);
            }
        }
        Ok(days)
    }

    /// Run a read-only query returning JSON rows; used by health surfaces
    /// and tests.
    pub fn query_rows(&self, sql: &str) -> Result<Vec<Record>, DatacenterError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DatacenterError::storage(format!("query failed: {e}")))?;
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let rows = stmt
            .query_map([], |row| {
                let mut record = Record::new();
                for (i, name) in column_names.iter().enumerate() {
                    let value = match row.get_ref(i)? {
                        rusqlite::types::ValueRef::Null => Value::Null,
                        rusqlite::types::ValueRef::Integer(v) => Value::from(v),
                        rusqlite::types::ValueRef::Real(v) => {
                            serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
                        }
                        rusqlite::types::ValueRef::Text(v) => {
                            Value::String(String::from_utf8_lossy(v).to_string())
                        }
                        rusqlite::types::ValueRef::Blob(v) => {
                            Value::String(hex::encode(v))
                        }
                    };
                    record.insert(name.clone(), value);
                }
                Ok(record)
            })
            .map_err(|e| DatacenterError::storage(format!("query failed: {e}")))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatacenterError::storage(e.to_string()))
    }
}

fn process_record(table: &TableConfig, record: &Record) -> Vec<rusqlite::types::Value> {
    table
        .fields
        .iter()
        .map(|field| to_sql_value(field.get_value(record)))
        .collect()
}

fn to_sql_value(value: Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

struct SaveError {
    error: DatacenterError,
    transient: bool,
}

impl SaveError {
    fn from_rusqlite(e: rusqlite::Error) -> Self {
        Self {
            transient: is_transient(&e),
            error: DatacenterError::storage(e.to_string()),
        }
    }

    fn transient(e: rusqlite::Error, table: &str) -> Self {
        Self {
            error: DatacenterError::storage_table(e.to_string(), table, "save"),
            transient: true,
        }
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
    )
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::DatabaseBusy || inner.code == ErrorCode::DatabaseLocked
    )
}

fn open_connection(database_url: &str) -> Result<Connection, DatacenterError> {
    let resolved = resolve_env_ref(database_url).unwrap_or_else(|| database_url.to_string());
    let path = resolved
        .strip_prefix("sqlite:///")
        .or_else(|| resolved.strip_prefix("sqlite://"))
        .unwrap_or(&resolved);

    let conn = if path == ":memory:" {
        Connection::open_in_memory()
    } else {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Connection::open_with_flags(path, flags)
    }
    .map_err(|e| DatacenterError::configuration(format!("cannot open database {path}: {e}")))?;

    if path != ":memory:" {
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {journal_mode}");
        }
    }
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| DatacenterError::configuration(format!("failed to apply pragmas: {e}")))?;

    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote(code: &str, date: &str, close: Option<f64>, volume: Option<i64>) -> Record {
        let mut record = Record::new();
        record.insert("code".to_string(), json!(code));
        record.insert("trade_date".to_string(), json!(date));
        record.insert(
            "close".to_string(),
            close.map(|c| json!(c)).unwrap_or(Value::Null),
        );
        record.insert(
            "volume".to_string(),
            volume.map(|v| json!(v)).unwrap_or(Value::Null),
        );
        record
    }

    #[tokio::test]
    async fn upsert_converges_to_the_union_of_partial_rows() {
        let engine = ConfigurablePersistence::in_memory().unwrap();

        // Save A with close only, then B with volume only.
        engine
            .save(
                "stock_daily_quote",
                &[quote("600000", "2024-06-03", Some(10.0), None)],
            )
            .await
            .unwrap();
        engine
            .save(
                "stock_daily_quote",
                &[quote("600000", "2024-06-03", None, Some(1000))],
            )
            .await
            .unwrap();

        let rows = engine
            .query_rows(
                "SELECT close, volume FROM main.stock_daily_quote \
                 WHERE code = '600000' AND trade_date = '2024-06-03'",
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("close").unwrap().as_f64(), Some(10.0));
        assert_eq!(rows[0].get("volume").unwrap().as_f64(), Some(1000.0));
    }

    #[tokio::test]
    async fn upsert_later_non_null_wins() {
        let engine = ConfigurablePersistence::in_memory().unwrap();
        engine
            .save(
                "stock_daily_quote",
                &[quote("600000", "2024-06-03", Some(10.0), Some(500))],
            )
            .await
            .unwrap();
        engine
            .save(
                "stock_daily_quote",
                &[quote("600000", "2024-06-03", Some(11.5), None)],
            )
            .await
            .unwrap();

        let rows = engine
            .query_rows("SELECT close, volume FROM main.stock_daily_quote")
            .unwrap();
        assert_eq!(rows[0].get("close").unwrap().as_f64(), Some(11.5));
        assert_eq!(rows[0].get("volume").unwrap().as_f64(), Some(500.0));
    }

    #[tokio::test]
    async fn insert_mode_skips_conflicting_rows() {
        let engine = ConfigurablePersistence::in_memory().unwrap();
        let table = TableConfig::new("append_log")
            .primary_key(&["id"])
            .save_mode(SaveMode::Insert)
            .field(FieldConfig::new("id", ColumnType::String).required())
            .field(FieldConfig::new("payload", ColumnType::String));
        engine.register_table(table).unwrap();

        let mut a = Record::new();
        a.insert("id".to_string(), json!("x"));
        a.insert("payload".to_string(), json!("first"));
        let mut b = a.clone();
        b.insert("payload".to_string(), json!("second"));

        let saved = engine.save("append_log", &[a, b]).await.unwrap();
        assert_eq!(saved, 1);

        let rows = engine.query_rows("SELECT payload FROM main.append_log").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("payload").unwrap(), "first");
    }

    #[tokio::test]
    async fn missing_table_config_is_a_configuration_error() {
        let engine = ConfigurablePersistence::in_memory().unwrap();
        let record = Record::new();
        let err = engine.save("nonexistent", &[record]).await.unwrap_err();
        assert!(matches!(err, DatacenterError::Configuration { .. }));
    }

    #[tokio::test]
    async fn source_field_fallback_chain() {
        let engine = ConfigurablePersistence::in_memory().unwrap();

        // stock_daily_quote maps `symbol` onto `code` and `date` onto
        // `trade_date` via source chains.
        let mut record = Record::new();
        record.insert("symbol".to_string(), json!("000001"));
        record.insert("date".to_string(), json!("2024-06-03"));
        record.insert("close".to_string(), json!("12.34"));

        engine.save("stock_daily_quote", &[record]).await.unwrap();
        let rows = engine
            .query_rows("SELECT code, close FROM main.stock_daily_quote")
            .unwrap();
        assert_eq!(rows[0].get("code").unwrap(), "000001");
        assert_eq!(rows[0].get("close").unwrap().as_f64(), Some(12.34));
    }

    #[tokio::test]
    async fn typed_coercion_at_the_storage_boundary() {
        let engine = ConfigurablePersistence::in_memory().unwrap();
        let mut record = Record::new();
        record.insert("code".to_string(), json!("600000"));
        record.insert("trade_date".to_string(), json!("20240603"));
        record.insert("volume".to_string(), json!("1,000"));

        engine.save("stock_daily_quote", &[record]).await.unwrap();
        let rows = engine
            .query_rows("SELECT trade_date, volume FROM main.stock_daily_quote")
            .unwrap();
        assert_eq!(rows[0].get("trade_date").unwrap(), "2024-06-03");
        assert_eq!(rows[0].get("volume").unwrap().as_f64(), Some(1000.0));
    }

    #[tokio::test]
    async fn pre_save_hook_mutates_records() {
        let engine = ConfigurablePersistence::in_memory().unwrap();
        let mut table = TableConfig::new("hooked")
            .primary_key(&["id"])
            .field(FieldConfig::new("id", ColumnType::String))
            .field(FieldConfig::new("tag", ColumnType::String));
        table.pre_save_hook = Some("stamp".to_string());
        engine.register_table(table).unwrap();
        engine.register_pre_save_hook("stamp", |record: &mut Record| {
            record.insert("tag".to_string(), json!("stamped"));
        });

        let mut record = Record::new();
        record.insert("id".to_string(), json!("1"));
        engine.save("hooked", &[record]).await.unwrap();

        let rows = engine.query_rows("SELECT tag FROM main.hooked").unwrap();
        assert_eq!(rows[0].get("tag").unwrap(), "stamped");
    }

    #[test]
    fn upsert_sql_uses_coalesce_per_non_pk_column() {
        let table = TableConfig::new("t")
            .primary_key(&["code", "trade_date"])
            .field(FieldConfig::new("code", ColumnType::String))
            .field(FieldConfig::new("trade_date", ColumnType::Date))
            .field(FieldConfig::new("close", ColumnType::Float));

        let sql = table.upsert_sql();
        assert!(sql.contains("ON CONFLICT (code, trade_date)"));
        assert!(sql.contains("close = COALESCE(excluded.close, t.close)"));
        assert!(!sql.contains("code = COALESCE"));
    }

    #[test]
    fn upsert_with_only_key_columns_does_nothing_on_conflict() {
        let table = TableConfig::new("keys_only")
            .primary_key(&["a", "b"])
            .field(FieldConfig::new("a", ColumnType::String))
            .field(FieldConfig::new("b", ColumnType::String));
        assert!(table.upsert_sql().ends_with("DO NOTHING"));
    }

    #[test]
    fn conflict_columns_prefer_unique_keys() {
        let mut table = TableConfig::new("t").primary_key(&["id"]);
        table.unique_keys = vec![vec!["code".to_string(), "trade_date".to_string()]];
        assert_eq!(table.conflict_columns(), ["code", "trade_date"]);

        table.unique_keys.clear();
        assert_eq!(table.conflict_columns(), ["id"]);
    }

    #[test]
    fn yaml_table_config_parses() {
        let yaml = r#"
database_url: "sqlite://:memory:"
default_batch_size: 200
tables:
  custom_quote:
    primary_key: [code, trade_date]
    save_mode: upsert
    batch_size: 50
    fields:
      code: {type: string, required: true, source_fields: [code, symbol]}
      trade_date: {type: date, required: true}
      close: {type: float}
"#;
        let config = PersistenceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.default_batch_size, 200);
        let table = config.tables.get("custom_quote").unwrap();
        assert_eq!(table.primary_key, ["code", "trade_date"]);
        assert_eq!(table.batch_size, Some(50));
        assert_eq!(table.fields.len(), 3);
        assert_eq!(table.save_mode, SaveMode::Upsert);
    }

    #[tokio::test]
    async fn quote_trading_days_requires_symbol_coverage() {
        let engine = ConfigurablePersistence::in_memory().unwrap();
        let mut records = Vec::new();
        for code in ["600000", "000001", "600519"] {
            records.push(quote(code, "2024-06-03", Some(1.0), None));
        }
        records.push(quote("600000", "2024-06-04", Some(1.0), None));
        engine.save("stock_daily_quote", &records).await.unwrap();

        let days = engine.quote_trading_days(None, None, 2).unwrap();
        assert_eq!(days, vec![NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()]);
    }
}
