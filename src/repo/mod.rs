//! Keyed-table storage consumed by the simulation core.
//!
//! The core never writes SQL. It hands column/value data and simple
//! conditions to a [`Storage`] backend, one per logical schema
//! (`climate` and `grid`), bundled together in [`Repositories`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StorageBackend, StorageConfig};

pub mod memory;
#[cfg(feature = "db")]
pub mod pg;

pub use memory::MemoryStorage;

/// Table names of the `climate` and `grid` schemas.
pub mod tables {
    pub const WIND: &str = "wind";
    pub const WIND_DATA: &str = "wind_data";
    pub const HOUSE: &str = "house";
    pub const POWER_PLANT: &str = "power_plant";
    pub const WIND_TURBINE: &str = "wind_turbine";
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection is closed")]
    Closed,
    #[error("query failed on {table}: {message}")]
    Query { table: String, message: String },
    #[error("missing column `{0}`")]
    MissingColumn(String),
    #[error("column `{column}` is not a {expected}")]
    ColumnType {
        column: String,
        expected: &'static str,
    },
    #[cfg(feature = "db")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Ordering used for range conditions. Numbers compare across int/float,
    /// everything else only against its own kind.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A table row as column name -> value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.0.insert(column.to_string(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the given columns. An empty list keeps everything.
    pub fn project(&self, columns: &[String]) -> Row {
        if columns.is_empty() {
            return self.clone();
        }
        Row(self
            .0
            .iter()
            .filter(|(k, _)| columns.iter().any(|c| c == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn value(&self, column: &str) -> Result<&Value, StorageError> {
        self.0
            .get(column)
            .ok_or_else(|| StorageError::MissingColumn(column.to_string()))
    }

    fn type_error(column: &str, expected: &'static str) -> StorageError {
        StorageError::ColumnType {
            column: column.to_string(),
            expected,
        }
    }

    pub fn f64(&self, column: &str) -> Result<f64, StorageError> {
        match self.value(column)? {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            _ => Err(Self::type_error(column, "number")),
        }
    }

    pub fn opt_f64(&self, column: &str) -> Result<Option<f64>, StorageError> {
        match self.0.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.f64(column).map(Some),
        }
    }

    pub fn i64(&self, column: &str) -> Result<i64, StorageError> {
        match self.value(column)? {
            Value::Int(v) => Ok(*v),
            _ => Err(Self::type_error(column, "integer")),
        }
    }

    pub fn opt_i64(&self, column: &str) -> Result<Option<i64>, StorageError> {
        match self.0.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.i64(column).map(Some),
        }
    }

    pub fn bool(&self, column: &str) -> Result<bool, StorageError> {
        match self.value(column)? {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            _ => Err(Self::type_error(column, "boolean")),
        }
    }

    pub fn text(&self, column: &str) -> Result<String, StorageError> {
        match self.value(column)? {
            Value::Text(v) => Ok(v.clone()),
            _ => Err(Self::type_error(column, "text")),
        }
    }

    pub fn time(&self, column: &str) -> Result<DateTime<Utc>, StorageError> {
        match self.value(column)? {
            Value::Time(v) => Ok(*v),
            _ => Err(Self::type_error(column, "timestamp")),
        }
    }

    pub fn json(&self, column: &str) -> Result<Option<serde_json::Value>, StorageError> {
        match self.0.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Json(v)) => Ok(Some(v.clone())),
            Some(Value::Text(s)) => serde_json::from_str(s)
                .map(Some)
                .map_err(|_| Self::type_error(column, "json document")),
            Some(_) => Err(Self::type_error(column, "json document")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    pub fn new(column: &str, op: Op, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Eq, value)
    }

    pub fn lt(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Lt, value)
    }

    pub fn le(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Le, value)
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Gt, value)
    }

    pub fn ge(column: &str, value: impl Into<Value>) -> Self {
        Self::new(column, Op::Ge, value)
    }

    /// A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(value) = row.get(&self.column) else {
            return false;
        };
        let Some(ord) = value.compare(&self.value) else {
            return false;
        };
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Column list plus AND-ed conditions, with optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    pub columns: Vec<String>,
    pub conditions: Vec<Condition>,
    pub order_by: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Select {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order_by = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Generic keyed-table storage for one logical schema.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a row, returning its generated `id`.
    async fn insert(&self, table: &str, row: Row) -> Result<i64, StorageError>;

    /// Insert, or update the existing row matching `conflict_keys`.
    async fn insert_or_update(
        &self,
        table: &str,
        row: Row,
        conflict_keys: &[&str],
    ) -> Result<(), StorageError>;

    async fn select(&self, table: &str, query: &Select) -> Result<Vec<Row>, StorageError>;

    /// Remove matching rows, returning how many were removed.
    async fn remove(&self, table: &str, conditions: &[Condition]) -> Result<u64, StorageError>;

    /// Release the underlying connection. Later calls fail with [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}

/// Storage handles for both schemas, built once and passed to every
/// constructor and update.
#[derive(Clone)]
pub struct Repositories {
    pub climate: Arc<dyn Storage>,
    pub grid: Arc<dyn Storage>,
}

impl Repositories {
    pub fn new(climate: Arc<dyn Storage>, grid: Arc<dyn Storage>) -> Self {
        Self { climate, grid }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new("climate")),
            Arc::new(MemoryStorage::new("grid")),
        )
    }

    pub async fn connect(cfg: &StorageConfig) -> Result<Self> {
        match cfg.backend {
            StorageBackend::Memory => {
                info!("using in-memory storage");
                Ok(Self::in_memory())
            }
            #[cfg(feature = "db")]
            StorageBackend::Postgres => {
                let climate = pg::PgStorage::connect(&cfg.climate_url, "climate", cfg.max_connections).await?;
                let grid = pg::PgStorage::connect(&cfg.grid_url, "grid", cfg.max_connections).await?;
                info!("connected to postgres storage");
                Ok(Self::new(Arc::new(climate), Arc::new(grid)))
            }
            #[cfg(not(feature = "db"))]
            StorageBackend::Postgres => {
                anyhow::bail!("postgres storage requires the `db` feature")
            }
        }
    }

    /// Close both schemas. Failures are logged; there is nothing left to retry.
    pub async fn close(&self) {
        if let Err(e) = self.climate.close().await {
            warn!(error = %e, schema = "climate", "failed to close storage");
        }
        if let Err(e) = self.grid.close().await {
            warn!(error = %e, schema = "grid", "failed to close storage");
        }
    }
}
