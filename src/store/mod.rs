//! Namespaced table-store abstraction
//!
//! The import pipeline never speaks SQL. Everything it needs from the
//! relational engine is expressed through the [`TableStore`] trait:
//! namespace-qualified create/drop/read/insert/delete/upsert plus a simple
//! equality-filtered projection. Backends are supplied by the embedding
//! application; the crate ships [`MemoryStore`] as a reference backend for
//! tests and dry runs.
//!
//! Every table exists (or not) independently in each [`Namespace`]: the
//! staging area owned by the current import run, and the permanent area that
//! only promotion writes to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod memory;

pub use memory::MemoryStore;

/// Error type for table-store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Table does not exist in the addressed namespace
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A referenced column does not exist on the table
    #[error("Column not found: {column} in table {table}")]
    ColumnNotFound { table: String, column: String },

    /// Query or mutation failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// CREATE was issued for an existing table with a different column list
    #[error("Schema mismatch for existing table {0}")]
    SchemaMismatch(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Underlying engine I/O error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type for table-store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The two logical table areas.
///
/// No operation ever implicitly mixes namespaces; cross-namespace work
/// (promotion, duplicate comparison) always names both sides explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Mutable working area owned by the current import run
    Staging,
    /// Durable area written only during promotion
    Permanent,
}

impl Namespace {
    /// Physical table-name prefix used by the default naming scheme.
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Staging => "imp_",
            Namespace::Permanent => "",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Staging => write!(f, "staging"),
            Namespace::Permanent => write!(f, "permanent"),
        }
    }
}

/// Scalar cell value.
///
/// Deliberately small: the catalog domain only ever stores null, text,
/// integers, reals and arrays of text (multi-valued index fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    TextArray(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the text payload, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64, text is not coerced here.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Canonical text form used when a raw value keys a dimension table.
    /// Null has no text form.
    pub fn text_form(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Real(r) => Some(r.to_string()),
            Value::TextArray(items) => Some(items.join(",")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// One stored row: column name to value.
pub type Row = HashMap<String, Value>;

/// Physical column type understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    TextArray,
    /// Store-managed audit column; the pipeline never writes it
    Timestamp,
}

/// Declarative column for CREATE TABLE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            not_null: false,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
}

/// Table store trait consumed by the import pipeline
///
/// All operations address tables by logical name plus [`Namespace`]; the
/// backend owns the mapping to physical names (see [`physical_name`]).
/// Operations are async to fit both embedded and networked engines, but the
/// pipeline itself never overlaps two calls.
///
/// [`physical_name`]: TableStore::physical_name
#[async_trait(?Send)]
pub trait TableStore: Send + Sync {
    /// Create a table if it does not exist.
    ///
    /// Idempotent: re-creating with the same column list is a no-op.
    /// Re-creating with a different column list is a [`StoreError::SchemaMismatch`].
    async fn create_table(
        &self,
        ns: Namespace,
        table: &str,
        columns: &[ColumnSpec],
    ) -> StoreResult<()>;

    /// Drop a table. Dropping a missing table is a no-op.
    async fn drop_table(&self, ns: Namespace, table: &str) -> StoreResult<()>;

    /// Whether the table exists in the namespace.
    async fn table_exists(&self, ns: Namespace, table: &str) -> StoreResult<bool>;

    /// Logical names of all tables in the namespace whose logical name
    /// starts with `prefix`. Sorted ascending for determinism.
    async fn table_names(&self, ns: Namespace, prefix: &str) -> StoreResult<Vec<String>>;

    /// Append rows. Missing columns store as null; unknown columns are a
    /// [`StoreError::ColumnNotFound`].
    ///
    /// # Returns
    /// Number of rows inserted.
    async fn insert_rows(&self, ns: Namespace, table: &str, rows: &[Row]) -> StoreResult<usize>;

    /// Delete every row where `column == value`.
    ///
    /// # Returns
    /// Number of rows deleted.
    async fn delete_rows_eq(
        &self,
        ns: Namespace,
        table: &str,
        column: &str,
        value: &Value,
    ) -> StoreResult<usize>;

    /// Read all rows, projected to `columns` (empty slice reads every
    /// column). Row order is the backend's stable insertion order.
    async fn read_rows(&self, ns: Namespace, table: &str, columns: &[&str])
    -> StoreResult<Vec<Row>>;

    /// Insert-or-replace keyed on `key_column`: a row whose key equals an
    /// existing row's key replaces it in place, otherwise it appends.
    ///
    /// # Returns
    /// Number of rows written.
    async fn upsert_rows(
        &self,
        ns: Namespace,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> StoreResult<usize>;

    /// Read-only projection with conjunctive equality filters.
    ///
    /// `columns` empty reads every column; `filters` empty reads every row.
    async fn select(
        &self,
        ns: Namespace,
        table: &str,
        columns: &[&str],
        filters: &[(&str, Value)],
    ) -> StoreResult<Vec<Row>>;

    /// Resolve a logical table name to its namespace-qualified physical
    /// name (used in log messages and by embedding code, never for joins).
    fn physical_name(&self, ns: Namespace, table: &str) -> String {
        format!("{}{}", ns.prefix(), table)
    }

    /// Backend type name for logs ("memory", "postgres", ...).
    fn backend_type(&self) -> &'static str;
}
