//! Declarative table schemas
//!
//! A [`TableSchema`] is an ordered list of [`ColumnDescriptor`]s plus a
//! [`TableRole`]. Descriptors say where a column's value comes from
//! ([`DataSource`]), how it is validated ([`FieldType`] and the bounds
//! fields), and whether it is backed by a dimension table
//! ([`DimensionSpec`]). Schemas are plain serde data (YAML files in
//! production, built programmatically in tests); interpretation lives in
//! `import::populate`.
//!
//! Table names may carry `<INST>`, `<MISSION>` and `<TARGET>` placeholders;
//! those are resolved by the registry's template stage before any schema
//! reaches the population engine (see [`registry::ResolvedSchemas`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::store::{ColumnKind, ColumnSpec};

pub mod order;
pub mod registry;

pub use order::{delete_order, write_order};
pub use registry::{ResolvedSchemas, SchemaRegistry};

/// Canonical pair a flag column normalizes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStyle {
    /// Truthy/falsy spellings map to "Yes"/"No"
    YesNo,
    /// Truthy/falsy spellings map to "On"/"Off"
    OnOff,
}

impl FlagStyle {
    /// The canonical (truthy, falsy) text pair.
    pub fn pair(&self) -> (&'static str, &'static str) {
        match self {
            FlagStyle::YesNo => ("Yes", "No"),
            FlagStyle::OnOff => ("On", "Off"),
        }
    }
}

/// Field type of one column, driving validation and coercion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Fixed-width text; overlength input truncates after a diagnostic
    Char { max_length: usize },
    /// Boolean-ish column normalized to a canonical pair
    Flag(FlagStyle),
    /// Signed integer
    Int,
    /// Unsigned integer (negative input is invalid)
    Uint,
    /// Floating point
    Real,
    /// Array of text (multi-valued index fields)
    TextArray,
    /// Store-managed audit column; never populated by the pipeline
    Timestamp,
}

impl FieldType {
    /// Physical column type for CREATE TABLE.
    pub fn column_kind(&self) -> ColumnKind {
        match self {
            FieldType::Char { .. } | FieldType::Flag(_) => ColumnKind::Text,
            FieldType::Int | FieldType::Uint => ColumnKind::Integer,
            FieldType::Real => ColumnKind::Real,
            FieldType::TextArray => ColumnKind::TextArray,
            FieldType::Timestamp => ColumnKind::Timestamp,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Uint | FieldType::Real)
    }
}

/// Where a column's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Copy a named field from a named row in the pass row set
    Direct { row: String, field: String },
    /// Like `Direct`, but the field is array-valued and one element is taken
    Indexed { row: String, field: String, index: usize },
    /// Dispatch to a registered computed-field callback by logical name
    Computed { function: String },
    /// Next unused integer id for this table (lazy max-scan counter)
    SurrogateId,
    /// Column exists physically but is never populated
    Ignore,
}

/// What happens when a numeric value violates its declared min/max bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsPolicy {
    /// Reportable diagnostic, then null
    #[default]
    Report,
    /// Null with only a debug-level note (column opted into silent nulling)
    NullSilently,
}

/// One pre-seeded entry of a fixed enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSeed {
    pub id: i64,
    /// Raw value; `None` seeds the null entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub label: String,
    pub disp_order: i64,
    #[serde(default = "default_display")]
    pub display: String,
}

fn default_display() -> String {
    "Y".to_string()
}

/// Dimension-table backing for an enumerated column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DimensionSpec {
    /// Fill the grouping column from the run's value-group lookup
    #[serde(default)]
    pub grouped: bool,
    /// Name of a registered rank parser; entries sort by the parsed
    /// numeric rank instead of their labels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    /// Fixed pre-seeded enumeration; registration of unseen values is
    /// rejected with a diagnostic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed: Option<Vec<DimensionSeed>>,
}

impl DimensionSpec {
    pub fn grouped() -> Self {
        Self {
            grouped: true,
            ..Default::default()
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }
}

/// One column of a table schema
///
/// # Example
///
/// ```rust
/// use catalog_ingest::schema::{ColumnDescriptor, DataSource, FieldType};
///
/// let col = ColumnDescriptor::new(
///     "declination",
///     FieldType::Real,
///     DataSource::Direct { row: "index".into(), field: "DECLINATION".into() },
/// )
/// .bounds(-90.0, 90.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub source: DataSource,
    /// Evaluation order within the table (ties break on declaration order)
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub not_null: bool,
    /// Numeric values equal to any sentinel are nulled with a reportable
    /// notice
    #[serde(default)]
    pub sentinels: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub bounds_policy: BoundsPolicy,
    /// Present when the column is backed by a dimension table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<DimensionSpec>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType, source: DataSource) -> Self {
        Self {
            name: name.into(),
            field_type,
            source,
            order: 0,
            not_null: false,
            sentinels: Vec::new(),
            min: None,
            max: None,
            bounds_policy: BoundsPolicy::default(),
            dimension: None,
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn sentinel(mut self, value: f64) -> Self {
        self.sentinels.push(value);
        self
    }

    pub fn bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn null_on_invalid(mut self) -> Self {
        self.bounds_policy = BoundsPolicy::NullSilently;
        self
    }

    pub fn dimension(mut self, spec: DimensionSpec) -> Self {
        self.dimension = Some(spec);
        self
    }

    /// Whether the population engine skips this column entirely.
    pub fn is_store_managed(&self) -> bool {
        matches!(self.source, DataSource::Ignore)
            || matches!(self.field_type, FieldType::Timestamp)
    }
}

/// Role of a table in the import, dispatched on instead of name matching.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    /// The one table whose population computes the entity identity key
    Primary { identity_column: String },
    /// Ordinary dependent table, one row per observation
    #[default]
    Standard,
    /// Template instantiated once per discovered target name
    PerTarget,
    /// Expands one source row into many rows (file products)
    MultiRowPerSource,
}

/// Companion column holding the dimension-table id for an enumerated column.
pub fn companion_column(column: &str) -> String {
    format!("mult_{}", column)
}

/// One target table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Logical table name; may contain placeholders until resolved
    pub name: String,
    #[serde(default)]
    pub role: TableRole,
    /// Instruments this table applies to (`None` = all)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruments: Option<Vec<String>>,
    /// Missions this table applies to (`None` = all)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missions: Option<Vec<String>>,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.into(),
            role: TableRole::default(),
            instruments: None,
            missions: None,
            columns,
        }
    }

    pub fn with_role(mut self, role: TableRole) -> Self {
        self.role = role;
        self
    }

    pub fn for_instruments(mut self, instruments: &[&str]) -> Self {
        self.instruments = Some(instruments.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Identity column name if this is the primary table.
    pub fn identity_column(&self) -> Option<&str> {
        match &self.role {
            TableRole::Primary { identity_column } => Some(identity_column),
            _ => None,
        }
    }

    /// Columns in ascending evaluation order; declaration order breaks ties.
    pub fn columns_in_order(&self) -> Vec<&ColumnDescriptor> {
        let mut columns: Vec<&ColumnDescriptor> = self.columns.iter().collect();
        columns.sort_by_key(|c| c.order);
        columns
    }

    /// Whether the name still carries an unresolved placeholder.
    pub fn is_template(&self) -> bool {
        self.name.contains('<')
    }

    /// Logical names of rows this schema reads through direct/indexed
    /// sources. Only names that are themselves tables contribute
    /// dependency edges; the rest name catalog-supplied rows.
    pub fn source_rows(&self) -> BTreeSet<&str> {
        self.columns
            .iter()
            .filter_map(|c| match &c.source {
                DataSource::Direct { row, .. } | DataSource::Indexed { row, .. } => {
                    Some(row.as_str())
                }
                _ => None,
            })
            .collect()
    }

    /// Physical column list for CREATE TABLE, with, for every
    /// dimension-backed descriptor, its synthesized `mult_<column>`
    /// companion id column appended.
    pub fn create_columns(&self) -> Vec<ColumnSpec> {
        let mut specs = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            let mut spec = ColumnSpec::new(&col.name, col.field_type.column_kind());
            if col.not_null {
                spec = spec.not_null();
            }
            if matches!(col.source, DataSource::SurrogateId) {
                spec = spec.primary_key();
            }
            specs.push(spec);
        }
        for col in &self.columns {
            if col.dimension.is_some() {
                specs.push(ColumnSpec::new(companion_column(&col.name), ColumnKind::Integer));
            }
        }
        specs
    }
}
