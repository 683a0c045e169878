//! Schema-driven field population
//!
//! [`populate_table`] walks one table schema in column evaluation order,
//! resolves each column's [`DataSource`] against the pass row set, validates
//! and coerces the value, registers dimension entries, and writes the result
//! into both the returned row and the pass row set (so later columns and
//! later tables can read it). Bad values become diagnostics plus null; only
//! store and catalog failures propagate as errors.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::catalog::{AuxiliaryKey, CatalogSource, SourceRecord, SourceRow, Volume};
use crate::schema::{
    BoundsPolicy, ColumnDescriptor, DataSource, FieldType, FlagStyle, TableSchema,
    companion_column,
};
use crate::store::{Row, TableStore, Value};

use super::ImportError;
use super::context::RunContext;
use super::diagnostics::Diagnostics;
use super::dimensions::DimensionTableId;
use super::functions::{ComputedValue, FieldFnInput, FieldFnRegistry};

static FLAG_TRUTHY: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["1", "y", "Y", "yes", "Yes", "YES", "on", "ON"]));
static FLAG_FALSY: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["0", "n", "N", "no", "No", "NO", "off", "OFF"]));
static FLAG_UNKNOWN: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["N/A", "UNK", "NULL"]));

/// Named metadata rows available while populating one source record.
///
/// Starts as the catalog's pre-joined rows; identity-keyed auxiliary rows
/// and the partially populated target rows of already-processed tables are
/// added as the pass proceeds.
#[derive(Debug, Default)]
pub struct PassRows {
    rows: HashMap<String, SourceRow>,
    sub_keyed: HashMap<String, BTreeMap<String, SourceRow>>,
    optional: HashSet<String>,
}

impl PassRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_record(record: &SourceRecord) -> Self {
        Self {
            rows: record.rows.clone(),
            sub_keyed: HashMap::new(),
            optional: HashSet::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, row: SourceRow) {
        self.rows.insert(name.into(), row);
    }

    pub fn get(&self, name: &str) -> Option<&SourceRow> {
        self.rows.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<SourceRow> {
        self.rows.remove(name)
    }

    /// Mark a row name whose absence is expected; direct reads from it
    /// yield null without a diagnostic.
    pub fn mark_optional(&mut self, name: impl Into<String>) {
        self.optional.insert(name.into());
    }

    pub fn is_optional(&self, name: &str) -> bool {
        self.optional.contains(name)
    }

    pub fn insert_sub_keyed(&mut self, name: impl Into<String>, rows: BTreeMap<String, SourceRow>) {
        self.sub_keyed.insert(name.into(), rows);
    }

    pub fn sub_keyed(&self, name: &str) -> Option<&BTreeMap<String, SourceRow>> {
        self.sub_keyed.get(name)
    }

    pub fn has_sub_keyed(&self, name: &str) -> bool {
        self.sub_keyed.contains_key(name)
    }

    fn begin_table(&mut self, name: &str) {
        self.rows.entry(name.to_string()).or_default();
    }

    fn set_field(&mut self, row_name: &str, field: &str, value: Value) {
        self.rows
            .entry(row_name.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    fn direct_value(
        &self,
        row_name: &str,
        field: &str,
        table: &str,
        diag: &mut Diagnostics,
    ) -> Value {
        let Some(row) = self.rows.get(row_name) else {
            if !self.is_optional(row_name) {
                diag.error(format!(
                    "Missing metadata row '{}' populating {}",
                    row_name, table
                ));
            }
            return Value::Null;
        };
        match row.get(field) {
            Some(value) => value.clone(),
            None => {
                diag.error(format!(
                    "Unknown field '{}' in row '{}' populating {}",
                    field, row_name, table
                ));
                Value::Null
            }
        }
    }

    fn indexed_value(
        &self,
        row_name: &str,
        field: &str,
        index: usize,
        table: &str,
        diag: &mut Diagnostics,
    ) -> Value {
        match self.direct_value(row_name, field, table, diag) {
            Value::Null => Value::Null,
            Value::TextArray(items) => match items.get(index) {
                Some(item) => Value::Text(item.clone()),
                None => {
                    diag.error(format!(
                        "Index {} out of range for field '{}' in row '{}' populating {}",
                        index, field, row_name, table
                    ));
                    Value::Null
                }
            },
            _ => {
                diag.error(format!(
                    "Field '{}' in row '{}' is not an array populating {}",
                    field, row_name, table
                ));
                Value::Null
            }
        }
    }
}

/// Immutable collaborators shared by every populate call of one record.
pub(crate) struct PassEnv<'a, S: TableStore + ?Sized, C: CatalogSource + ?Sized> {
    pub store: &'a S,
    pub source: &'a C,
    pub fns: &'a FieldFnRegistry,
    pub volume: &'a Volume,
}

/// Populate one target row for `schema` from the pass row set.
pub(crate) async fn populate_table<S, C>(
    env: &PassEnv<'_, S, C>,
    schema: &TableSchema,
    pass: &mut PassRows,
    ctx: &mut RunContext,
) -> Result<Row, ImportError>
where
    S: TableStore + ?Sized,
    C: CatalogSource + ?Sized,
{
    pass.begin_table(&schema.name);

    for col in schema.columns_in_order() {
        if col.is_store_managed() {
            continue;
        }

        let mut label: Option<String> = None;
        let raw = match &col.source {
            DataSource::Direct { row, field } => {
                pass.direct_value(row, field, &schema.name, &mut ctx.diagnostics)
            }
            DataSource::Indexed { row, field, index } => {
                pass.indexed_value(row, field, *index, &schema.name, &mut ctx.diagnostics)
            }
            DataSource::Computed { function } => match env.fns.lookup(env.volume, function) {
                Some(f) => {
                    let input = FieldFnInput {
                        volume: env.volume,
                        rows: pass,
                    };
                    match f(&input) {
                        ComputedValue::Value(v) => v,
                        ComputedValue::WithLabel(v, l) => {
                            label = Some(l);
                            v
                        }
                    }
                }
                None => {
                    ctx.diagnostics.error(format!(
                        "Unknown computed-field function '{}' for {}.{}",
                        function, schema.name, col.name
                    ));
                    Value::Null
                }
            },
            DataSource::SurrogateId => {
                Value::Int(ctx.surrogates.next_id(env.store, &schema.name).await?)
            }
            DataSource::Ignore => Value::Null,
        };

        let value = validate_value(col, raw, &mut ctx.diagnostics, &schema.name);
        if value.is_null() && col.not_null {
            ctx.diagnostics.error(format!(
                "Required column {}.{} is null",
                schema.name, col.name
            ));
        }

        if let Some(spec) = &col.dimension {
            let dim_id = DimensionTableId::new(&schema.name, &col.name);
            let id = ctx
                .dimensions
                .register_value(
                    env.store,
                    &mut ctx.diagnostics,
                    &dim_id,
                    spec,
                    &value,
                    label.take(),
                    &ctx.options,
                )
                .await?;
            pass.set_field(&schema.name, &companion_column(&col.name), Value::Int(id));
        }

        let is_identity = schema.identity_column() == Some(col.name.as_str());
        pass.set_field(&schema.name, &col.name, value.clone());
        if is_identity && let Some(key) = value.as_text() {
            resolve_identity_auxiliaries(env.source, key, pass);
        }
    }

    Ok(pass.get(&schema.name).cloned().unwrap_or_default())
}

/// Pull identity-keyed auxiliary rows into the pass row set once the
/// identity key is known. Identity-keyed sets the volume carries but that
/// lack a row for this key are worth a warning; sub-keyed sets legitimately
/// cover only some observations, so their absence is silent.
fn resolve_identity_auxiliaries<C: CatalogSource + ?Sized>(
    source: &C,
    key: &str,
    pass: &mut PassRows,
) {
    for set in source.auxiliary_sets() {
        match set.keyed {
            AuxiliaryKey::SourceRecord => {}
            AuxiliaryKey::Identity => {
                if pass.get(&set.name).is_some() {
                    continue;
                }
                match source.auxiliary_row(&set.name, key) {
                    Some(row) => pass.insert(set.name.clone(), row),
                    None => {
                        if source.has_auxiliary(&set.name) {
                            warn!(set = %set.name, key, "Auxiliary set has no row for identity");
                        }
                        pass.mark_optional(set.name.clone());
                    }
                }
            }
            AuxiliaryKey::IdentitySubKey => {
                if pass.has_sub_keyed(&set.name) {
                    continue;
                }
                match source.auxiliary_rows_by_sub_key(&set.name, key) {
                    Some(rows) => pass.insert_sub_keyed(set.name.clone(), rows),
                    None => pass.mark_optional(set.name.clone()),
                }
            }
        }
    }
}

fn validate_value(
    col: &ColumnDescriptor,
    raw: Value,
    diag: &mut Diagnostics,
    table: &str,
) -> Value {
    match col.field_type {
        FieldType::Char { max_length } => validate_char(col, raw, max_length, diag, table),
        FieldType::Flag(style) => validate_flag(col, raw, style, diag, table),
        FieldType::Int | FieldType::Uint | FieldType::Real => {
            validate_numeric(col, raw, diag, table)
        }
        FieldType::TextArray => validate_array(col, raw, diag, table),
        FieldType::Timestamp => Value::Null,
    }
}

fn validate_char(
    col: &ColumnDescriptor,
    raw: Value,
    max_length: usize,
    diag: &mut Diagnostics,
    table: &str,
) -> Value {
    match raw {
        Value::Null => Value::Null,
        Value::Text(s) => {
            if s.chars().count() > max_length {
                diag.error(format!(
                    "Value '{}' too long for {}.{} (max {})",
                    s, table, col.name, max_length
                ));
                Value::Text(s.chars().take(max_length).collect())
            } else {
                Value::Text(s)
            }
        }
        other => {
            diag.error(format!(
                "Non-text value {:?} for text column {}.{}",
                other, table, col.name
            ));
            Value::Text(String::new())
        }
    }
}

fn validate_flag(
    col: &ColumnDescriptor,
    raw: Value,
    style: FlagStyle,
    diag: &mut Diagnostics,
    table: &str,
) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    let text = raw.text_form().unwrap_or_default();
    let (truthy, falsy) = style.pair();
    if FLAG_TRUTHY.contains(text.as_str()) {
        Value::Text(truthy.to_string())
    } else if FLAG_FALSY.contains(text.as_str()) {
        Value::Text(falsy.to_string())
    } else if FLAG_UNKNOWN.contains(text.as_str()) {
        Value::Null
    } else {
        diag.error(format!(
            "Unrecognized flag value '{}' for {}.{}",
            text, table, col.name
        ));
        Value::Null
    }
}

fn validate_numeric(
    col: &ColumnDescriptor,
    raw: Value,
    diag: &mut Diagnostics,
    table: &str,
) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    let num: f64 = match &raw {
        Value::Int(i) => *i as f64,
        Value::Real(r) => *r,
        Value::Text(s) => {
            let trimmed = s.trim();
            let parsed = match col.field_type {
                FieldType::Int | FieldType::Uint => trimmed.parse::<i64>().map(|v| v as f64).ok(),
                _ => trimmed.parse::<f64>().ok(),
            };
            match parsed {
                Some(n) => n,
                None => {
                    diag.error(format!(
                        "Unable to parse '{}' as a number for {}.{}",
                        s, table, col.name
                    ));
                    return Value::Null;
                }
            }
        }
        _ => {
            diag.error(format!(
                "Non-numeric value {:?} for numeric column {}.{}",
                raw, table, col.name
            ));
            return Value::Null;
        }
    };

    // Sentinels mean "not measured"; the source should have nulled them
    // before they ever reach a column, so catching one is reportable.
    if col.sentinels.iter().any(|s| *s == num) {
        diag.error(format!(
            "Caught sentinel value {} for {}.{}",
            num, table, col.name
        ));
        return Value::Null;
    }

    if let Some(min) = col.min
        && num < min
    {
        return bounds_violation(col, num, min, "below minimum", diag, table);
    }
    if let Some(max) = col.max
        && num > max
    {
        return bounds_violation(col, num, max, "above maximum", diag, table);
    }

    match col.field_type {
        FieldType::Uint => {
            if num < 0.0 {
                diag.error(format!(
                    "Negative value {} for unsigned column {}.{}",
                    num, table, col.name
                ));
                return Value::Null;
            }
            Value::Int(num as i64)
        }
        FieldType::Int => Value::Int(num as i64),
        _ => Value::Real(num),
    }
}

fn bounds_violation(
    col: &ColumnDescriptor,
    num: f64,
    bound: f64,
    kind: &str,
    diag: &mut Diagnostics,
    table: &str,
) -> Value {
    let message = format!(
        "Value {} for {}.{} {} {}",
        num, table, col.name, kind, bound
    );
    match col.bounds_policy {
        BoundsPolicy::Report => diag.error(message),
        BoundsPolicy::NullSilently => diag.debug(message),
    }
    Value::Null
}

fn validate_array(
    col: &ColumnDescriptor,
    raw: Value,
    diag: &mut Diagnostics,
    table: &str,
) -> Value {
    match raw {
        Value::Null => Value::Null,
        Value::TextArray(_) => raw,
        Value::Text(s) => Value::TextArray(vec![s]),
        other => {
            diag.error(format!(
                "Non-array value {:?} for array column {}.{}",
                other, table, col.name
            ));
            Value::Null
        }
    }
}
