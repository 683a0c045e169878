//! Dimension-table cache
//!
//! Enumerated columns key into small lookup tables named
//! `mult_<table>_<column>`, holding one row per distinct raw value with a
//! store-assigned id, a human label and a display position. During a volume
//! import every touched dimension table is cached here in memory; the store
//! is read at most once per table and written once at flush time, after
//! display positions have been recomputed from the total sort order.

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::schema::{DimensionSeed, DimensionSpec};
use crate::store::{ColumnKind, ColumnSpec, Namespace, Row, StoreResult, TableStore, Value};

use super::context::ImportOptions;
use super::diagnostics::Diagnostics;
use super::functions::{FieldFnRegistry, RankParser};

/// Labels sorted into the not-available band, just before null.
static NA_LABELS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["N/A", "NONE", "None", "NULL", "Null"]));

/// Identifies one dimension table by the fact table and column it backs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionTableId {
    pub table: String,
    pub column: String,
}

impl DimensionTableId {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Logical store name of the dimension table.
    pub fn table_name(&self) -> String {
        format!("mult_{}_{}", self.table, self.column)
    }
}

/// One row of a dimension table.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionEntry {
    pub id: i64,
    /// Raw value; `None` is the null entry
    pub value: Option<String>,
    pub label: String,
    pub disp_order: i64,
    /// "Y" or "N"
    pub display: String,
    pub grouping: Option<String>,
}

impl DimensionEntry {
    fn from_seed(seed: &DimensionSeed) -> Self {
        Self {
            id: seed.id,
            value: seed.value.clone(),
            label: seed.label.clone(),
            disp_order: seed.disp_order,
            display: seed.display.clone(),
            grouping: None,
        }
    }

    fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id").and_then(Value::as_int).unwrap_or(0),
            value: row.get("value").and_then(Value::text_form),
            label: row
                .get("label")
                .and_then(Value::text_form)
                .unwrap_or_else(|| "N/A".to_string()),
            disp_order: row.get("disp_order").and_then(Value::as_int).unwrap_or(0),
            display: row
                .get("display")
                .and_then(Value::text_form)
                .unwrap_or_else(|| "Y".to_string()),
            grouping: row.get("grouping").and_then(Value::text_form),
        }
    }

    fn to_row(&self, grouped: bool) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Int(self.id));
        row.insert("value".to_string(), Value::from(self.value.clone()));
        row.insert("label".to_string(), Value::from(self.label.clone()));
        row.insert("disp_order".to_string(), Value::Int(self.disp_order));
        row.insert("display".to_string(), Value::from(self.display.clone()));
        if grouped {
            row.insert("grouping".to_string(), Value::from(self.grouping.clone()));
        }
        row
    }
}

/// Physical column list of a dimension table.
pub(crate) fn dimension_columns(grouped: bool) -> Vec<ColumnSpec> {
    let mut columns = vec![
        ColumnSpec::new("id", ColumnKind::Integer).primary_key(),
        ColumnSpec::new("value", ColumnKind::Text),
        ColumnSpec::new("label", ColumnKind::Text),
        ColumnSpec::new("disp_order", ColumnKind::Integer),
        ColumnSpec::new("display", ColumnKind::Text),
    ];
    if grouped {
        columns.push(ColumnSpec::new("grouping", ColumnKind::Text));
    }
    columns
}

#[derive(Debug)]
struct CachedTable {
    entries: Vec<DimensionEntry>,
    dirty: bool,
    fixed: bool,
    grouped: bool,
    range: Option<String>,
}

/// In-memory cache of every dimension table touched by the current volume.
#[derive(Debug, Default)]
pub struct DimensionCache {
    tables: HashMap<DimensionTableId, CachedTable>,
    /// Names created empty this run and not yet flushed non-empty. A later
    /// volume must not prefer such an empty staging copy over a richer
    /// permanent one, so this set survives `reset`.
    created_this_run: HashSet<String>,
}

impl DimensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop per-volume caches. The created-empty markers persist for the
    /// rest of the run.
    pub fn reset(&mut self) {
        self.tables.clear();
    }

    pub fn cached_table_count(&self) -> usize {
        self.tables.len()
    }

    /// Entries currently cached for a dimension table, in cache order.
    pub fn entries(&self, id: &DimensionTableId) -> Option<&[DimensionEntry]> {
        self.tables.get(id).map(|t| t.entries.as_slice())
    }

    /// Resolve `raw` to its dimension id, registering a new entry when the
    /// value has not been seen.
    ///
    /// Fixed enumerations never grow: an unseen value there is a reportable
    /// diagnostic and resolves to id 0. New entries get id max+1 (0 for an
    /// empty table), a derived label unless `label` overrides it, and a
    /// placeholder display position corrected at flush time.
    pub async fn register_value<S: TableStore + ?Sized>(
        &mut self,
        store: &S,
        diag: &mut Diagnostics,
        id: &DimensionTableId,
        spec: &DimensionSpec,
        raw: &Value,
        label: Option<String>,
        options: &ImportOptions,
    ) -> StoreResult<i64> {
        let cached = match self.tables.entry(id.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let loaded = load_cached_table(store, id, spec, &mut self.created_this_run).await?;
                e.insert(loaded)
            }
        };

        let value_text = raw.text_form();
        if let Some(entry) = cached.entries.iter().find(|e| e.value == value_text) {
            return Ok(entry.id);
        }

        let name = id.table_name();
        if cached.fixed {
            diag.error(format!(
                "Value '{}' not in fixed enumeration {}",
                value_text.as_deref().unwrap_or("NULL"),
                name
            ));
            return Ok(0);
        }

        let next_id = cached.entries.iter().map(|e| e.id).max().map_or(0, |m| m + 1);
        let label = label.unwrap_or_else(|| default_label(value_text.as_deref()));
        let grouping = if cached.grouped {
            let key = value_text.as_deref().unwrap_or("");
            Some(
                options
                    .value_groups
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| "OTHER".to_string()),
            )
        } else {
            None
        };
        let disp_order = (cached.entries.len() as i64 + 1) * 10;

        if options.quiet_dimensions {
            debug!(table = %name, value = ?value_text, label = %label, "New dimension entry");
        } else {
            info!(table = %name, value = ?value_text, label = %label, "New dimension entry");
        }

        cached.entries.push(DimensionEntry {
            id: next_id,
            value: value_text,
            label,
            disp_order,
            display: "Y".to_string(),
            grouping,
        });
        cached.dirty = true;
        Ok(next_id)
    }

    /// Write every dirty cached table back to the staging namespace.
    ///
    /// Non-fixed tables are re-sorted first and display positions rewritten
    /// as (position + 1) * 10; fixed enumerations keep their seeded
    /// positions. Rows upsert by id, so entries that already exist are
    /// updated in place rather than duplicated.
    ///
    /// # Returns
    /// Total number of entries written.
    pub async fn flush_all<S: TableStore + ?Sized>(
        &mut self,
        store: &S,
        diag: &mut Diagnostics,
        fns: &FieldFnRegistry,
        options: &ImportOptions,
    ) -> StoreResult<usize> {
        let mut dirty_ids: Vec<DimensionTableId> = self
            .tables
            .iter()
            .filter(|(_, t)| t.dirty)
            .map(|(id, _)| id.clone())
            .collect();
        dirty_ids.sort_by_key(|id| id.table_name());

        let mut written = 0;
        for id in dirty_ids {
            let name = id.table_name();
            let Some(cached) = self.tables.get_mut(&id) else {
                continue;
            };
            if !cached.fixed {
                resort_entries(cached, fns, diag, &name);
            }
            if cached.entries.is_empty() {
                cached.dirty = false;
                continue;
            }

            let columns = dimension_columns(cached.grouped);
            store.create_table(Namespace::Staging, &name, &columns).await?;
            let rows: Vec<Row> = cached
                .entries
                .iter()
                .map(|e| e.to_row(cached.grouped))
                .collect();
            store.upsert_rows(Namespace::Staging, &name, "id", &rows).await?;
            written += rows.len();
            cached.dirty = false;
            self.created_this_run.remove(&name);

            if options.quiet_dimensions {
                debug!(table = %name, entries = rows.len(), "Flushed dimension table");
            } else {
                info!(table = %name, entries = rows.len(), "Flushed dimension table");
            }
        }
        Ok(written)
    }
}

/// Read a dimension table into the cache, preferring a same-run staging
/// copy over the permanent copy. A permanent-only table is marked dirty so
/// the flush writes it back to staging; a table found nowhere starts empty
/// and is remembered as created this run.
async fn load_cached_table<S: TableStore + ?Sized>(
    store: &S,
    id: &DimensionTableId,
    spec: &DimensionSpec,
    created_this_run: &mut HashSet<String>,
) -> StoreResult<CachedTable> {
    let name = id.table_name();

    if let Some(seeds) = &spec.fixed {
        let entries: Vec<DimensionEntry> = seeds.iter().map(DimensionEntry::from_seed).collect();
        let dirty = !store.table_exists(Namespace::Staging, &name).await?;
        return Ok(CachedTable {
            entries,
            dirty,
            fixed: true,
            grouped: spec.grouped,
            range: spec.range.clone(),
        });
    }

    let staged = store.table_exists(Namespace::Staging, &name).await?;
    if staged && !created_this_run.contains(&name) {
        let entries = read_entries(store, Namespace::Staging, &name).await?;
        return Ok(CachedTable {
            entries,
            dirty: false,
            fixed: false,
            grouped: spec.grouped,
            range: spec.range.clone(),
        });
    }

    if store.table_exists(Namespace::Permanent, &name).await? {
        let entries = read_entries(store, Namespace::Permanent, &name).await?;
        return Ok(CachedTable {
            entries,
            dirty: true,
            fixed: false,
            grouped: spec.grouped,
            range: spec.range.clone(),
        });
    }

    created_this_run.insert(name);
    Ok(CachedTable {
        entries: Vec::new(),
        dirty: false,
        fixed: false,
        grouped: spec.grouped,
        range: spec.range.clone(),
    })
}

async fn read_entries<S: TableStore + ?Sized>(
    store: &S,
    ns: Namespace,
    name: &str,
) -> StoreResult<Vec<DimensionEntry>> {
    let rows = store.read_rows(ns, name, &[]).await?;
    let mut entries: Vec<DimensionEntry> = rows.iter().map(DimensionEntry::from_row).collect();
    entries.sort_by_key(|e| e.id);
    Ok(entries)
}

/// Derive a label for a value no callback supplied one for. Null becomes
/// "N/A"; values bracketed by digits (dates, numbers) pass through; the
/// rest are title-cased word by word.
fn default_label(value: Option<&str>) -> String {
    let Some(value) = value else {
        return "N/A".to_string();
    };
    let first_digit = value.chars().next().is_some_and(|c| c.is_ascii_digit());
    let last_digit = value.chars().last().is_some_and(|c| c.is_ascii_digit());
    if first_digit && last_digit {
        value.to_string()
    } else {
        title_case(value)
    }
}

fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_alpha = false;
    for ch in value.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

/// Total sort order over dimension entries: numeric ranks, then labels,
/// then the not-available band, then the null entry.
#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Numeric(f64),
    Label(String),
    NotAvailable,
    Null,
}

impl SortKey {
    fn band(&self) -> u8 {
        match self {
            SortKey::Numeric(_) => 0,
            SortKey::Label(_) => 1,
            SortKey::NotAvailable => 2,
            SortKey::Null => 3,
        }
    }

    fn cmp(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Numeric(a), SortKey::Numeric(b)) => a.total_cmp(b),
            (SortKey::Label(a), SortKey::Label(b)) => a.cmp(b),
            _ => self.band().cmp(&other.band()),
        }
    }
}

fn sort_key_for(
    entry: &DimensionEntry,
    parser: Option<&RankParser>,
    all_numeric: bool,
    diag: &mut Diagnostics,
    table_name: &str,
) -> SortKey {
    let Some(value) = entry.value.as_deref() else {
        return SortKey::Null;
    };
    if NA_LABELS.contains(entry.label.as_str()) {
        return SortKey::NotAvailable;
    }
    if let Some(parse) = parser {
        return match parse(value) {
            Some(rank) => SortKey::Numeric(rank),
            None => {
                diag.error(format!(
                    "Unable to rank value '{}' for sorting {}",
                    value, table_name
                ));
                SortKey::Label(entry.label.clone())
            }
        };
    }
    if all_numeric && let Ok(n) = entry.label.parse::<f64>() {
        return SortKey::Numeric(n);
    }
    // Canonical flag labels sort truthy before falsy while staying behind
    // ordinary labels.
    match entry.label.as_str() {
        "Yes" | "On" => SortKey::Label("ZZAYes".to_string()),
        "No" | "Off" => SortKey::Label("ZZBNo".to_string()),
        _ => SortKey::Label(entry.label.clone()),
    }
}

fn resort_entries(
    cached: &mut CachedTable,
    fns: &FieldFnRegistry,
    diag: &mut Diagnostics,
    table_name: &str,
) {
    let parser = cached.range.as_deref().and_then(|r| fns.rank_parser(r));
    let all_numeric = cached
        .entries
        .iter()
        .filter(|e| e.value.is_some() && !NA_LABELS.contains(e.label.as_str()))
        .all(|e| e.label.parse::<f64>().is_ok());

    let entries = std::mem::take(&mut cached.entries);
    let mut decorated: Vec<(SortKey, DimensionEntry)> = entries
        .into_iter()
        .map(|e| {
            let key = sort_key_for(&e, parser, all_numeric, diag, table_name);
            (key, e)
        })
        .collect();
    decorated.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)));

    cached.entries = decorated
        .into_iter()
        .enumerate()
        .map(|(position, (_, mut entry))| {
            entry.disp_order = (position as i64 + 1) * 10;
            entry
        })
        .collect();
}
