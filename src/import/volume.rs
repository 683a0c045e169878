//! Per-volume import driver
//!
//! [`VolumeImporter`] walks one volume through its lifecycle: locate the
//! index, populate rows per source record (resolving duplicates as they
//! surface), flush dimension tables, then write the buffered fact rows to
//! the staging namespace in dependency order. Promotion to the permanent
//! namespace is a separate step (see [`super::promote`]).

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogSource, FileProduct, ProductVersion, SourceRecord, SourceRow, Volume};
use crate::schema::registry::ResolvedSchemas;
use crate::schema::{SchemaRegistry, TableRole, TableSchema};
use crate::store::{Namespace, Row, TableStore, Value};

use super::ImportError;
use super::context::RunContext;
use super::dedup::{delete_identity, delete_volume, purge_buffered, read_staged_identities};
use super::functions::FieldFnRegistry;
use super::populate::{PassEnv, PassRows, populate_table};

/// Lifecycle of one volume import. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Uninitialized,
    IndexLocated,
    RowsPopulated,
    MultsFlushed,
    Written,
    Promoted,
}

/// What happened to one source record.
enum RecordStatus {
    Imported,
    /// Intra-batch duplicate: earlier buffered rows were purged
    ReplacedBuffered,
    /// Cross-batch duplicate: staged rows were deleted first
    ReplacedStaged,
    /// No identity key could be computed; nothing was buffered
    Skipped,
}

/// Outcome of one staged volume import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub volume_id: String,
    pub run_id: Uuid,
    pub state: VolumeState,
    pub source_records: usize,
    /// Final buffered primary rows after duplicate resolution
    pub observations: usize,
    pub rows_written: usize,
    pub tables_written: usize,
    pub dimension_entries: usize,
    pub intra_batch_duplicates: usize,
    pub cross_batch_duplicates: usize,
    pub skipped_records: usize,
    /// Reportable diagnostics raised by this volume
    pub diagnostics: Vec<String>,
    pub bad_data: bool,
}

/// Imports one volume into the staging namespace.
pub struct VolumeImporter<'a, S: TableStore + ?Sized, C: CatalogSource + ?Sized> {
    store: &'a S,
    source: &'a C,
    registry: &'a SchemaRegistry,
    fns: &'a FieldFnRegistry,
    ctx: &'a mut RunContext,
    volume: Volume,
    state: VolumeState,
    /// Populated rows awaiting the write phase, keyed by concrete table name
    buffers: BTreeMap<String, Vec<Row>>,
    /// Concrete table names instantiated per template name
    instances: BTreeMap<String, BTreeSet<String>>,
    /// Resolved per-target schemas by concrete table name
    concrete_schemas: BTreeMap<String, TableSchema>,
}

impl<'a, S: TableStore + ?Sized, C: CatalogSource + ?Sized> VolumeImporter<'a, S, C> {
    pub fn new(
        store: &'a S,
        source: &'a C,
        registry: &'a SchemaRegistry,
        fns: &'a FieldFnRegistry,
        ctx: &'a mut RunContext,
    ) -> Self {
        let volume = source.volume().clone();
        Self {
            store,
            source,
            registry,
            fns,
            ctx,
            volume,
            state: VolumeState::Uninitialized,
            buffers: BTreeMap::new(),
            instances: BTreeMap::new(),
            concrete_schemas: BTreeMap::new(),
        }
    }

    /// Run the import through the `Written` state.
    pub async fn run(mut self) -> Result<ImportSummary, ImportError> {
        self.ctx.begin_volume(&self.volume.id);
        let diag_mark = self.ctx.diagnostics.error_count();

        let schemas = self
            .registry
            .resolve(&self.volume.instrument, &self.volume.mission)?;
        let identity_column = schemas
            .identity_column()
            .ok_or(ImportError::NoPrimaryTable)?
            .to_string();

        for set in self.source.auxiliary_sets() {
            if set.mandatory && !self.source.has_auxiliary(&set.name) {
                if self.ctx.options.permissive {
                    self.ctx.diagnostics.error(format!(
                        "Volume {} is missing mandatory auxiliary set '{}'",
                        self.volume.id, set.name
                    ));
                    self.ctx.bad_data = true;
                } else {
                    return Err(ImportError::MissingAuxiliary {
                        set: set.name,
                        volume: self.volume.id.clone(),
                    });
                }
            }
        }

        let records = self.source.source_records()?;
        self.state = VolumeState::IndexLocated;

        // a partial earlier pass may have left rows behind
        delete_volume(self.store, Namespace::Staging, &schemas, &self.volume.id).await?;

        let staged = if self.ctx.options.check_duplicates {
            let primary = schemas.primary().map(|t| t.name.clone()).unwrap_or_default();
            read_staged_identities(self.store, &primary, &identity_column).await?
        } else {
            HashSet::new()
        };

        let mut intra = 0usize;
        let mut cross = 0usize;
        let mut skipped = 0usize;
        let mut seen: HashSet<String> = HashSet::new();
        for record in &records {
            let status = self
                .process_record(&schemas, &identity_column, record, &staged, &mut seen)
                .await?;
            match status {
                RecordStatus::Imported => {}
                RecordStatus::ReplacedBuffered => intra += 1,
                RecordStatus::ReplacedStaged => cross += 1,
                RecordStatus::Skipped => skipped += 1,
            }
        }
        self.state = VolumeState::RowsPopulated;

        // dimension tables first: fact rows reference their ids
        let dimension_entries = self
            .ctx
            .dimensions
            .flush_all(
                self.store,
                &mut self.ctx.diagnostics,
                self.fns,
                &self.ctx.options,
            )
            .await?;
        self.state = VolumeState::MultsFlushed;

        let (rows_written, tables_written) = self.write_buffers(&schemas).await?;
        self.state = VolumeState::Written;

        let observations = schemas
            .primary()
            .and_then(|t| self.buffers.get(&t.name))
            .map(Vec::len)
            .unwrap_or(0);

        info!(
            volume_id = %self.volume.id,
            observations,
            rows_written,
            tables_written,
            dimension_entries,
            intra_batch_duplicates = intra,
            cross_batch_duplicates = cross,
            "Volume staged"
        );

        Ok(ImportSummary {
            volume_id: self.volume.id.clone(),
            run_id: self.ctx.run_id,
            state: self.state,
            source_records: records.len(),
            observations,
            rows_written,
            tables_written,
            dimension_entries,
            intra_batch_duplicates: intra,
            cross_batch_duplicates: cross,
            skipped_records: skipped,
            diagnostics: self.ctx.diagnostics.errors_since(diag_mark).to_vec(),
            bad_data: self.ctx.bad_data,
        })
    }

    /// Populate every table for one source record and buffer the rows.
    /// Duplicate resolution happens as soon as the identity key is known,
    /// before anything from this record reaches the buffers.
    async fn process_record(
        &mut self,
        schemas: &ResolvedSchemas,
        identity_column: &str,
        record: &SourceRecord,
        staged: &HashSet<String>,
        seen: &mut HashSet<String>,
    ) -> Result<RecordStatus, ImportError> {
        let mut pass = PassRows::from_record(record);
        for set in self.source.auxiliary_sets() {
            if !self.source.has_auxiliary(&set.name) {
                pass.mark_optional(set.name);
            }
        }

        let env = PassEnv {
            store: self.store,
            source: self.source,
            fns: self.fns,
            volume: &self.volume,
        };

        let mut status = RecordStatus::Imported;
        let mut pending: Vec<(String, Row)> = Vec::new();

        for name in schemas.write_order() {
            let Some(schema) = schemas.schema_for(name) else {
                continue;
            };
            if matches!(schema.role, TableRole::PerTarget | TableRole::MultiRowPerSource) {
                continue;
            }

            let row = populate_table(&env, schema, &mut pass, self.ctx).await?;

            if schema.identity_column().is_some() {
                let identity = row
                    .get(identity_column)
                    .and_then(Value::as_text)
                    .map(str::to_string);
                let Some(identity) = identity else {
                    self.ctx.diagnostics.error(format!(
                        "Source record in volume {} has no identity key",
                        self.volume.id
                    ));
                    return Ok(RecordStatus::Skipped);
                };
                if !seen.insert(identity.clone()) {
                    warn!(identity = %identity, "Duplicate identity in batch, keeping later record");
                    purge_buffered(&mut self.buffers, identity_column, &identity);
                    status = RecordStatus::ReplacedBuffered;
                } else if staged.contains(&identity) {
                    warn!(identity = %identity, "Identity already staged, replacing");
                    delete_identity(
                        self.store,
                        Namespace::Staging,
                        schemas,
                        identity_column,
                        &identity,
                    )
                    .await?;
                    status = RecordStatus::ReplacedStaged;
                }
            }

            pending.push((schema.name.clone(), row));
        }

        for template in schemas.per_target_templates() {
            let set_names: Vec<String> = template
                .source_rows()
                .iter()
                .filter(|name| pass.has_sub_keyed(name))
                .map(|name| name.to_string())
                .collect();
            for set_name in set_names {
                let Some(targets) = pass.sub_keyed(&set_name).cloned() else {
                    continue;
                };
                for (target, row) in targets {
                    let concrete = schemas.resolve_target(template, &target);
                    pass.insert(set_name.clone(), row);
                    let populated = populate_table(&env, &concrete, &mut pass, self.ctx).await?;
                    self.instances
                        .entry(template.name.clone())
                        .or_default()
                        .insert(concrete.name.clone());
                    pending.push((concrete.name.clone(), populated));
                    self.concrete_schemas
                        .entry(concrete.name.clone())
                        .or_insert(concrete);
                }
                pass.remove(&set_name);
            }
        }

        for name in schemas.write_order() {
            let Some(schema) = schemas.schema_for(name) else {
                continue;
            };
            if !matches!(schema.role, TableRole::MultiRowPerSource) {
                continue;
            }
            for product in self.source.products_for(record) {
                for version in &product.versions {
                    pass.insert("product", product_row(&product, version));
                    let populated = populate_table(&env, schema, &mut pass, self.ctx).await?;
                    pending.push((schema.name.clone(), populated));
                }
            }
            pass.remove("product");
        }

        for (table, row) in pending {
            self.buffers.entry(table).or_default().push(row);
        }
        Ok(status)
    }

    /// Write buffered rows to staging in dependency order, creating tables
    /// lazily. Per-target tables only exist once a record referenced the
    /// target.
    async fn write_buffers(
        &mut self,
        schemas: &ResolvedSchemas,
    ) -> Result<(usize, usize), ImportError> {
        let mut rows_written = 0;
        let mut tables_written = 0;
        for name in schemas.write_order() {
            let concrete_names: Vec<String> = if name.contains('<') {
                self.instances
                    .get(name)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default()
            } else {
                vec![name.clone()]
            };
            for concrete in concrete_names {
                let Some(rows) = self.buffers.get(&concrete) else {
                    continue;
                };
                if rows.is_empty() {
                    continue;
                }
                let columns = match self.concrete_schemas.get(&concrete) {
                    Some(schema) => schema.create_columns(),
                    None => match schemas.schema_for(name) {
                        Some(schema) => schema.create_columns(),
                        None => continue,
                    },
                };
                self.store
                    .create_table(Namespace::Staging, &concrete, &columns)
                    .await?;
                rows_written += self
                    .store
                    .insert_rows(Namespace::Staging, &concrete, rows)
                    .await?;
                tables_written += 1;
            }
        }
        Ok((rows_written, tables_written))
    }
}

/// Synthesized metadata row a file-products table populates from, one per
/// (product, version). An empty version name means the current version.
fn product_row(product: &FileProduct, version: &ProductVersion) -> SourceRow {
    let version_name = if version.version_name.is_empty() {
        "Current".to_string()
    } else {
        version.version_name.clone()
    };
    SourceRow::from([
        ("category".to_string(), Value::from(product.category.clone())),
        ("sort_order".to_string(), Value::from(product.sort_rank.clone())),
        ("short_name".to_string(), Value::from(product.short_name.clone())),
        ("full_name".to_string(), Value::from(product.full_name.clone())),
        ("version_number".to_string(), Value::Int(version.version_number)),
        ("version_name".to_string(), Value::from(version_name)),
        ("logical_path".to_string(), Value::from(version.logical_path.clone())),
        ("url".to_string(), Value::from(version.url.clone())),
        ("checksum".to_string(), Value::from(version.checksum.clone())),
        ("size".to_string(), Value::Int(version.size)),
        ("width".to_string(), Value::from(version.width)),
        ("height".to_string(), Value::from(version.height)),
    ])
}
