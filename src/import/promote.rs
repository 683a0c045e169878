//! Promotion from staging to permanent
//!
//! Copies one staged volume's fact rows into the permanent namespace,
//! replacing any permanent rows that share an identity key, and merges
//! every staged dimension table by id. Staging is left untouched; clearing
//! it is a separate operation (see [`super::dedup::delete_volume`]).

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::schema::registry::ResolvedSchemas;
use crate::store::{Namespace, TableStore, Value};

use super::dedup::{delete_identity, expand_tables};
use super::dimensions::dimension_columns;
use super::volume::VolumeState;
use super::{ImportError, VOLUME_ID_COLUMN};

/// Outcome of promoting one volume.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionSummary {
    pub volume_id: String,
    pub state: VolumeState,
    pub rows_copied: usize,
    pub tables_touched: usize,
    pub dimension_rows: usize,
    /// Permanent rows replaced because a staged row shared their identity
    pub duplicates_removed: usize,
}

/// Promote one staged volume into the permanent namespace.
///
/// Permanent duplicates are removed first (children before primary), then
/// fact rows copy over in dependency order, then dimension tables merge by
/// id so permanent entries update in place.
pub async fn promote_volume<S: TableStore + ?Sized>(
    store: &S,
    schemas: &ResolvedSchemas,
    volume_id: &str,
) -> Result<PromotionSummary, ImportError> {
    let identity_column = schemas
        .identity_column()
        .ok_or(ImportError::NoPrimaryTable)?;
    let primary = schemas.primary().ok_or(ImportError::NoPrimaryTable)?;

    let staged_ids: HashSet<String> =
        if store.table_exists(Namespace::Staging, &primary.name).await? {
            store
                .select(
                    Namespace::Staging,
                    &primary.name,
                    &[identity_column],
                    &[(VOLUME_ID_COLUMN, Value::from(volume_id))],
                )
                .await?
                .iter()
                .filter_map(|row| row.get(identity_column).and_then(Value::text_form))
                .collect()
        } else {
            HashSet::new()
        };

    let mut duplicates_removed = 0;
    if store.table_exists(Namespace::Permanent, &primary.name).await? {
        let existing: HashSet<String> = store
            .read_rows(Namespace::Permanent, &primary.name, &[identity_column])
            .await?
            .iter()
            .filter_map(|row| row.get(identity_column).and_then(Value::text_form))
            .collect();
        let mut duplicates: Vec<&String> = staged_ids.intersection(&existing).collect();
        duplicates.sort();
        for identity in duplicates {
            duplicates_removed +=
                delete_identity(store, Namespace::Permanent, schemas, identity_column, identity)
                    .await?;
        }
    }

    let mut rows_copied = 0;
    let mut tables_touched = 0;
    for name in schemas.write_order() {
        let Some(schema) = schemas.schema_for(name) else {
            continue;
        };
        if !schema.columns.iter().any(|c| c.name == VOLUME_ID_COLUMN) {
            debug!(table = %name, "Table has no volume column, not promoted");
            continue;
        }
        for table in expand_tables(store, Namespace::Staging, name).await? {
            let rows = store
                .select(
                    Namespace::Staging,
                    &table,
                    &[],
                    &[(VOLUME_ID_COLUMN, Value::from(volume_id))],
                )
                .await?;
            if rows.is_empty() {
                continue;
            }
            store
                .create_table(Namespace::Permanent, &table, &schema.create_columns())
                .await?;
            rows_copied += store.insert_rows(Namespace::Permanent, &table, &rows).await?;
            tables_touched += 1;
        }
    }

    // dimension tables are shared state: merge every staged one wholesale
    let mut dimension_rows = 0;
    for table in store.table_names(Namespace::Staging, "mult_").await? {
        let rows = store.read_rows(Namespace::Staging, &table, &[]).await?;
        if rows.is_empty() {
            continue;
        }
        let grouped = rows[0].contains_key("grouping");
        store
            .create_table(Namespace::Permanent, &table, &dimension_columns(grouped))
            .await?;
        dimension_rows += store
            .upsert_rows(Namespace::Permanent, &table, "id", &rows)
            .await?;
        tables_touched += 1;
    }

    info!(
        volume_id,
        rows_copied, dimension_rows, duplicates_removed, "Volume promoted"
    );

    Ok(PromotionSummary {
        volume_id: volume_id.to_string(),
        state: VolumeState::Promoted,
        rows_copied,
        tables_touched,
        dimension_rows,
        duplicates_removed,
    })
}
