//! Duplicate resolution and volume-scoped deletes
//!
//! Duplicates resolve by identity key in three places: within one batch
//! (the later row wins and earlier buffered rows are purged), against
//! earlier staged volumes (staged rows are deleted before the new row is
//! buffered), and at promotion (permanent rows lose to the staged
//! replacement). All store deletes run in reverse dependency order so the
//! primary row disappears last and an interrupted delete never strands
//! child rows without a parent.

use std::collections::{BTreeMap, HashSet};

use tracing::info;

use crate::schema::registry::ResolvedSchemas;
use crate::store::{Namespace, Row, StoreResult, TableStore, Value};

use super::VOLUME_ID_COLUMN;

/// Remove every buffered row carrying `identity`, across all table buffers.
/// Rows without the identity column are untouched.
pub(crate) fn purge_buffered(
    buffers: &mut BTreeMap<String, Vec<Row>>,
    identity_column: &str,
    identity: &str,
) -> usize {
    let mut removed = 0;
    for rows in buffers.values_mut() {
        let before = rows.len();
        rows.retain(|row| row.get(identity_column).and_then(Value::as_text) != Some(identity));
        removed += before - rows.len();
    }
    removed
}

/// Identity keys already staged for the primary table, read once per volume.
pub(crate) async fn read_staged_identities<S: TableStore + ?Sized>(
    store: &S,
    primary_table: &str,
    identity_column: &str,
) -> StoreResult<HashSet<String>> {
    if !store.table_exists(Namespace::Staging, primary_table).await? {
        return Ok(HashSet::new());
    }
    let rows = store
        .read_rows(Namespace::Staging, primary_table, &[identity_column])
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get(identity_column).and_then(Value::text_form))
        .collect())
}

/// Expand a possibly templated table name to the concrete tables present in
/// the namespace. Plain names yield themselves (when present); templated
/// names yield every table sharing the prefix before the placeholder.
pub(crate) async fn expand_tables<S: TableStore + ?Sized>(
    store: &S,
    ns: Namespace,
    name: &str,
) -> StoreResult<Vec<String>> {
    if name.contains('<') {
        let prefix = name.split('<').next().unwrap_or(name);
        store.table_names(ns, prefix).await
    } else if store.table_exists(ns, name).await? {
        Ok(vec![name.to_string()])
    } else {
        Ok(Vec::new())
    }
}

/// Delete one identity from every table that carries the identity column,
/// children first, primary last.
pub(crate) async fn delete_identity<S: TableStore + ?Sized>(
    store: &S,
    ns: Namespace,
    schemas: &ResolvedSchemas,
    identity_column: &str,
    identity: &str,
) -> StoreResult<usize> {
    let mut deleted = 0;
    for name in schemas.delete_order() {
        let Some(schema) = schemas.schema_for(&name) else {
            continue;
        };
        if !schema.columns.iter().any(|c| c.name == identity_column) {
            continue;
        }
        for table in expand_tables(store, ns, &name).await? {
            deleted += store
                .delete_rows_eq(ns, &table, identity_column, &Value::from(identity))
                .await?;
        }
    }
    Ok(deleted)
}

/// Delete every row of one volume from a namespace, children before the
/// primary table. Re-importing a volume calls this first so a partial
/// earlier pass leaves nothing behind.
///
/// # Returns
/// Number of rows removed.
pub async fn delete_volume<S: TableStore + ?Sized>(
    store: &S,
    ns: Namespace,
    schemas: &ResolvedSchemas,
    volume_id: &str,
) -> StoreResult<usize> {
    let mut deleted = 0;
    for name in schemas.delete_order() {
        let Some(schema) = schemas.schema_for(&name) else {
            continue;
        };
        if !schema.columns.iter().any(|c| c.name == VOLUME_ID_COLUMN) {
            continue;
        }
        for table in expand_tables(store, ns, &name).await? {
            deleted += store
                .delete_rows_eq(ns, &table, VOLUME_ID_COLUMN, &Value::from(volume_id))
                .await?;
        }
    }
    if deleted > 0 {
        info!(volume_id, namespace = %ns, rows = deleted, "Deleted volume rows");
    }
    Ok(deleted)
}
