//! In-memory table store
//!
//! Reference [`TableStore`] backend holding every table in a process-local
//! map. Used by the test suite and for dry-run imports; it implements the
//! full contract, including namespace isolation and keyed upserts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{ColumnSpec, Namespace, Row, StoreError, StoreResult, TableStore, Value};

#[derive(Debug, Default)]
struct StoredTable {
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
}

/// In-memory reference backend
#[derive(Default)]
pub struct MemoryStore {
    /// Tables keyed by (namespace, logical name), wrapped in a Mutex for
    /// thread safety
    tables: Mutex<HashMap<(Namespace, String), StoredTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<(Namespace, String), StoredTable>>> {
        self.tables
            .lock()
            .map_err(|e| StoreError::QueryFailed(format!("Lock error: {}", e)))
    }

    /// Normalize an incoming row to the table's column set: unknown columns
    /// are rejected, missing columns fill with null.
    fn conform_row(table: &str, columns: &[ColumnSpec], row: &Row) -> StoreResult<Row> {
        for name in row.keys() {
            if !columns.iter().any(|c| &c.name == name) {
                return Err(StoreError::ColumnNotFound {
                    table: table.to_string(),
                    column: name.clone(),
                });
            }
        }
        let mut out = Row::with_capacity(columns.len());
        for col in columns {
            let value = row.get(&col.name).cloned().unwrap_or(Value::Null);
            out.insert(col.name.clone(), value);
        }
        Ok(out)
    }

    fn project(row: &Row, columns: &[&str]) -> Row {
        if columns.is_empty() {
            return row.clone();
        }
        columns
            .iter()
            .map(|&name| {
                let value = row.get(name).cloned().unwrap_or(Value::Null);
                (name.to_string(), value)
            })
            .collect()
    }

    fn matches(row: &Row, filters: &[(&str, Value)]) -> bool {
        filters
            .iter()
            .all(|(column, value)| row.get(*column).map(|v| v == value).unwrap_or(value.is_null()))
    }
}

#[async_trait(?Send)]
impl TableStore for MemoryStore {
    async fn create_table(
        &self,
        ns: Namespace,
        table: &str,
        columns: &[ColumnSpec],
    ) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let key = (ns, table.to_string());
        if let Some(existing) = tables.get(&key) {
            let same: Vec<_> = existing.columns.iter().map(|c| &c.name).collect();
            let wanted: Vec<_> = columns.iter().map(|c| &c.name).collect();
            if same == wanted {
                debug!("create_table: {} already exists in {}, no-op", table, ns);
                return Ok(());
            }
            return Err(StoreError::SchemaMismatch(table.to_string()));
        }
        debug!("create_table: {} in {} ({} columns)", table, ns, columns.len());
        tables.insert(
            key,
            StoredTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, ns: Namespace, table: &str) -> StoreResult<()> {
        let mut tables = self.lock()?;
        if tables.remove(&(ns, table.to_string())).is_some() {
            debug!("drop_table: {} from {}", table, ns);
        }
        Ok(())
    }

    async fn table_exists(&self, ns: Namespace, table: &str) -> StoreResult<bool> {
        let tables = self.lock()?;
        Ok(tables.contains_key(&(ns, table.to_string())))
    }

    async fn table_names(&self, ns: Namespace, prefix: &str) -> StoreResult<Vec<String>> {
        let tables = self.lock()?;
        let mut names: Vec<String> = tables
            .keys()
            .filter(|(key_ns, name)| *key_ns == ns && name.starts_with(prefix))
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn insert_rows(&self, ns: Namespace, table: &str, rows: &[Row]) -> StoreResult<usize> {
        let mut tables = self.lock()?;
        let stored = tables
            .get_mut(&(ns, table.to_string()))
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let conformed: Vec<Row> = rows
            .iter()
            .map(|row| Self::conform_row(table, &stored.columns, row))
            .collect::<StoreResult<_>>()?;
        let count = conformed.len();
        stored.rows.extend(conformed);
        Ok(count)
    }

    async fn delete_rows_eq(
        &self,
        ns: Namespace,
        table: &str,
        column: &str,
        value: &Value,
    ) -> StoreResult<usize> {
        let mut tables = self.lock()?;
        let stored = tables
            .get_mut(&(ns, table.to_string()))
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        if !stored.columns.iter().any(|c| c.name == column) {
            return Err(StoreError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        let before = stored.rows.len();
        stored.rows.retain(|row| row.get(column) != Some(value));
        Ok(before - stored.rows.len())
    }

    async fn read_rows(
        &self,
        ns: Namespace,
        table: &str,
        columns: &[&str],
    ) -> StoreResult<Vec<Row>> {
        let tables = self.lock()?;
        let stored = tables
            .get(&(ns, table.to_string()))
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(stored.rows.iter().map(|row| Self::project(row, columns)).collect())
    }

    async fn upsert_rows(
        &self,
        ns: Namespace,
        table: &str,
        key_column: &str,
        rows: &[Row],
    ) -> StoreResult<usize> {
        let mut tables = self.lock()?;
        let stored = tables
            .get_mut(&(ns, table.to_string()))
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let mut written = 0;
        for row in rows {
            let key = row.get(key_column).cloned().ok_or_else(|| {
                StoreError::QueryFailed(format!(
                    "upsert into {} missing key column {}",
                    table, key_column
                ))
            })?;
            let conformed = Self::conform_row(table, &stored.columns, row)?;
            match stored
                .rows
                .iter_mut()
                .find(|existing| existing.get(key_column) == Some(&key))
            {
                Some(existing) => *existing = conformed,
                None => stored.rows.push(conformed),
            }
            written += 1;
        }
        Ok(written)
    }

    async fn select(
        &self,
        ns: Namespace,
        table: &str,
        columns: &[&str],
        filters: &[(&str, Value)],
    ) -> StoreResult<Vec<Row>> {
        let tables = self.lock()?;
        let stored = tables
            .get(&(ns, table.to_string()))
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(stored
            .rows
            .iter()
            .filter(|row| Self::matches(row, filters))
            .map(|row| Self::project(row, columns))
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnKind;

    fn obs_columns() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", ColumnKind::Integer).primary_key(),
            ColumnSpec::new("obs_id", ColumnKind::Text).not_null(),
            ColumnSpec::new("target", ColumnKind::Text),
        ]
    }

    fn row(id: i64, obs_id: &str, target: &str) -> Row {
        Row::from([
            ("id".to_string(), Value::Int(id)),
            ("obs_id".to_string(), Value::from(obs_id)),
            ("target".to_string(), Value::from(target)),
        ])
    }

    #[tokio::test]
    async fn test_create_insert_read() {
        let store = MemoryStore::new();
        store
            .create_table(Namespace::Staging, "obs_general", &obs_columns())
            .await
            .unwrap();
        let n = store
            .insert_rows(
                Namespace::Staging,
                "obs_general",
                &[row(0, "co-a", "SATURN"), row(1, "co-b", "TITAN")],
            )
            .await
            .unwrap();
        assert_eq!(n, 2);

        let rows = store
            .read_rows(Namespace::Staging, "obs_general", &["obs_id"])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0]["obs_id"], Value::from("co-a"));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryStore::new();
        store
            .create_table(Namespace::Staging, "obs_general", &obs_columns())
            .await
            .unwrap();
        assert!(store.table_exists(Namespace::Staging, "obs_general").await.unwrap());
        assert!(!store.table_exists(Namespace::Permanent, "obs_general").await.unwrap());
        assert_eq!(
            store.physical_name(Namespace::Staging, "obs_general"),
            "imp_obs_general"
        );
        assert_eq!(
            store.physical_name(Namespace::Permanent, "obs_general"),
            "obs_general"
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent_but_checks_columns() {
        let store = MemoryStore::new();
        store
            .create_table(Namespace::Staging, "obs_general", &obs_columns())
            .await
            .unwrap();
        store
            .create_table(Namespace::Staging, "obs_general", &obs_columns())
            .await
            .unwrap();
        let err = store
            .create_table(
                Namespace::Staging,
                "obs_general",
                &[ColumnSpec::new("other", ColumnKind::Text)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)));
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let store = MemoryStore::new();
        store
            .create_table(Namespace::Staging, "mult_obs_general_target", &obs_columns())
            .await
            .unwrap();
        store
            .upsert_rows(
                Namespace::Staging,
                "mult_obs_general_target",
                "id",
                &[row(0, "a", "x"), row(1, "b", "y")],
            )
            .await
            .unwrap();
        store
            .upsert_rows(
                Namespace::Staging,
                "mult_obs_general_target",
                "id",
                &[row(0, "a2", "x2")],
            )
            .await
            .unwrap();

        let rows = store
            .read_rows(Namespace::Staging, "mult_obs_general_target", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let replaced = rows
            .iter()
            .find(|r| r["id"] == Value::Int(0))
            .unwrap();
        assert_eq!(replaced["obs_id"], Value::from("a2"));
    }

    #[tokio::test]
    async fn test_delete_eq_and_select_filters() {
        let store = MemoryStore::new();
        store
            .create_table(Namespace::Staging, "obs_general", &obs_columns())
            .await
            .unwrap();
        store
            .insert_rows(
                Namespace::Staging,
                "obs_general",
                &[
                    row(0, "co-a", "SATURN"),
                    row(1, "co-a", "TITAN"),
                    row(2, "co-b", "TITAN"),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .select(
                Namespace::Staging,
                "obs_general",
                &["id"],
                &[("target", Value::from("TITAN"))],
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let deleted = store
            .delete_rows_eq(Namespace::Staging, "obs_general", "obs_id", &Value::from("co-a"))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        let left = store
            .read_rows(Namespace::Staging, "obs_general", &[])
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["obs_id"], Value::from("co-b"));
    }

    #[tokio::test]
    async fn test_unknown_column_rejected() {
        let store = MemoryStore::new();
        store
            .create_table(Namespace::Staging, "obs_general", &obs_columns())
            .await
            .unwrap();
        let mut bad = row(0, "co-a", "SATURN");
        bad.insert("bogus".to_string(), Value::Int(1));
        let err = store
            .insert_rows(Namespace::Staging, "obs_general", &[bad])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ColumnNotFound { .. }));
    }

    #[tokio::test]
    async fn test_table_names_by_prefix() {
        let store = MemoryStore::new();
        for name in ["obs_general", "obs_pds", "mult_obs_general_target"] {
            store
                .create_table(Namespace::Staging, name, &obs_columns())
                .await
                .unwrap();
        }
        let names = store.table_names(Namespace::Staging, "obs_").await.unwrap();
        assert_eq!(names, vec!["obs_general".to_string(), "obs_pds".to_string()]);
    }
}
