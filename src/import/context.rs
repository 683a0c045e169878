//! Run context: options, surrogate-id counters, and per-run state
//!
//! All state that the old batch scripts kept in globals lives here and is
//! passed explicitly, so two runs never share anything by accident.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::store::{Namespace, StoreResult, TableStore, Value};

use super::diagnostics::Diagnostics;
use super::dimensions::DimensionCache;

fn default_true() -> bool {
    true
}

/// Tunable behavior for one import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    /// Detect and resolve duplicates against already staged data. Turning
    /// this off skips the staged-identity scan for bulk initial loads.
    #[serde(default = "default_true")]
    pub check_duplicates: bool,
    /// Downgrade missing mandatory auxiliary sets from fatal to reportable.
    #[serde(default)]
    pub permissive: bool,
    /// Log new dimension entries at debug instead of info.
    #[serde(default)]
    pub quiet_dimensions: bool,
    /// Grouping assignments for grouped dimension values; values not listed
    /// here fall into the "OTHER" group.
    #[serde(default)]
    pub value_groups: HashMap<String, String>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            check_duplicates: true,
            permissive: false,
            quiet_dimensions: false,
            value_groups: HashMap::new(),
        }
    }
}

impl ImportOptions {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// Next-id counters for store-assigned surrogate keys.
///
/// Counters are seeded lazily from the maximum existing id across both
/// namespaces, then persist for the rest of the run, so ids stay unique
/// even across volumes that touch the same table.
#[derive(Debug, Default)]
pub struct SurrogateIds {
    counters: HashMap<String, i64>,
}

impl SurrogateIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next surrogate id for `table`.
    pub async fn next_id<S: TableStore + ?Sized>(
        &mut self,
        store: &S,
        table: &str,
    ) -> StoreResult<i64> {
        if let Some(counter) = self.counters.get_mut(table) {
            let id = *counter;
            *counter += 1;
            return Ok(id);
        }

        let mut max_id: i64 = -1;
        for ns in [Namespace::Staging, Namespace::Permanent] {
            if store.table_exists(ns, table).await? {
                for row in store.read_rows(ns, table, &["id"]).await? {
                    if let Some(id) = row.get("id").and_then(Value::as_int) {
                        max_id = max_id.max(id);
                    }
                }
            }
        }

        self.counters.insert(table.to_string(), max_id + 2);
        Ok(max_id + 1)
    }
}

/// Mutable state threaded through one import run.
pub struct RunContext {
    pub run_id: Uuid,
    pub started: DateTime<Utc>,
    pub options: ImportOptions,
    pub diagnostics: Diagnostics,
    pub dimensions: DimensionCache,
    pub surrogates: SurrogateIds,
    /// Set when any volume this run was imported despite known problems.
    /// Sticky for the whole run; callers gate promotion on it.
    pub bad_data: bool,
}

impl RunContext {
    pub fn new(options: ImportOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started: Utc::now(),
            options,
            diagnostics: Diagnostics::new(),
            dimensions: DimensionCache::new(),
            surrogates: SurrogateIds::new(),
            bad_data: false,
        }
    }

    /// Reset per-volume state. Dimension caches are rebuilt for each volume;
    /// surrogate-id counters persist for the whole run.
    pub fn begin_volume(&mut self, volume_id: &str) {
        self.dimensions.reset();
        info!(run_id = %self.run_id, volume_id, "Starting volume import");
    }
}
