//! Schema registry and template resolution
//!
//! The registry holds raw table definitions, template placeholders and all.
//! [`SchemaRegistry::resolve`] is the separate template stage: it substitutes
//! `<INST>`/`<MISSION>` and drops tables not applicable to the volume's
//! instrument or mission, producing [`ResolvedSchemas`] whose names are
//! concrete (except `<TARGET>`, which stays in per-target templates until
//! the target set is known and [`ResolvedSchemas::resolve_target`] runs).
//!
//! `schema_for` returning `None` means "table not applicable, skip" and is
//! never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use super::order::{self, OrderError};
use super::{TableRole, TableSchema};

/// Error while loading schema definitions
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(String),
}

static TARGET_SANITIZER: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Make a target name safe for use inside a table name.
fn sanitize_target(target: &str) -> String {
    TARGET_SANITIZER
        .replace_all(&target.to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}

fn substitute(text: &str, instrument: &str, mission: &str) -> String {
    text.replace("<INST>", &instrument.to_lowercase())
        .replace("<MISSION>", &mission.to_lowercase())
}

/// Registry of raw table definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRegistry {
    tables: Vec<TableSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table definition (matched by raw name).
    pub fn insert(&mut self, schema: TableSchema) {
        if let Some(existing) = self.tables.iter_mut().find(|t| t.name == schema.name) {
            *existing = schema;
        } else {
            self.tables.push(schema);
        }
    }

    /// Raw (unresolved) definition by name, `None` when unknown.
    pub fn schema_for(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Load every `*.yaml`/`*.yml`/`*.json` file in a directory, one table
    /// definition per file. Files that fail to parse are logged and
    /// skipped; only I/O failures on the directory itself are errors.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let mut registry = Self::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| RegistryError::Io(format!("Failed to read {}: {}", dir.display(), e)))?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml") | Some("json")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to read schema file {}: {}", path.display(), e);
                    continue;
                }
            };
            let parsed = if path.extension().and_then(|e| e.to_str()) == Some("json") {
                serde_json::from_str::<TableSchema>(&content).map_err(|e| e.to_string())
            } else {
                serde_yaml::from_str::<TableSchema>(&content).map_err(|e| e.to_string())
            };
            match parsed {
                Ok(schema) => registry.insert(schema),
                Err(e) => {
                    warn!("Failed to parse schema file {}: {}", path.display(), e);
                }
            }
        }

        info!("Loaded {} table definitions from {}", registry.len(), dir.display());
        Ok(registry)
    }

    /// Template stage: produce concrete schemas for one volume.
    ///
    /// Substitutes `<INST>`/`<MISSION>` in table names and source row
    /// names, drops tables whose applicability excludes the given
    /// instrument/mission, and fixes the write order once.
    pub fn resolve(
        &self,
        instrument: &str,
        mission: &str,
    ) -> Result<ResolvedSchemas, OrderError> {
        let mut tables = Vec::new();
        for raw in &self.tables {
            if let Some(wanted) = &raw.instruments
                && !wanted.iter().any(|i| i == instrument)
            {
                continue;
            }
            if let Some(wanted) = &raw.missions
                && !wanted.iter().any(|m| m == mission)
            {
                continue;
            }
            let mut schema = raw.clone();
            schema.name = substitute(&schema.name, instrument, mission);
            for col in &mut schema.columns {
                match &mut col.source {
                    super::DataSource::Direct { row, .. }
                    | super::DataSource::Indexed { row, .. } => {
                        *row = substitute(row, instrument, mission);
                    }
                    _ => {}
                }
            }
            tables.push(schema);
        }

        let write_order = order::write_order(&tables)?;
        Ok(ResolvedSchemas {
            instrument: instrument.to_string(),
            mission: mission.to_string(),
            tables,
            write_order,
        })
    }
}

/// Concrete schema set for one volume, produced by the template stage.
#[derive(Debug, Clone)]
pub struct ResolvedSchemas {
    instrument: String,
    mission: String,
    tables: Vec<TableSchema>,
    write_order: Vec<String>,
}

impl ResolvedSchemas {
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn mission(&self) -> &str {
        &self.mission
    }

    /// Concrete definition by name, `None` meaning "skip this table".
    pub fn schema_for(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// The primary (identity-bearing) table, if the set declares one.
    pub fn primary(&self) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|t| matches!(t.role, TableRole::Primary { .. }))
    }

    /// Identity column shared by the fact tables.
    pub fn identity_column(&self) -> Option<&str> {
        self.primary().and_then(|t| t.identity_column())
    }

    pub fn per_target_templates(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables
            .iter()
            .filter(|t| matches!(t.role, TableRole::PerTarget))
    }

    /// Instantiate a per-target template for one concrete target name.
    pub fn resolve_target(&self, template: &TableSchema, target: &str) -> TableSchema {
        let safe = sanitize_target(target);
        let mut schema = template.clone();
        schema.name = schema.name.replace("<TARGET>", &safe);
        for col in &mut schema.columns {
            match &mut col.source {
                super::DataSource::Direct { row, .. } | super::DataSource::Indexed { row, .. } => {
                    *row = row.replace("<TARGET>", &safe);
                }
                _ => {}
            }
        }
        schema
    }

    /// Tables in dependency write order (per-target entries still carry
    /// their template name).
    pub fn write_order(&self) -> &[String] {
        &self.write_order
    }

    /// Reverse dependency order for deletes: primary last.
    pub fn delete_order(&self) -> Vec<String> {
        let mut order = self.write_order.clone();
        order.reverse();
        order
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }
}
