//! Computed-field callback registry
//!
//! Schema columns whose source is a named function resolve through this
//! registry. Lookup is scoped: an instrument-specific registration wins over
//! a mission-specific one, which wins over a generic one, so a mission can
//! override how a field is derived without touching the shared schemas.

use std::collections::HashMap;

use crate::catalog::Volume;
use crate::store::Value;

use super::populate::PassRows;

/// Everything a field callback may consult while deriving a value.
pub struct FieldFnInput<'a> {
    /// Volume being imported.
    pub volume: &'a Volume,
    /// All metadata rows gathered for the current source record, including
    /// the partially populated target rows of tables already processed.
    pub rows: &'a PassRows,
}

/// Result of a field callback.
pub enum ComputedValue {
    /// A plain value; dimension labels (if any) are derived from it.
    Value(Value),
    /// A value plus an explicit dimension label overriding the derived one.
    WithLabel(Value, String),
}

impl ComputedValue {
    pub fn null() -> Self {
        ComputedValue::Value(Value::Null)
    }
}

impl From<Value> for ComputedValue {
    fn from(value: Value) -> Self {
        ComputedValue::Value(value)
    }
}

pub type FieldFn = Box<dyn Fn(&FieldFnInput<'_>) -> ComputedValue + Send + Sync>;

/// Parses one raw dimension value into a numeric rank for sorting.
pub type RankParser = Box<dyn Fn(&str) -> Option<f64> + Send + Sync>;

/// Typed registry of field callbacks and dimension rank parsers.
///
/// Owned by the orchestrator, separate from the mutable run context, so
/// callbacks can be consulted while the context is being updated.
#[derive(Default)]
pub struct FieldFnRegistry {
    generic: HashMap<String, FieldFn>,
    by_mission: HashMap<(String, String), FieldFn>,
    by_instrument: HashMap<(String, String), FieldFn>,
    rank_parsers: HashMap<String, RankParser>,
}

impl FieldFnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the volume-identity callbacks every schema
    /// set uses: `volume_id`, `instrument_id` and `mission_id` echo the
    /// corresponding fields of the volume under import.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("volume_id", |input| {
            ComputedValue::Value(Value::from(input.volume.id.clone()))
        });
        registry.register("instrument_id", |input| {
            ComputedValue::Value(Value::from(input.volume.instrument.clone()))
        });
        registry.register("mission_id", |input| {
            ComputedValue::Value(Value::from(input.volume.mission.clone()))
        });
        registry
    }

    /// Register a callback available to every volume.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&FieldFnInput<'_>) -> ComputedValue + Send + Sync + 'static,
    {
        self.generic.insert(name.to_string(), Box::new(f));
    }

    /// Register a callback that only applies to volumes of one mission.
    pub fn register_for_mission<F>(&mut self, mission: &str, name: &str, f: F)
    where
        F: Fn(&FieldFnInput<'_>) -> ComputedValue + Send + Sync + 'static,
    {
        self.by_mission
            .insert((mission.to_string(), name.to_string()), Box::new(f));
    }

    /// Register a callback that only applies to volumes of one instrument.
    pub fn register_for_instrument<F>(&mut self, instrument: &str, name: &str, f: F)
    where
        F: Fn(&FieldFnInput<'_>) -> ComputedValue + Send + Sync + 'static,
    {
        self.by_instrument
            .insert((instrument.to_string(), name.to_string()), Box::new(f));
    }

    /// Resolve a callback for the given volume: instrument-specific first,
    /// then mission-specific, then generic.
    pub fn lookup(&self, volume: &Volume, name: &str) -> Option<&FieldFn> {
        if let Some(f) = self
            .by_instrument
            .get(&(volume.instrument.clone(), name.to_string()))
        {
            return Some(f);
        }
        if let Some(f) = self
            .by_mission
            .get(&(volume.mission.clone(), name.to_string()))
        {
            return Some(f);
        }
        self.generic.get(name)
    }

    /// Register a rank parser used to sort a range-valued dimension table.
    pub fn register_rank_parser<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&str) -> Option<f64> + Send + Sync + 'static,
    {
        self.rank_parsers.insert(name.to_string(), Box::new(f));
    }

    pub fn rank_parser(&self, name: &str) -> Option<&RankParser> {
        self.rank_parsers.get(name)
    }
}
