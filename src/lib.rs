//! Catalog Ingest - Shared library for loading observation catalog volumes
//!
//! Provides unified interfaces for:
//! - Tabular storage backends (via the `TableStore` trait)
//! - Schema-driven table population and validation
//! - Dimension (lookup) table registration and display ordering
//! - Duplicate resolution across and within import batches
//! - Volume staging and promotion to the permanent namespace
//!
//! An import run walks a [`catalog::CatalogSource`] through the staging
//! namespace: a [`import::VolumeImporter`] populates every table the
//! resolved schema set declares, registers dimension values as it goes,
//! and [`import::promote_volume`] later copies the staged rows into the
//! permanent namespace, replacing older copies of the same observations.

pub mod catalog;
pub mod import;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use store::memory::MemoryStore;
pub use store::{
    ColumnKind, ColumnSpec, Namespace, Row, StoreError, StoreResult, TableStore, Value,
};

pub use schema::registry::{ResolvedSchemas, SchemaRegistry};
pub use schema::{
    BoundsPolicy, ColumnDescriptor, DataSource, DimensionSeed, DimensionSpec, FieldType, FlagStyle,
    TableRole, TableSchema,
};

pub use catalog::{
    AuxiliaryKey, AuxiliarySet, CatalogError, CatalogSource, FileProduct, ProductVersion,
    SourceRecord, SourceRow, Volume,
};

pub use import::{
    ComputedValue, Diagnostics, FieldFnInput, FieldFnRegistry, ImportError, ImportOptions,
    ImportSummary, PromotionSummary, RunContext, VOLUME_ID_COLUMN, VolumeImporter, VolumeState,
    delete_volume, promote_volume,
};
