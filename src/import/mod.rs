//! Observation import pipeline
//!
//! Drives catalog records through staging: schema-driven field population
//! ([`populate`]), dimension registration and flushing ([`dimensions`]),
//! three-way duplicate resolution ([`dedup`]), the per-volume lifecycle
//! ([`volume`]) and promotion to the permanent namespace ([`promote`]).
//!
//! Recoverable problems never abort a volume; they become deduplicated
//! [`Diagnostics`] entries and the offending value turns null. Only store
//! failures, unreadable indexes, missing mandatory auxiliary sets (in
//! strict mode) and schema-set defects surface as [`ImportError`].

pub mod context;
pub mod dedup;
pub mod diagnostics;
pub mod dimensions;
pub mod functions;
pub mod populate;
pub mod promote;
pub mod volume;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::schema::order::OrderError;
use crate::store::StoreError;

pub use context::{ImportOptions, RunContext, SurrogateIds};
pub use dedup::delete_volume;
pub use diagnostics::Diagnostics;
pub use dimensions::{DimensionCache, DimensionEntry, DimensionTableId};
pub use functions::{ComputedValue, FieldFnInput, FieldFnRegistry};
pub use populate::PassRows;
pub use promote::{PromotionSummary, promote_volume};
pub use volume::{ImportSummary, VolumeImporter, VolumeState};

/// Column every per-volume fact table carries. Promotion and volume
/// deletion filter on it.
pub const VOLUME_ID_COLUMN: &str = "volume_id";

/// Fatal import failures. Anything recoverable is a diagnostic instead.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] CatalogError),

    /// Strict mode only; permissive runs demote this to a diagnostic
    #[error("Volume {volume} is missing mandatory auxiliary set '{set}'")]
    MissingAuxiliary { set: String, volume: String },

    #[error(transparent)]
    Order(#[from] OrderError),

    /// The resolved schema set has no primary table to key duplicates on
    #[error("Schema set has no primary table")]
    NoPrimaryTable,
}
