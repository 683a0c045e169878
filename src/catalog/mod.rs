//! Catalog source boundary
//!
//! The catalog source is the external collaborator that owns file parsing:
//! it yields pre-joined source records for a volume, answers auxiliary-set
//! lookups by identity key, and derives file-product metadata. The import
//! pipeline consumes the [`CatalogSource`] trait and never touches catalog
//! files itself.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::store::Row;

/// One named row supplied by the catalog (same shape as a stored row).
pub type SourceRow = Row;

/// Error from the external catalog source. All variants are fatal for the
/// current volume.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No catalog index applies to the volume
    #[error("No catalog index found for volume {0}")]
    MissingIndex(String),

    /// The index exists but cannot be read
    #[error("Catalog index unreadable: {0}")]
    UnreadableIndex(String),

    /// Any other collaborator failure
    #[error("Catalog source error: {0}")]
    Other(String),
}

/// One unit of import with its derived classifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub instrument: String,
    pub mission: String,
    /// Coarse product-category classifier derived from the identifier
    pub category: String,
}

impl Volume {
    pub fn new(
        id: impl Into<String>,
        instrument: impl Into<String>,
        mission: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instrument: instrument.into(),
            mission: mission.into(),
            category: category.into(),
        }
    }
}

/// Classification attached to a volume-identifier prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeClass {
    pub instrument: String,
    pub mission: String,
    #[serde(default)]
    pub category: String,
}

impl VolumeClass {
    pub fn new(instrument: impl Into<String>, mission: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            mission: mission.into(),
            category: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

/// Prefix registry mapping volume identifiers to their classifiers.
///
/// The prefix is everything before the first underscore. Identifiers with
/// no registered prefix classify through the fallback rule when one is
/// registered (ground-based catalogs in practice), otherwise they do not
/// classify at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeClassifier {
    prefixes: HashMap<String, VolumeClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fallback: Option<VolumeClass>,
}

impl VolumeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prefix: impl Into<String>, class: VolumeClass) {
        self.prefixes.insert(prefix.into(), class);
    }

    pub fn register_fallback(&mut self, class: VolumeClass) {
        self.fallback = Some(class);
    }

    pub fn classify(&self, volume_id: &str) -> Option<Volume> {
        let prefix = volume_id.split('_').next().unwrap_or(volume_id);
        let class = self.prefixes.get(prefix).or(self.fallback.as_ref())?;
        Some(Volume::new(
            volume_id,
            class.instrument.clone(),
            class.mission.clone(),
            class.category.clone(),
        ))
    }
}

/// How an auxiliary record set joins onto observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryKey {
    /// Joined per source record by the collaborator before records are
    /// yielded (supplemental-index style)
    SourceRecord,
    /// Looked up by identity key once the identity is computed
    Identity,
    /// Looked up by (identity key, sub-key); one row per sub-key
    IdentitySubKey,
}

/// Declaration of one auxiliary record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxiliarySet {
    /// Row name the set appears under in the pass row set
    pub name: String,
    pub keyed: AuxiliaryKey,
    /// Mandatory sets abort the volume when absent (strict mode)
    #[serde(default)]
    pub mandatory: bool,
}

impl AuxiliarySet {
    pub fn new(name: impl Into<String>, keyed: AuxiliaryKey) -> Self {
        Self {
            name: name.into(),
            keyed,
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// One observation record: the named rows the catalog pre-joined for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub rows: HashMap<String, SourceRow>,
}

impl SourceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(mut self, name: impl Into<String>, row: SourceRow) -> Self {
        self.rows.insert(name.into(), row);
        self
    }
}

/// One product version's file attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVersion {
    pub version_number: i64,
    /// Empty means the current version; the pipeline normalizes it
    #[serde(default)]
    pub version_name: String,
    pub logical_path: String,
    pub url: String,
    pub checksum: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

/// One derived product for a source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProduct {
    pub category: String,
    /// Pre-combined sort rank, category preference plus in-category order
    pub sort_rank: String,
    pub short_name: String,
    pub full_name: String,
    pub versions: Vec<ProductVersion>,
}

/// External catalog source for one volume
///
/// Implementations own all file parsing and join-key derivation. Lookup
/// methods return owned rows; the pipeline caches what it needs per pass.
pub trait CatalogSource: Send + Sync {
    /// The volume this source serves.
    fn volume(&self) -> &Volume;

    /// Ordered observation records. Fatal errors: no index, unreadable
    /// index.
    fn source_records(&self) -> Result<Vec<SourceRecord>, CatalogError>;

    /// Auxiliary sets this source knows about, mandatory flags included.
    fn auxiliary_sets(&self) -> Vec<AuxiliarySet>;

    /// Whether the volume carries the named set at all.
    fn has_auxiliary(&self, set: &str) -> bool;

    /// Identity-keyed lookup for a single-row set.
    fn auxiliary_row(&self, set: &str, key: &str) -> Option<SourceRow>;

    /// (identity, sub-key)-keyed lookup; sub-key order is deterministic.
    fn auxiliary_rows_by_sub_key(&self, set: &str, key: &str)
    -> Option<BTreeMap<String, SourceRow>>;

    /// Derived file products for one record.
    fn products_for(&self, record: &SourceRecord) -> Vec<FileProduct>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> VolumeClassifier {
        let mut classifier = VolumeClassifier::new();
        classifier.register("COISS", VolumeClass::new("COISS", "CASSINI").with_category("images"));
        classifier.register("GOSSI", VolumeClass::new("GOSSI", "GALILEO"));
        classifier
    }

    #[test]
    fn test_classify_by_prefix() {
        let volume = classifier().classify("COISS_2002").unwrap();
        assert_eq!(volume.instrument, "COISS");
        assert_eq!(volume.mission, "CASSINI");
        assert_eq!(volume.category, "images");
        assert_eq!(volume.id, "COISS_2002");
    }

    #[test]
    fn test_classify_unknown_without_fallback() {
        assert!(classifier().classify("EBROCC_0001").is_none());
    }

    #[test]
    fn test_classify_falls_back() {
        let mut classifier = classifier();
        classifier.register_fallback(VolumeClass::new("GB", "GROUND"));
        let volume = classifier.classify("EBROCC_0001").unwrap();
        assert_eq!(volume.instrument, "GB");
        assert_eq!(volume.mission, "GROUND");
    }

    #[test]
    fn test_auxiliary_set_builder() {
        let set = AuxiliarySet::new("supp_index", AuxiliaryKey::SourceRecord).mandatory();
        assert!(set.mandatory);
        assert_eq!(set.keyed, AuxiliaryKey::SourceRecord);
    }
}
