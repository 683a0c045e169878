//! Integration tests driving full volume imports against the in-memory store

use std::collections::{BTreeMap, HashMap};

use catalog_ingest::catalog::{
    AuxiliaryKey, AuxiliarySet, CatalogError, CatalogSource, FileProduct, ProductVersion,
    SourceRecord, SourceRow, Volume,
};
use catalog_ingest::import::{
    FieldFnRegistry, ImportError, ImportOptions, ImportSummary, RunContext, VolumeImporter,
    VolumeState, delete_volume, promote_volume,
};
use catalog_ingest::schema::{
    ColumnDescriptor, DataSource, DimensionSpec, FieldType, FlagStyle, SchemaRegistry, TableRole,
    TableSchema,
};
use catalog_ingest::store::{MemoryStore, Namespace, Row, TableStore, Value};

/// Catalog source scripted entirely from test data.
struct ScriptedSource {
    volume: Volume,
    records: Vec<SourceRecord>,
    ring_geo: HashMap<String, SourceRow>,
    surface_geo: HashMap<String, BTreeMap<String, SourceRow>>,
    products: HashMap<String, Vec<FileProduct>>,
    missing_mandatory: bool,
}

impl ScriptedSource {
    fn new(volume_id: &str) -> Self {
        Self {
            volume: Volume::new(volume_id, "COISS", "CO", "images"),
            records: Vec::new(),
            ring_geo: HashMap::new(),
            surface_geo: HashMap::new(),
            products: HashMap::new(),
            missing_mandatory: false,
        }
    }

    fn with_record(mut self, record: SourceRecord) -> Self {
        self.records.push(record);
        self
    }

    fn with_ring_geo(mut self, identity: &str, row: SourceRow) -> Self {
        self.ring_geo.insert(identity.to_string(), row);
        self
    }

    fn with_surface_geo(mut self, identity: &str, target: &str, row: SourceRow) -> Self {
        self.surface_geo
            .entry(identity.to_string())
            .or_default()
            .insert(target.to_string(), row);
        self
    }

    fn with_products(mut self, identity: &str, products: Vec<FileProduct>) -> Self {
        self.products.insert(identity.to_string(), products);
        self
    }

    /// Declare a mandatory auxiliary set the volume does not carry.
    fn with_missing_mandatory(mut self) -> Self {
        self.missing_mandatory = true;
        self
    }
}

impl CatalogSource for ScriptedSource {
    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn source_records(&self) -> Result<Vec<SourceRecord>, CatalogError> {
        Ok(self.records.clone())
    }

    fn auxiliary_sets(&self) -> Vec<AuxiliarySet> {
        let mut sets = vec![
            AuxiliarySet::new("ring_geo", AuxiliaryKey::Identity),
            AuxiliarySet::new("surface_geo", AuxiliaryKey::IdentitySubKey),
        ];
        if self.missing_mandatory {
            sets.push(AuxiliarySet::new("supp_index", AuxiliaryKey::SourceRecord).mandatory());
        }
        sets
    }

    fn has_auxiliary(&self, set: &str) -> bool {
        match set {
            "ring_geo" => !self.ring_geo.is_empty(),
            "surface_geo" => !self.surface_geo.is_empty(),
            _ => false,
        }
    }

    fn auxiliary_row(&self, set: &str, key: &str) -> Option<SourceRow> {
        if set == "ring_geo" {
            self.ring_geo.get(key).cloned()
        } else {
            None
        }
    }

    fn auxiliary_rows_by_sub_key(
        &self,
        set: &str,
        key: &str,
    ) -> Option<BTreeMap<String, SourceRow>> {
        if set == "surface_geo" {
            self.surface_geo.get(key).cloned()
        } else {
            None
        }
    }

    fn products_for(&self, record: &SourceRecord) -> Vec<FileProduct> {
        record
            .rows
            .get("index")
            .and_then(|row| row.get("OPUS_ID"))
            .and_then(Value::as_text)
            .and_then(|id| self.products.get(id))
            .cloned()
            .unwrap_or_default()
    }
}

fn direct(row: &str, field: &str) -> DataSource {
    DataSource::Direct {
        row: row.to_string(),
        field: field.to_string(),
    }
}

fn computed(function: &str) -> DataSource {
    DataSource::Computed {
        function: function.to_string(),
    }
}

fn char_col(name: &str, max_length: usize, source: DataSource) -> ColumnDescriptor {
    ColumnDescriptor::new(name, FieldType::Char { max_length }, source)
}

fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.insert(
        TableSchema::new(
            "obs_general",
            vec![
                ColumnDescriptor::new("id", FieldType::Uint, DataSource::SurrogateId).order(1),
                char_col("opus_id", 40, direct("index", "OPUS_ID"))
                    .order(2)
                    .not_null(),
                char_col("volume_id", 16, computed("volume_id")).order(3),
                char_col("target_name", 20, direct("index", "TARGET_NAME"))
                    .order(4)
                    .dimension(DimensionSpec::default()),
                ColumnDescriptor::new(
                    "camera_on",
                    FieldType::Flag(FlagStyle::OnOff),
                    direct("index", "CAMERA_ON"),
                )
                .order(5)
                .dimension(DimensionSpec::default()),
            ],
        )
        .with_role(TableRole::Primary {
            identity_column: "opus_id".to_string(),
        }),
    );
    registry.insert(TableSchema::new(
        "obs_pds",
        vec![
            char_col("opus_id", 40, direct("obs_general", "opus_id")).order(1),
            char_col("volume_id", 16, computed("volume_id")).order(2),
            ColumnDescriptor::new(
                "ring_radius",
                FieldType::Real,
                direct("ring_geo", "RING_RADIUS"),
            )
            .order(3)
            .sentinel(-1e32),
        ],
    ));
    registry.insert(
        TableSchema::new(
            "obs_surface_geometry__<TARGET>",
            vec![
                char_col("opus_id", 40, direct("obs_general", "opus_id")).order(1),
                char_col("volume_id", 16, computed("volume_id")).order(2),
                ColumnDescriptor::new(
                    "phase_angle",
                    FieldType::Real,
                    direct("surface_geo", "PHASE_ANGLE"),
                )
                .order(3)
                .bounds(0.0, 180.0),
            ],
        )
        .with_role(TableRole::PerTarget),
    );
    registry.insert(
        TableSchema::new(
            "obs_files",
            vec![
                char_col("opus_id", 40, direct("obs_general", "opus_id")).order(1),
                char_col("volume_id", 16, computed("volume_id")).order(2),
                char_col("short_name", 32, direct("product", "short_name")).order(3),
                char_col("version_name", 16, direct("product", "version_name")).order(4),
                char_col("logical_path", 120, direct("product", "logical_path")).order(5),
            ],
        )
        .with_role(TableRole::MultiRowPerSource),
    );
    registry
}

fn index_row(fields: &[(&str, Value)]) -> SourceRow {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn record(opus_id: &str, target: &str, camera: &str) -> SourceRecord {
    SourceRecord::new().with_row(
        "index",
        index_row(&[
            ("OPUS_ID", Value::from(opus_id)),
            ("TARGET_NAME", Value::from(target)),
            ("CAMERA_ON", Value::from(camera)),
        ]),
    )
}

fn raw_image_product() -> FileProduct {
    FileProduct {
        category: "Cassini ISS".to_string(),
        sort_rank: "010_010".to_string(),
        short_name: "coiss_raw".to_string(),
        full_name: "Raw Image".to_string(),
        versions: vec![
            ProductVersion {
                version_number: 2,
                version_name: String::new(),
                logical_path: "volumes/COISS_2002/data/N100.IMG".to_string(),
                url: "https://example.org/N100.IMG".to_string(),
                checksum: "aa11".to_string(),
                size: 2048,
                width: Some(1024),
                height: Some(1024),
            },
            ProductVersion {
                version_number: 1,
                version_name: "1.0".to_string(),
                logical_path: "volumes/COISS_2002_v1/data/N100.IMG".to_string(),
                url: "https://example.org/v1/N100.IMG".to_string(),
                checksum: "bb22".to_string(),
                size: 1024,
                width: Some(512),
                height: Some(512),
            },
        ],
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(Value::text_form)
}

fn row_for<'a>(rows: &'a [Row], column: &str, value: &str) -> &'a Row {
    rows.iter()
        .find(|r| text(r, column).as_deref() == Some(value))
        .unwrap_or_else(|| panic!("no row with {} = {}", column, value))
}

async fn import(
    store: &MemoryStore,
    source: &ScriptedSource,
    ctx: &mut RunContext,
) -> ImportSummary {
    let registry = registry();
    let fns = FieldFnRegistry::with_builtins();
    VolumeImporter::new(store, source, &registry, &fns, ctx)
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_volume_import_stages_every_table() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let source = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_record(record("co-iss-101", "TITAN", "off"))
        .with_ring_geo(
            "co-iss-100",
            index_row(&[("RING_RADIUS", Value::Real(117000.0))]),
        )
        .with_surface_geo(
            "co-iss-100",
            "SATURN",
            index_row(&[("PHASE_ANGLE", Value::Real(35.0))]),
        )
        .with_products("co-iss-100", vec![raw_image_product()]);

    let summary = import(&store, &source, &mut ctx).await;
    assert_eq!(summary.state, VolumeState::Written);
    assert_eq!(summary.source_records, 2);
    assert_eq!(summary.observations, 2);
    assert_eq!(summary.rows_written, 7);
    assert_eq!(summary.tables_written, 4);
    assert_eq!(summary.dimension_entries, 4);
    assert_eq!(summary.intra_batch_duplicates, 0);
    assert_eq!(summary.cross_batch_duplicates, 0);
    assert!(summary.diagnostics.is_empty());
    assert!(!summary.bad_data);

    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(general.len(), 2);
    let first = row_for(&general, "opus_id", "co-iss-100");
    assert_eq!(first["id"], Value::Int(0));
    assert_eq!(first["volume_id"], Value::from("COISS_2002"));
    assert_eq!(first["camera_on"], Value::from("On"));
    assert_eq!(first["mult_target_name"], Value::Int(0));
    let second = row_for(&general, "opus_id", "co-iss-101");
    assert_eq!(second["id"], Value::Int(1));
    assert_eq!(second["mult_target_name"], Value::Int(1));

    // the identity-keyed auxiliary row only exists for the first record
    let pds = store
        .read_rows(Namespace::Staging, "obs_pds", &[])
        .await
        .unwrap();
    assert_eq!(pds.len(), 2);
    assert_eq!(
        row_for(&pds, "opus_id", "co-iss-100")["ring_radius"],
        Value::Real(117000.0)
    );
    assert_eq!(row_for(&pds, "opus_id", "co-iss-101")["ring_radius"], Value::Null);

    // per-target tables exist only for targets that actually appeared
    let target_tables = store
        .table_names(Namespace::Staging, "obs_surface_geometry__")
        .await
        .unwrap();
    assert_eq!(target_tables, vec!["obs_surface_geometry__saturn".to_string()]);
    let geo = store
        .read_rows(Namespace::Staging, "obs_surface_geometry__saturn", &[])
        .await
        .unwrap();
    assert_eq!(geo.len(), 1);
    assert_eq!(geo[0]["phase_angle"], Value::Real(35.0));

    // one file row per (product, version), current version name normalized
    let files = store
        .read_rows(Namespace::Staging, "obs_files", &[])
        .await
        .unwrap();
    assert_eq!(files.len(), 2);
    let mut versions: Vec<String> = files
        .iter()
        .filter_map(|r| text(r, "version_name"))
        .collect();
    versions.sort();
    assert_eq!(versions, vec!["1.0".to_string(), "Current".to_string()]);

    // flag dimension sorts the truthy entry first
    let mut camera = store
        .read_rows(Namespace::Staging, "mult_obs_general_camera_on", &[])
        .await
        .unwrap();
    camera.sort_by_key(|r| r.get("disp_order").and_then(Value::as_int));
    let ordered: Vec<(Option<String>, Option<i64>)> = camera
        .iter()
        .map(|r| (text(r, "value"), r.get("disp_order").and_then(Value::as_int)))
        .collect();
    assert_eq!(
        ordered,
        vec![
            (Some("On".to_string()), Some(10)),
            (Some("Off".to_string()), Some(20)),
        ]
    );
}

#[tokio::test]
async fn test_intra_batch_duplicate_keeps_later_record() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let source = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_record(record("co-iss-100", "TITAN", "off"))
        .with_record(record("co-iss-101", "RHEA", "on"));

    let summary = import(&store, &source, &mut ctx).await;
    assert_eq!(summary.source_records, 3);
    assert_eq!(summary.intra_batch_duplicates, 1);
    assert_eq!(summary.observations, 2);

    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(general.len(), 2);
    assert_eq!(
        row_for(&general, "opus_id", "co-iss-100")["target_name"],
        Value::from("TITAN")
    );

    // dependent rows of the replaced record were purged too
    let pds = store
        .read_rows(Namespace::Staging, "obs_pds", &[])
        .await
        .unwrap();
    assert_eq!(pds.len(), 2);
}

#[tokio::test]
async fn test_cross_batch_duplicate_replaces_staged_rows() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let first = ScriptedSource::new("COISS_2002").with_record(record("co-iss-100", "SATURN", "on"));
    let summary = import(&store, &first, &mut ctx).await;
    assert_eq!(summary.cross_batch_duplicates, 0);

    let second = ScriptedSource::new("COISS_2003").with_record(record("co-iss-100", "RHEA", "off"));
    let summary = import(&store, &second, &mut ctx).await;
    assert_eq!(summary.cross_batch_duplicates, 1);

    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(general.len(), 1);
    assert_eq!(general[0]["volume_id"], Value::from("COISS_2003"));
    assert_eq!(general[0]["target_name"], Value::from("RHEA"));
}

#[tokio::test]
async fn test_duplicate_checking_can_be_disabled() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions {
        check_duplicates: false,
        ..Default::default()
    });
    let first = ScriptedSource::new("COISS_2002").with_record(record("co-iss-100", "SATURN", "on"));
    import(&store, &first, &mut ctx).await;

    let second = ScriptedSource::new("COISS_2003").with_record(record("co-iss-100", "RHEA", "off"));
    let summary = import(&store, &second, &mut ctx).await;
    assert_eq!(summary.cross_batch_duplicates, 0);

    // both copies remain staged; resolving them is the caller's problem
    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(general.len(), 2);
}

#[tokio::test]
async fn test_reimport_cleans_its_own_rows_first() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let source = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_record(record("co-iss-101", "TITAN", "off"));

    import(&store, &source, &mut ctx).await;
    let summary = import(&store, &source, &mut ctx).await;

    // the volume's own staged rows never count as duplicates
    assert_eq!(summary.cross_batch_duplicates, 0);
    assert_eq!(summary.observations, 2);
    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(general.len(), 2);
}

#[tokio::test]
async fn test_record_without_identity_is_skipped() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let source = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_record(SourceRecord::new().with_row(
            "index",
            index_row(&[("TARGET_NAME", Value::from("TITAN"))]),
        ));

    let summary = import(&store, &source, &mut ctx).await;
    assert_eq!(summary.skipped_records, 1);
    assert_eq!(summary.observations, 1);
    assert!(!summary.diagnostics.is_empty());

    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(general.len(), 1);
}

#[tokio::test]
async fn test_sentinel_value_is_nulled_and_reported() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let source = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_ring_geo("co-iss-100", index_row(&[("RING_RADIUS", Value::Real(-1e32))]));

    let summary = import(&store, &source, &mut ctx).await;
    assert_eq!(summary.observations, 1);
    assert_eq!(summary.diagnostics.len(), 1);
    assert!(summary.diagnostics[0].contains("sentinel"));

    let pds = store
        .read_rows(Namespace::Staging, "obs_pds", &[])
        .await
        .unwrap();
    assert_eq!(pds[0]["ring_radius"], Value::Null);
}

#[tokio::test]
async fn test_missing_mandatory_auxiliary_set() {
    let store = MemoryStore::new();
    let registry = registry();
    let fns = FieldFnRegistry::with_builtins();
    let source = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_missing_mandatory();

    // strict mode aborts the volume
    let mut ctx = RunContext::new(ImportOptions::default());
    let err = VolumeImporter::new(&store, &source, &registry, &fns, &mut ctx)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::MissingAuxiliary { .. }));

    // permissive mode imports anyway and flags the volume
    let mut ctx = RunContext::new(ImportOptions {
        permissive: true,
        ..Default::default()
    });
    let summary = import(&store, &source, &mut ctx).await;
    assert_eq!(summary.state, VolumeState::Written);
    assert!(summary.bad_data);
    assert_eq!(summary.diagnostics.len(), 1);
    assert_eq!(summary.observations, 1);
}

#[tokio::test]
async fn test_promotion_copies_and_replaces() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());
    let registry = registry();
    let schemas = registry.resolve("COISS", "CO").unwrap();

    let first = ScriptedSource::new("COISS_2002")
        .with_record(record("co-iss-100", "SATURN", "on"))
        .with_record(record("co-iss-101", "TITAN", "off"))
        .with_surface_geo(
            "co-iss-100",
            "SATURN",
            index_row(&[("PHASE_ANGLE", Value::Real(35.0))]),
        )
        .with_products("co-iss-100", vec![raw_image_product()]);
    import(&store, &first, &mut ctx).await;

    let summary = promote_volume(&store, &schemas, "COISS_2002").await.unwrap();
    assert_eq!(summary.state, VolumeState::Promoted);
    assert_eq!(summary.rows_copied, 7);
    assert_eq!(summary.duplicates_removed, 0);
    assert_eq!(summary.dimension_rows, 4);

    let permanent = store
        .read_rows(Namespace::Permanent, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(permanent.len(), 2);
    let camera = store
        .read_rows(Namespace::Permanent, "mult_obs_general_camera_on", &[])
        .await
        .unwrap();
    assert_eq!(camera.len(), 2);

    // a later volume re-observes co-iss-100; promotion replaces the old copy
    let second = ScriptedSource::new("COISS_2003").with_record(record("co-iss-100", "RHEA", "off"));
    import(&store, &second, &mut ctx).await;
    let summary = promote_volume(&store, &schemas, "COISS_2003").await.unwrap();
    // obs_general, obs_pds, the saturn geometry row and two file rows
    assert_eq!(summary.duplicates_removed, 5);

    let permanent = store
        .read_rows(Namespace::Permanent, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(permanent.len(), 2);
    let replaced = row_for(&permanent, "opus_id", "co-iss-100");
    assert_eq!(replaced["volume_id"], Value::from("COISS_2003"));
    assert_eq!(replaced["target_name"], Value::from("RHEA"));
    let geo = store
        .read_rows(Namespace::Permanent, "obs_surface_geometry__saturn", &[])
        .await
        .unwrap();
    assert!(geo.is_empty());

    // clearing staging afterwards is a separate, explicit step
    let removed = delete_volume(&store, Namespace::Staging, &schemas, "COISS_2003")
        .await
        .unwrap();
    assert!(removed > 0);
    let staged = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert!(staged.iter().all(|r| text(r, "volume_id").as_deref() != Some("COISS_2003")));
}

#[tokio::test]
async fn test_dimension_ids_stay_stable_across_volumes() {
    let store = MemoryStore::new();
    let mut ctx = RunContext::new(ImportOptions::default());

    let first = ScriptedSource::new("COISS_2002").with_record(record("co-iss-100", "SATURN", "on"));
    import(&store, &first, &mut ctx).await;

    let second = ScriptedSource::new("COISS_2003")
        .with_record(record("co-iss-200", "TITAN", "on"))
        .with_record(record("co-iss-201", "SATURN", "off"));
    import(&store, &second, &mut ctx).await;

    let targets = store
        .read_rows(Namespace::Staging, "mult_obs_general_target_name", &[])
        .await
        .unwrap();
    assert_eq!(targets.len(), 2);
    let saturn = row_for(&targets, "value", "SATURN");
    // SATURN keeps the id the first volume assigned
    assert_eq!(saturn["id"], Value::Int(0));
    let titan = row_for(&targets, "value", "TITAN");
    assert_eq!(titan["id"], Value::Int(1));

    let general = store
        .read_rows(Namespace::Staging, "obs_general", &[])
        .await
        .unwrap();
    assert_eq!(
        row_for(&general, "opus_id", "co-iss-201")["mult_target_name"],
        Value::Int(0)
    );
}
