//! End-to-end pipeline scenarios: in-memory sources through render, sort,
//! group, encode, and MBTiles, verified by reading the archive back.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use rusqlite::Connection;

use tileforge::config::{Arguments, PipelineConfig};
use tileforge::feature::{
    ElementKind, FeatureCollector, FieldValue, RawGeometry, SourceFeature,
};
use tileforge::pipeline::PipelineEngine;
use tileforge::profile::Profile;
use tileforge::sources::{SourceReader, VecReader};

fn test_config(dir: &Path) -> PipelineConfig {
    let output = dir.join("out.mbtiles");
    let tmp = dir.join("tmp");
    let args = Arguments::from_pairs([
        ("input", "unused.pbf"),
        ("output", output.to_str().unwrap()),
        ("tmpdir", tmp.to_str().unwrap()),
        ("threads", "2"),
        ("use_wikidata", "false"),
    ]);
    PipelineConfig::from_arguments(&args).unwrap()
}

fn run_pipeline(
    dir: &Path,
    profile: Box<dyn Profile>,
    features: Vec<SourceFeature>,
) -> tileforge::pipeline::RunSummary {
    let config = test_config(dir);
    let engine = PipelineEngine::new(config);
    let readers: Vec<Box<dyn SourceReader>> =
        vec![Box::new(VecReader::new("memory", features))];
    engine.run_with_sources(profile, readers).unwrap()
}

fn metadata_value(conn: &Connection, name: &str) -> String {
    conn.query_row(
        "SELECT value FROM metadata WHERE name = ?1",
        [name],
        |row| row.get(0),
    )
    .unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

struct SilentProfile;

impl Profile for SilentProfile {
    fn name(&self) -> &'static str {
        "silent"
    }

    fn process_feature(&self, _: &SourceFeature, _: &mut FeatureCollector) {}
}

struct AirportProfile;

impl Profile for AirportProfile {
    fn name(&self) -> &'static str {
        "airport"
    }

    fn process_feature(&self, source: &SourceFeature, features: &mut FeatureCollector) {
        if let Some(iata) = source.tag("iata") {
            features
                .centroid("aerodrome_label")
                .zoom_range(10, 14)
                .attr("iata", iata);
        }
    }
}

fn airport_node() -> SourceFeature {
    let mut tags = HashMap::new();
    tags.insert("amenity".to_string(), FieldValue::from("airport"));
    tags.insert("iata".to_string(), FieldValue::from("XXX"));
    SourceFeature::new(
        1,
        ElementKind::Node,
        tags,
        RawGeometry::Point { lon: 0.0, lat: 0.0 },
    )
}

#[test]
fn test_empty_input_yields_empty_archive() {
    let dir = tempfile::tempdir().unwrap();
    let summary = run_pipeline(dir.path(), Box::new(SilentProfile), vec![airport_node()]);
    assert_eq!(summary.tiles_written, 0);

    let output = dir.path().join("out.mbtiles");
    assert!(output.exists());
    let conn = Connection::open(&output).unwrap();
    let tiles: u32 = conn
        .query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get(0))
        .unwrap();
    assert_eq!(tiles, 0);
    assert_eq!(metadata_value(&conn, "minzoom"), "0");
    assert_eq!(metadata_value(&conn, "maxzoom"), "0");
    let json: serde_json::Value =
        serde_json::from_str(&metadata_value(&conn, "json")).unwrap();
    assert_eq!(json["vector_layers"].as_array().unwrap().len(), 0);
}

#[test]
fn test_single_airport_point_hits_five_center_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let summary = run_pipeline(dir.path(), Box::new(AirportProfile), vec![airport_node()]);
    assert_eq!(summary.tiles_written, 5);

    let conn = Connection::open(dir.path().join("out.mbtiles")).unwrap();
    let mut stmt = conn
        .prepare("SELECT zoom_level, tile_column, tile_row, tile_data FROM tiles ORDER BY zoom_level")
        .unwrap();
    let rows: Vec<(u8, u32, u32, Vec<u8>)> = stmt
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(rows.len(), 5);
    for (z, x, tms_row, blob) in rows {
        assert!((10..=14).contains(&z));
        let half = 1u32 << (z - 1);
        assert_eq!(x, half);
        // TMS flip: y = 2^(z-1) maps to row 2^(z-1) - 1.
        assert_eq!(tms_row, half - 1);

        let raw = gunzip(&blob);
        let reader = mvt_reader::Reader::new(raw).unwrap();
        let names = reader.get_layer_names().unwrap();
        assert_eq!(names, vec!["aerodrome_label".to_string()]);
        let features = reader.get_features(0).unwrap();
        assert_eq!(features.len(), 1);
        let props = features[0].properties.as_ref().unwrap();
        assert!(matches!(
            props.get("iata"),
            Some(mvt_reader::feature::Value::String(s)) if s == "XXX"
        ));
    }

    // Metadata reflects the configured zoom range once layers exist.
    assert_eq!(metadata_value(&conn, "format"), "pbf");
    assert_eq!(metadata_value(&conn, "maxzoom"), "14");
    let json: serde_json::Value =
        serde_json::from_str(&metadata_value(&conn, "json")).unwrap();
    let layers = json["vector_layers"].as_array().unwrap();
    assert_eq!(layers[0]["id"], "aerodrome_label");
    assert_eq!(layers[0]["minzoom"], 10);
    assert_eq!(layers[0]["maxzoom"], 14);
    assert_eq!(layers[0]["fields"]["iata"], "String");
}

struct GroupedLabelProfile;

impl Profile for GroupedLabelProfile {
    fn name(&self) -> &'static str {
        "grouped"
    }

    fn process_feature(&self, source: &SourceFeature, features: &mut FeatureCollector) {
        features
            .point("labels")
            .zoom_range(3, 3)
            .attr("n", source.id() as i64)
            .group(7, 3);
    }
}

#[test]
fn test_group_limit_caps_features_per_tile() {
    let dir = tempfile::tempdir().unwrap();
    // Ten distinct points, all inside one z=3 tile (lon/lat near 10,10).
    let features: Vec<SourceFeature> = (0..10u64)
        .map(|i| {
            SourceFeature::new(
                i,
                ElementKind::Node,
                HashMap::new(),
                RawGeometry::Point {
                    lon: 10.0 + i as f64 * 0.01,
                    lat: 10.0,
                },
            )
        })
        .collect();
    let summary = run_pipeline(dir.path(), Box::new(GroupedLabelProfile), features);
    assert_eq!(summary.tiles_written, 1);

    let conn = Connection::open(dir.path().join("out.mbtiles")).unwrap();
    let blob: Vec<u8> = conn
        .query_row("SELECT tile_data FROM tiles", [], |row| row.get(0))
        .unwrap();
    let reader = mvt_reader::Reader::new(gunzip(&blob)).unwrap();
    assert_eq!(reader.get_features(0).unwrap().len(), 3);
}

struct TwoLayerProfile;

impl Profile for TwoLayerProfile {
    fn name(&self) -> &'static str {
        "two_layer"
    }

    fn process_feature(&self, source: &SourceFeature, features: &mut FeatureCollector) {
        // Same layer, same attr key, number at z3 and boolean at z4; the
        // merged field type must come out STRING-free, i.e. Number.
        if source.id() % 2 == 0 {
            features.point("L1").zoom_range(3, 3).attr("a", 1i64);
        } else {
            features.point("L1").zoom_range(4, 4).attr("a", true);
        }
    }
}

#[test]
fn test_layer_stats_merge_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let features: Vec<SourceFeature> = (0..40u64)
        .map(|i| {
            SourceFeature::new(
                i,
                ElementKind::Node,
                HashMap::new(),
                RawGeometry::Point { lon: 1.0, lat: 1.0 },
            )
        })
        .collect();
    run_pipeline(dir.path(), Box::new(TwoLayerProfile), features);

    let conn = Connection::open(dir.path().join("out.mbtiles")).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&metadata_value(&conn, "json")).unwrap();
    let layer = &json["vector_layers"].as_array().unwrap()[0];
    assert_eq!(layer["id"], "L1");
    assert_eq!(layer["fields"]["a"], "Number");
    assert_eq!(layer["minzoom"], 3);
    assert_eq!(layer["maxzoom"], 4);
}

#[test]
fn test_cancellation_leaves_no_partial_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let output = config.output.clone();
    let tmp = config.tmpdir.clone();
    let engine = PipelineEngine::new(config);
    engine.cancel_token().cancel();

    let readers: Vec<Box<dyn SourceReader>> = vec![Box::new(VecReader::new(
        "memory",
        (0..1000).map(|_| airport_node()).collect(),
    ))];
    let result = engine.run_with_sources(Box::new(AirportProfile), readers);
    assert!(result.is_err());
    assert!(!output.exists(), "partial mbtiles must be removed");
    assert!(
        !tmp.join("feature_sort").exists(),
        "sort scratch must be removed"
    );
    assert!(!tmp.join("node.db").exists());
}

struct ReleaseTrackingProfile {
    released: Arc<std::sync::atomic::AtomicBool>,
}

impl Profile for ReleaseTrackingProfile {
    fn name(&self) -> &'static str {
        "release_tracking"
    }

    fn process_feature(&self, _: &SourceFeature, _: &mut FeatureCollector) {}

    fn release(&self) {
        self.released
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

#[test]
fn test_profile_release_is_invoked_after_rendering() {
    let dir = tempfile::tempdir().unwrap();
    let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let profile = ReleaseTrackingProfile {
        released: Arc::clone(&released),
    };
    run_pipeline(dir.path(), Box::new(profile), vec![airport_node()]);
    assert!(released.load(std::sync::atomic::Ordering::Relaxed));
}
