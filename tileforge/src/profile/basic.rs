//! The built-in `basic` profile.
//!
//! A small general-purpose schema exercising the whole collector surface:
//! water polygons (merged), waterways and roads (line merge), place labels
//! with density capping, and aerodrome labels.

use std::collections::HashMap;
use std::sync::Arc;

use super::matcher::{match_any, TagIndex};
use super::translations::Translations;
use super::Profile;
use crate::feature::{ElementKind, FeatureCollector, FieldValue, SourceFeature};
use crate::group::MergeMode;

pub struct BasicProfile {
    translations: Arc<Translations>,
    aerodrome_class: TagIndex<&'static str>,
    road_class: TagIndex<&'static str>,
}

impl BasicProfile {
    pub fn new(translations: Arc<Translations>) -> Self {
        let aerodrome_class = TagIndex::build(vec![
            (
                "international",
                match_any("aerodrome", &["international"]),
            ),
            ("public", match_any("aerodrome:type", &["public", "civil"])),
            ("military", match_any("military", &["airfield"])),
            ("private", match_any("aerodrome:type", &["private"])),
        ]);
        let road_class = TagIndex::build(vec![
            ("motorway", match_any("highway", &["motorway", "motorway_link"])),
            ("trunk", match_any("highway", &["trunk", "trunk_link"])),
            ("primary", match_any("highway", &["primary", "primary_link"])),
            (
                "secondary",
                match_any("highway", &["secondary", "secondary_link"]),
            ),
            (
                "minor",
                match_any("highway", &["tertiary", "residential", "unclassified"]),
            ),
        ]);
        Self {
            translations,
            aerodrome_class,
            road_class,
        }
    }

    fn process_osm(&self, source: &SourceFeature, features: &mut FeatureCollector) {
        let tags = source.tags();

        // Aerodromes label from nodes or area centroids.
        if source.tag("aeroway") == Some("aerodrome") {
            let class = self.aerodrome_class.get_or_else(tags, &"other");
            let spec = features.centroid("aerodrome_label");
            spec.zoom_range(10, 14)
                .attr("class", *class)
                .attr_opt("iata", source.tag("iata"))
                .attr_opt("icao", source.tag("icao"));
            if let Some(ele) = tags.get("ele").and_then(parse_meters) {
                spec.attr("ele", ele);
            }
            for (key, value) in self.translations.names(tags) {
                spec.attr(&key, value);
            }
            return;
        }

        // Water areas. Ponds smaller than a pixel add nothing at a zoom.
        if source.can_be_polygon()
            && (source.tag("natural") == Some("water")
                || source.tag("landuse") == Some("reservoir"))
        {
            features
                .polygon("water")
                .attr("class", water_class(source))
                .union_polygons()
                .min_pixel_size(1.0);
            return;
        }

        // Waterway lines.
        if let Some(waterway) = source.tag("waterway") {
            if matches!(waterway, "river" | "canal" | "stream") {
                let spec = features.line("waterway");
                spec.min_zoom(if waterway == "river" { 4 } else { 9 })
                    .attr("class", waterway);
                for (key, value) in self.translations.names(tags) {
                    spec.attr(&key, value);
                }
                return;
            }
        }

        // Roads.
        if tags.contains_key("highway") && !source.is_point() {
            let hits = self.road_class.matches(tags);
            if let Some(class) = hits.first() {
                features
                    .line("transportation")
                    .min_zoom(road_min_zoom(class))
                    .z_order(road_z_order(class))
                    .attr("class", **class);
            }
            return;
        }

        // Place labels from nodes.
        if source.kind() == ElementKind::Node {
            if let Some(place) = source.tag("place") {
                if let Some((min_zoom, rank)) = place_rank(place) {
                    let spec = features.point("place");
                    spec.min_zoom(min_zoom)
                        .z_order(-(rank as i32))
                        .attr("class", place)
                        .attr("rank", rank as i64)
                        // Cap label density per class within a tile.
                        .group(rank, 16);
                    for (key, value) in self.translations.names(tags) {
                        spec.attr(&key, value);
                    }
                }
            }
        }
    }

    fn process_aux(&self, source: &SourceFeature, features: &mut FeatureCollector) {
        match source.source() {
            // Pre-tiled ocean polygons; one merged water layer.
            "water_polygons" => {
                features
                    .polygon("water")
                    .attr("class", "ocean")
                    .union_polygons()
                    .min_pixel_size(1.0);
            }
            // Low-zoom lakes and coastline stand-ins from Natural Earth.
            "natural_earth" => {
                if source.tag("table").is_some_and(|t| t.contains("lakes")) {
                    features
                        .polygon("water")
                        .zoom_range(0, 5)
                        .attr("class", "lake");
                }
            }
            "centerline" => {
                features
                    .line("waterway")
                    .min_zoom(3)
                    .attr("class", "lake_centerline");
            }
            _ => {}
        }
    }
}

impl Profile for BasicProfile {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn process_feature(&self, source: &SourceFeature, features: &mut FeatureCollector) {
        if source.source() == "osm" {
            self.process_osm(source, features);
        } else {
            self.process_aux(source, features);
        }
    }

    fn merge_layers(&self) -> HashMap<String, MergeMode> {
        HashMap::from([
            ("water".to_string(), MergeMode::Polygons),
            ("waterway".to_string(), MergeMode::Lines),
            ("transportation".to_string(), MergeMode::Lines),
        ])
    }
}

fn water_class(source: &SourceFeature) -> &'static str {
    match source.tag("water") {
        Some("river") => "river",
        Some("lake") | None => "lake",
        Some(_) => "pond",
    }
}

fn road_min_zoom(class: &str) -> u8 {
    match class {
        "motorway" => 4,
        "trunk" => 5,
        "primary" => 7,
        "secondary" => 9,
        _ => 12,
    }
}

fn road_z_order(class: &str) -> i32 {
    match class {
        "motorway" => 5,
        "trunk" => 4,
        "primary" => 3,
        "secondary" => 2,
        _ => 0,
    }
}

/// `(min zoom, rank)` for place labels; rank doubles as the group key so
/// cities never compete with villages for tile slots.
fn place_rank(place: &str) -> Option<(u8, u64)> {
    match place {
        "city" => Some((4, 1)),
        "town" => Some((8, 2)),
        "village" => Some((11, 3)),
        "hamlet" => Some((13, 4)),
        _ => None,
    }
}

fn parse_meters(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::I64(v) => Some(*v),
        FieldValue::F64(v) => Some(v.round() as i64),
        FieldValue::Str(s) => s.trim().parse::<f64>().ok().map(|v| v.round() as i64),
        FieldValue::Bool(_) => None,
    }
}
