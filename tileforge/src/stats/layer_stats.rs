//! Per-layer attribute schema and zoom-range accumulator.
//!
//! Feeds the MBTiles `json` metadata row. Accepts concurrently from every
//! emit worker; the merge operation on field types is commutative and
//! associative, so any thread interleaving of the same inputs converges to
//! the same result.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::Serialize;

use crate::feature::FieldValue;

/// MBTiles field type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    Number,
    String,
    Boolean,
}

impl FieldType {
    fn of(value: &FieldValue) -> Self {
        match value {
            FieldValue::I64(_) | FieldValue::F64(_) => FieldType::Number,
            FieldValue::Bool(_) => FieldType::Boolean,
            FieldValue::Str(_) => FieldType::String,
        }
    }

    /// String absorbs everything; Number absorbs Boolean.
    fn merge(self, other: Self) -> Self {
        use FieldType::*;
        match (self, other) {
            (String, _) | (_, String) => String,
            (Number, _) | (_, Number) => Number,
            (Boolean, Boolean) => Boolean,
        }
    }

    fn json_name(&self) -> &'static str {
        match self {
            FieldType::Number => "Number",
            FieldType::String => "String",
            FieldType::Boolean => "Boolean",
        }
    }
}

#[derive(Debug, Default)]
struct LayerAccum {
    fields: BTreeMap<String, FieldType>,
    min_zoom: u8,
    max_zoom: u8,
    seen: bool,
}

/// Frozen per-layer metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMeta {
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

/// Thread-safe accumulator; one per run.
#[derive(Debug, Default)]
pub struct LayerStats {
    layers: DashMap<String, LayerAccum>,
}

impl LayerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one rendered feature's layer, zoom, and attrs into the schema.
    pub fn accept<'a>(
        &self,
        layer: &str,
        zoom: u8,
        attrs: impl Iterator<Item = (&'a str, &'a FieldValue)>,
    ) {
        let mut accum = self.layers.entry(layer.to_string()).or_default();
        if accum.seen {
            accum.min_zoom = accum.min_zoom.min(zoom);
            accum.max_zoom = accum.max_zoom.max(zoom);
        } else {
            accum.min_zoom = zoom;
            accum.max_zoom = zoom;
            accum.seen = true;
        }
        for (key, value) in attrs {
            let observed = FieldType::of(value);
            accum
                .fields
                .entry(key.to_string())
                .and_modify(|t| *t = t.merge(observed))
                .or_insert(observed);
        }
    }

    /// Final metadata, sorted by layer name. Call after all producers stop.
    pub fn freeze(&self) -> Vec<LayerMeta> {
        let mut out: Vec<LayerMeta> = self
            .layers
            .iter()
            .map(|entry| LayerMeta {
                name: entry.key().clone(),
                fields: entry.value().fields.clone(),
                min_zoom: entry.value().min_zoom,
                max_zoom: entry.value().max_zoom,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// The `{"vector_layers": [...]}` JSON document for MBTiles metadata.
    pub fn to_metadata_json(&self) -> String {
        let layers: Vec<serde_json::Value> = self
            .freeze()
            .into_iter()
            .map(|meta| {
                let fields: serde_json::Map<String, serde_json::Value> = meta
                    .fields
                    .iter()
                    .map(|(k, t)| (k.clone(), serde_json::Value::from(t.json_name())))
                    .collect();
                serde_json::json!({
                    "id": meta.name,
                    "fields": fields,
                    "minzoom": meta.min_zoom,
                    "maxzoom": meta.max_zoom,
                })
            })
            .collect();
        serde_json::json!({ "vector_layers": layers }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_one(stats: &LayerStats, layer: &str, zoom: u8, attrs: &[(&str, FieldValue)]) {
        stats.accept(layer, zoom, attrs.iter().map(|(k, v)| (*k, v)));
    }

    #[test]
    fn test_zoom_range_expands() {
        let stats = LayerStats::new();
        accept_one(&stats, "water", 7, &[]);
        accept_one(&stats, "water", 3, &[]);
        accept_one(&stats, "water", 11, &[]);
        let meta = stats.freeze();
        assert_eq!(meta[0].min_zoom, 3);
        assert_eq!(meta[0].max_zoom, 11);
    }

    #[test]
    fn test_string_absorbs_number_and_boolean() {
        let stats = LayerStats::new();
        accept_one(&stats, "l", 3, &[("a", FieldValue::from(1i64))]);
        accept_one(&stats, "l", 4, &[("a", FieldValue::from(true))]);
        accept_one(&stats, "l", 4, &[("a", FieldValue::from("x"))]);
        assert_eq!(stats.freeze()[0].fields["a"], FieldType::String);
    }

    #[test]
    fn test_number_absorbs_boolean_without_string() {
        let stats = LayerStats::new();
        accept_one(&stats, "l", 3, &[("a", FieldValue::from(true))]);
        accept_one(&stats, "l", 4, &[("a", FieldValue::from(2.5f64))]);
        assert_eq!(stats.freeze()[0].fields["a"], FieldType::Number);
    }

    #[test]
    fn test_merge_is_order_independent_across_threads() {
        // The §8 scenario: {a:1} at z3 and {a:true} at z4 from two threads.
        // Run both orders; identical result either way.
        let run = |flip: bool| {
            let stats = LayerStats::new();
            let one = || accept_one(&stats, "L1", 3, &[("a", FieldValue::from(1i64))]);
            let two = || accept_one(&stats, "L1", 4, &[("a", FieldValue::from(true))]);
            if flip {
                std::thread::scope(|s| {
                    s.spawn(two);
                    s.spawn(one);
                });
            } else {
                std::thread::scope(|s| {
                    s.spawn(one);
                    s.spawn(two);
                });
            }
            stats.freeze()
        };
        let a = run(false);
        let b = run(true);
        assert_eq!(a, b);
        assert_eq!(a[0].fields["a"], FieldType::Number);
        assert_eq!((a[0].min_zoom, a[0].max_zoom), (3, 4));
    }

    #[test]
    fn test_metadata_json_shape() {
        let stats = LayerStats::new();
        accept_one(&stats, "water", 0, &[("class", FieldValue::from("lake"))]);
        let json: serde_json::Value = serde_json::from_str(&stats.to_metadata_json()).unwrap();
        let layers = json["vector_layers"].as_array().unwrap();
        assert_eq!(layers[0]["id"], "water");
        assert_eq!(layers[0]["fields"]["class"], "String");
        assert_eq!(layers[0]["minzoom"], 0);
    }

    #[test]
    fn test_empty_stats_yield_empty_layer_list() {
        let stats = LayerStats::new();
        let json: serde_json::Value = serde_json::from_str(&stats.to_metadata_json()).unwrap();
        assert_eq!(json["vector_layers"].as_array().unwrap().len(), 0);
    }
}
