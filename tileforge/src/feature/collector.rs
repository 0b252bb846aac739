//! The surface profiles use to declare output features.

use super::value::FieldValue;
use crate::coord::MAX_ZOOM;

/// How the source geometry should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryIntent {
    Point,
    Line,
    Polygon,
    /// A single label point at the polygon/line centroid.
    Centroid,
}

/// One output feature declared by a profile, before rendering.
#[derive(Debug, Clone)]
pub struct FeatureSpec {
    pub layer: String,
    pub intent: GeometryIntent,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Clip buffer around each tile, in 256-scale pixels.
    pub buffer_px: f64,
    pub z_order: i32,
    pub attrs: Vec<(String, FieldValue)>,
    pub group: Option<(u64, u32)>,
    /// Ask the renderer to union polygon parts before simplification.
    pub union_polygons: bool,
    /// Smallest rendered extent (256-scale pixels) worth keeping; lines and
    /// polygons below this at a zoom are skipped for that zoom.
    pub min_pixel_size: f64,
}

impl FeatureSpec {
    fn new(layer: &str, intent: GeometryIntent) -> Self {
        Self {
            layer: layer.to_string(),
            intent,
            min_zoom: 0,
            max_zoom: MAX_ZOOM,
            buffer_px: 4.0,
            z_order: 0,
            attrs: Vec::new(),
            group: None,
            union_polygons: false,
            min_pixel_size: 0.0,
        }
    }

    /// Inclusive zoom range this feature appears in.
    pub fn zoom_range(&mut self, min: u8, max: u8) -> &mut Self {
        self.min_zoom = min;
        self.max_zoom = max.min(MAX_ZOOM);
        self
    }

    pub fn min_zoom(&mut self, min: u8) -> &mut Self {
        self.min_zoom = min;
        self
    }

    pub fn buffer_px(&mut self, px: f64) -> &mut Self {
        self.buffer_px = px;
        self
    }

    pub fn z_order(&mut self, z: i32) -> &mut Self {
        self.z_order = z;
        self
    }

    pub fn attr(&mut self, key: &str, value: impl Into<FieldValue>) -> &mut Self {
        self.attrs.push((key.to_string(), value.into()));
        self
    }

    /// Optional string attribute; skipped when `None`.
    pub fn attr_opt(&mut self, key: &str, value: Option<impl Into<FieldValue>>) -> &mut Self {
        if let Some(value) = value {
            self.attrs.push((key.to_string(), value.into()));
        }
        self
    }

    /// Cap density: keep at most `limit` features with this `group_key`
    /// per tile and layer.
    pub fn group(&mut self, group_key: u64, limit: u32) -> &mut Self {
        self.group = Some((group_key, limit));
        self
    }

    pub fn union_polygons(&mut self) -> &mut Self {
        self.union_polygons = true;
        self
    }

    /// Skip zooms where the feature renders smaller than `px` pixels.
    pub fn min_pixel_size(&mut self, px: f64) -> &mut Self {
        self.min_pixel_size = px;
        self
    }
}

/// Collects the output features one profile callback declares for one
/// source feature. Reused across calls; the engine drains it after each.
#[derive(Debug, Default)]
pub struct FeatureCollector {
    specs: Vec<FeatureSpec>,
}

impl FeatureCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point(&mut self, layer: &str) -> &mut FeatureSpec {
        self.push(FeatureSpec::new(layer, GeometryIntent::Point))
    }

    pub fn line(&mut self, layer: &str) -> &mut FeatureSpec {
        self.push(FeatureSpec::new(layer, GeometryIntent::Line))
    }

    pub fn polygon(&mut self, layer: &str) -> &mut FeatureSpec {
        self.push(FeatureSpec::new(layer, GeometryIntent::Polygon))
    }

    pub fn centroid(&mut self, layer: &str) -> &mut FeatureSpec {
        self.push(FeatureSpec::new(layer, GeometryIntent::Centroid))
    }

    fn push(&mut self, spec: FeatureSpec) -> &mut FeatureSpec {
        self.specs.push(spec);
        self.specs.last_mut().unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Hands out the collected specs, leaving the collector empty.
    pub fn drain(&mut self) -> Vec<FeatureSpec> {
        std::mem::take(&mut self.specs)
    }
}
