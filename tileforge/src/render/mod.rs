//! Rendering one source feature into per-tile quantized geometries.
//!
//! Per zoom in the requested range: project to pixel space, simplify with a
//! zoom-independent pixel tolerance, enumerate the tiles whose buffered
//! squares intersect the feature bounds, clip against each, quantize to the
//! 4096 integer extent, and drop whatever degenerated. Simplifying before
//! clipping bounds the vertex count every tile pays for; simplifying per
//! zoom keeps low-zoom tiles from inheriting full-detail coastlines.
//!
//! Points are the exception to buffered emission: a point belongs to exactly
//! the tile that contains it (half-open tile squares), matching the rule
//! that points outside the tile proper are degenerate.

mod clip;

use geo::algorithm::centroid::Centroid;
use geo::algorithm::simplify::Simplify;
use geo::BooleanOps;
use geo_types::{Geometry, LineString, MultiPolygon, Polygon};

use crate::config::{Bounds, PipelineConfig};
use crate::coord::{lat_to_world_y, lon_to_world_x, TileCoord};
use crate::error::FeatureError;
use crate::feature::{
    FeatureSpec, GeometryIntent, RenderedFeature, SourceFeature, TileGeometry, TilePolygon,
};

/// Pixels per tile side at which buffers and tolerances are expressed.
const TILE_PX: f64 = 256.0;

/// Quantization factor from 256-pixel space to the 4096 extent.
const PX_TO_EXTENT: f64 = 4096.0 / TILE_PX;

type P = (f64, f64);

#[derive(Debug, Clone)]
struct WorldPolygon {
    exterior: Vec<P>,
    interiors: Vec<Vec<P>>,
}

/// Feature geometry in unit-square world coordinates, shaped by the
/// profile's intent.
#[derive(Debug, Clone)]
enum WorldShape {
    Points(Vec<P>),
    Lines(Vec<Vec<P>>),
    Polygons(Vec<WorldPolygon>),
}

/// Stateless per-run renderer; shared by all render workers.
#[derive(Debug, Clone)]
pub struct FeatureRenderer {
    min_zoom: u8,
    max_zoom: u8,
    tolerance_px: f64,
    /// Clamp rendering to these world-space bounds when configured.
    world_bounds: Option<(f64, f64, f64, f64)>,
}

impl FeatureRenderer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_options(
            config.min_zoom,
            config.max_zoom,
            config.simplify_tolerance_px,
            config.bounds,
        )
    }

    pub fn with_options(
        min_zoom: u8,
        max_zoom: u8,
        tolerance_px: f64,
        bounds: Option<Bounds>,
    ) -> Self {
        let world_bounds = bounds.map(|b| {
            (
                lon_to_world_x(b.min_lon),
                lat_to_world_y(b.max_lat),
                lon_to_world_x(b.max_lon),
                lat_to_world_y(b.min_lat),
            )
        });
        Self {
            min_zoom,
            max_zoom,
            tolerance_px,
            world_bounds,
        }
    }

    /// Renders one declared output feature across its zoom range.
    pub fn render(
        &self,
        source: &SourceFeature,
        spec: &FeatureSpec,
    ) -> Result<Vec<RenderedFeature>, FeatureError> {
        let shape = build_world_shape(source, spec).map_err(|message| {
            FeatureError::GeometryInvalid {
                kind: source.kind().label(),
                id: source.id(),
                message,
            }
        })?;

        let lo = spec.min_zoom.max(self.min_zoom);
        let hi = spec.max_zoom.min(self.max_zoom);
        let mut out = Vec::new();
        for zoom in lo..=hi {
            self.render_zoom(source, spec, &shape, zoom, &mut out);
        }
        Ok(out)
    }

    fn render_zoom(
        &self,
        source: &SourceFeature,
        spec: &FeatureSpec,
        shape: &WorldShape,
        zoom: u8,
        out: &mut Vec<RenderedFeature>,
    ) {
        let n = 1u32 << zoom;
        let scale = n as f64 * TILE_PX;
        let buffer = spec.buffer_px;

        let emit = |tile: TileCoord, geometry: TileGeometry, out: &mut Vec<RenderedFeature>| {
            out.push(RenderedFeature {
                tile,
                layer: spec.layer.clone(),
                z_order: spec.z_order,
                feature_id: source.id(),
                geometry,
                attrs: spec.attrs.clone(),
                group: spec.group,
            });
        };

        match shape {
            WorldShape::Points(points) => {
                for &(wx, wy) in points {
                    let (px, py) = (wx * scale, wy * scale);
                    let tx = ((px / TILE_PX).floor() as i64).clamp(0, n as i64 - 1) as u32;
                    let ty = ((py / TILE_PX).floor() as i64).clamp(0, n as i64 - 1) as u32;
                    if !self.tile_in_bounds(tx, ty, zoom) {
                        continue;
                    }
                    let local = quantize_point((px - tx as f64 * TILE_PX, py - ty as f64 * TILE_PX));
                    let tile = TileCoord { x: tx, y: ty, z: zoom };
                    emit(tile, TileGeometry::Points(vec![local]), out);
                }
            }
            WorldShape::Lines(lines) => {
                let simplified: Vec<Vec<P>> = lines
                    .iter()
                    .map(|line| simplify_open(&scale_points(line, scale), self.tolerance_px))
                    .collect();
                let Some(bbox) = bbox_of(simplified.iter().flatten()) else {
                    return;
                };
                if below_min_pixel_size(bbox, spec.min_pixel_size) {
                    return;
                }
                for (tx, ty) in self.tiles_for_bbox(bbox, buffer, zoom) {
                    let (ox, oy) = (tx as f64 * TILE_PX, ty as f64 * TILE_PX);
                    let mut tile_lines: Vec<Vec<(i32, i32)>> = Vec::new();
                    for line in &simplified {
                        let local: Vec<P> =
                            line.iter().map(|&(x, y)| (x - ox, y - oy)).collect();
                        for run in clip::clip_line(&local, -buffer, TILE_PX + buffer) {
                            let quantized = quantize_line(&run);
                            if quantized.len() >= 2 {
                                tile_lines.push(quantized);
                            }
                        }
                    }
                    if !tile_lines.is_empty() {
                        let tile = TileCoord { x: tx, y: ty, z: zoom };
                        emit(tile, TileGeometry::Lines(tile_lines), out);
                    }
                }
            }
            WorldShape::Polygons(polygons) => {
                let simplified: Vec<WorldPolygon> = polygons
                    .iter()
                    .map(|polygon| WorldPolygon {
                        exterior: simplify_ring(
                            &scale_points(&polygon.exterior, scale),
                            self.tolerance_px,
                        ),
                        interiors: polygon
                            .interiors
                            .iter()
                            .map(|ring| {
                                simplify_ring(&scale_points(ring, scale), self.tolerance_px)
                            })
                            .collect(),
                    })
                    .filter(|polygon| polygon.exterior.len() >= 3)
                    .collect();
                let Some(bbox) = bbox_of(simplified.iter().flat_map(|p| p.exterior.iter()))
                else {
                    return;
                };
                if below_min_pixel_size(bbox, spec.min_pixel_size) {
                    return;
                }
                for (tx, ty) in self.tiles_for_bbox(bbox, buffer, zoom) {
                    let (ox, oy) = (tx as f64 * TILE_PX, ty as f64 * TILE_PX);
                    let mut tile_polygons: Vec<TilePolygon> = Vec::new();
                    for polygon in &simplified {
                        let local: Vec<P> = polygon
                            .exterior
                            .iter()
                            .map(|&(x, y)| (x - ox, y - oy))
                            .collect();
                        let clipped =
                            clip::clip_ring(&local, -buffer, TILE_PX + buffer);
                        let Some(exterior) = quantize_ring(&clipped, RingKind::Exterior) else {
                            continue;
                        };
                        let mut interiors = Vec::new();
                        for ring in &polygon.interiors {
                            let local: Vec<P> =
                                ring.iter().map(|&(x, y)| (x - ox, y - oy)).collect();
                            let clipped =
                                clip::clip_ring(&local, -buffer, TILE_PX + buffer);
                            if let Some(hole) = quantize_ring(&clipped, RingKind::Interior) {
                                interiors.push(hole);
                            }
                        }
                        tile_polygons.push(TilePolygon {
                            exterior,
                            interiors,
                        });
                    }
                    if !tile_polygons.is_empty() {
                        let tile = TileCoord { x: tx, y: ty, z: zoom };
                        emit(tile, TileGeometry::Polygons(tile_polygons), out);
                    }
                }
            }
        }
    }

    /// Tiles whose buffered squares intersect `bbox` (pixel space), clamped
    /// to the grid and the configured bounds.
    fn tiles_for_bbox(
        &self,
        bbox: (f64, f64, f64, f64),
        buffer: f64,
        zoom: u8,
    ) -> Vec<(u32, u32)> {
        let n = 1i64 << zoom;
        let clamp = |v: f64| (v.floor() as i64).clamp(0, n - 1);
        let tx0 = clamp((bbox.0 - buffer) / TILE_PX);
        let ty0 = clamp((bbox.1 - buffer) / TILE_PX);
        let tx1 = clamp((bbox.2 + buffer) / TILE_PX);
        let ty1 = clamp((bbox.3 + buffer) / TILE_PX);
        let mut tiles = Vec::with_capacity(((tx1 - tx0 + 1) * (ty1 - ty0 + 1)) as usize);
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                if self.tile_in_bounds(tx as u32, ty as u32, zoom) {
                    tiles.push((tx as u32, ty as u32));
                }
            }
        }
        tiles
    }

    fn tile_in_bounds(&self, tx: u32, ty: u32, zoom: u8) -> bool {
        let Some((wx0, wy0, wx1, wy1)) = self.world_bounds else {
            return true;
        };
        let n = (1u32 << zoom) as f64;
        let (x0, y0) = (tx as f64 / n, ty as f64 / n);
        let (x1, y1) = ((tx + 1) as f64 / n, (ty + 1) as f64 / n);
        x1 > wx0 && x0 < wx1 && y1 > wy0 && y0 < wy1
    }
}

// ---------------------------------------------------------------------------
// World-shape construction
// ---------------------------------------------------------------------------

fn build_world_shape(source: &SourceFeature, spec: &FeatureSpec) -> Result<WorldShape, String> {
    let geometry = source.geometry()?;
    match spec.intent {
        GeometryIntent::Point => match geometry {
            Geometry::Point(p) => Ok(WorldShape::Points(vec![to_world((p.x(), p.y()))])),
            Geometry::MultiPoint(points) => Ok(WorldShape::Points(
                points.iter().map(|p| to_world((p.x(), p.y()))).collect(),
            )),
            _ => Err("point intent on non-point geometry".to_string()),
        },
        GeometryIntent::Centroid => {
            let centroid = match geometry {
                Geometry::Point(p) => Some(*p),
                Geometry::LineString(l) => l.centroid(),
                Geometry::Polygon(p) => p.centroid(),
                Geometry::MultiPolygon(p) => p.centroid(),
                Geometry::MultiLineString(l) => l.centroid(),
                _ => None,
            }
            .ok_or_else(|| "no centroid for empty geometry".to_string())?;
            Ok(WorldShape::Points(vec![to_world((
                centroid.x(),
                centroid.y(),
            ))]))
        }
        GeometryIntent::Line => match geometry {
            Geometry::LineString(line) => Ok(WorldShape::Lines(vec![line_to_world(line)])),
            Geometry::MultiLineString(lines) => {
                Ok(WorldShape::Lines(lines.iter().map(line_to_world).collect()))
            }
            // A closed way asked for as a line renders its ring outline.
            Geometry::Polygon(polygon) => Ok(WorldShape::Lines(
                std::iter::once(polygon.exterior())
                    .chain(polygon.interiors())
                    .map(line_to_world)
                    .collect(),
            )),
            _ => Err("line intent on non-line geometry".to_string()),
        },
        GeometryIntent::Polygon => {
            let mut polygons: Vec<Polygon<f64>> = match geometry {
                Geometry::Polygon(p) => vec![p.clone()],
                Geometry::MultiPolygon(mp) => mp.0.clone(),
                Geometry::LineString(line) if line.is_closed() => {
                    vec![Polygon::new(line.clone(), vec![])]
                }
                _ => return Err("polygon intent on non-area geometry".to_string()),
            };
            if spec.union_polygons && polygons.len() > 1 {
                let mut union: MultiPolygon<f64> = MultiPolygon(vec![polygons.remove(0)]);
                for polygon in polygons {
                    union = union.union(&MultiPolygon(vec![polygon]));
                }
                polygons = union.0;
            }
            Ok(WorldShape::Polygons(
                polygons.iter().map(polygon_to_world).collect(),
            ))
        }
    }
}

#[inline]
fn to_world((lon, lat): P) -> P {
    (lon_to_world_x(lon), lat_to_world_y(lat))
}

fn line_to_world(line: &LineString<f64>) -> Vec<P> {
    line.coords().map(|c| to_world((c.x, c.y))).collect()
}

fn polygon_to_world(polygon: &Polygon<f64>) -> WorldPolygon {
    WorldPolygon {
        exterior: open_ring(line_to_world(polygon.exterior())),
        interiors: polygon
            .interiors()
            .iter()
            .map(|ring| open_ring(line_to_world(ring)))
            .collect(),
    }
}

/// Strips the closing duplicate; rings are carried open internally.
fn open_ring(mut ring: Vec<P>) -> Vec<P> {
    if ring.len() >= 2 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

// ---------------------------------------------------------------------------
// Pixel-space helpers
// ---------------------------------------------------------------------------

fn scale_points(points: &[P], scale: f64) -> Vec<P> {
    points.iter().map(|&(x, y)| (x * scale, y * scale)).collect()
}

fn simplify_open(points: &[P], tolerance: f64) -> Vec<P> {
    if points.len() <= 2 {
        return points.to_vec();
    }
    let line = LineString::from(points.to_vec());
    line.simplify(&tolerance)
        .coords()
        .map(|c| (c.x, c.y))
        .collect()
}

/// Simplifies an open ring by closing it first so the seam is not pinned.
fn simplify_ring(points: &[P], tolerance: f64) -> Vec<P> {
    if points.len() <= 4 {
        return points.to_vec();
    }
    let mut closed = points.to_vec();
    closed.push(points[0]);
    let simplified = simplify_open(&closed, tolerance);
    open_ring(simplified)
}

/// True when a simplified feature's pixel extent at this zoom is under the
/// profile's floor; the feature is skipped for the whole zoom.
fn below_min_pixel_size(bbox: (f64, f64, f64, f64), min_px: f64) -> bool {
    min_px > 0.0 && (bbox.2 - bbox.0).max(bbox.3 - bbox.1) < min_px
}

fn bbox_of<'a>(points: impl Iterator<Item = &'a P>) -> Option<(f64, f64, f64, f64)> {
    let mut bbox: Option<(f64, f64, f64, f64)> = None;
    for &(x, y) in points {
        bbox = Some(match bbox {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bbox
}

#[inline]
fn quantize_point((x, y): P) -> (i32, i32) {
    (
        (x * PX_TO_EXTENT).round() as i32,
        (y * PX_TO_EXTENT).round() as i32,
    )
}

fn quantize_line(points: &[P]) -> Vec<(i32, i32)> {
    let mut out: Vec<(i32, i32)> = Vec::with_capacity(points.len());
    for &p in points {
        let q = quantize_point(p);
        if out.last() != Some(&q) {
            out.push(q);
        }
    }
    out
}

enum RingKind {
    Exterior,
    Interior,
}

/// Quantizes an open ring, dropping degenerates and fixing winding:
/// exterior rings get positive signed area (y-down surveyor's formula,
/// per the MVT spec), interiors negative.
fn quantize_ring(points: &[P], kind: RingKind) -> Option<Vec<(i32, i32)>> {
    let mut ring = quantize_line(points);
    if ring.len() >= 2 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return None;
    }
    let area = signed_area(&ring);
    if area == 0 {
        return None;
    }
    let want_positive = matches!(kind, RingKind::Exterior);
    if (area > 0) != want_positive {
        ring.reverse();
    }
    Some(ring)
}

fn signed_area(ring: &[(i32, i32)]) -> i64 {
    let mut doubled = 0i64;
    for i in 0..ring.len() {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % ring.len()];
        doubled += x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64;
    }
    doubled / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{ElementKind, FeatureCollector, RawGeometry};
    use std::collections::HashMap;

    fn renderer(min: u8, max: u8) -> FeatureRenderer {
        FeatureRenderer::with_options(min, max, 0.0625, None)
    }

    fn point_feature(lon: f64, lat: f64) -> SourceFeature {
        SourceFeature::new(
            1,
            ElementKind::Node,
            HashMap::new(),
            RawGeometry::Point { lon, lat },
        )
    }

    fn spec_for(layer: &str, intent_point: bool) -> FeatureSpec {
        let mut collector = FeatureCollector::new();
        if intent_point {
            collector.point(layer);
        } else {
            collector.line(layer);
        }
        collector.drain().pop().unwrap()
    }

    #[test]
    fn test_point_at_null_island_hits_center_tile_per_zoom() {
        // The §8 single-point scenario: one tile per zoom, x = y = 2^(z-1).
        let source = point_feature(0.0, 0.0);
        let mut spec = spec_for("aerodrome_label", true);
        spec.zoom_range(10, 14);
        let rendered = renderer(0, 14).render(&source, &spec).unwrap();
        assert_eq!(rendered.len(), 5);
        for feature in &rendered {
            let z = feature.tile.z;
            assert!((10..=14).contains(&z));
            assert_eq!(feature.tile.x, 1 << (z - 1));
            assert_eq!(feature.tile.y, 1 << (z - 1));
            match &feature.geometry {
                TileGeometry::Points(points) => assert_eq!(points[0], (0, 0)),
                other => panic!("unexpected geometry {:?}", other),
            }
        }
    }

    #[test]
    fn test_zoom_range_intersects_run_range() {
        let source = point_feature(0.0, 0.0);
        let mut spec = spec_for("poi", true);
        spec.zoom_range(3, 14);
        let rendered = renderer(0, 5).render(&source, &spec).unwrap();
        let zooms: Vec<u8> = rendered.iter().map(|f| f.tile.z).collect();
        assert_eq!(zooms, vec![3, 4, 5]);
    }

    #[test]
    fn test_line_spanning_tiles_is_clipped_into_both() {
        // A horizontal line crossing the z=1 tile boundary at lon 0.
        let source = SourceFeature::new(
            7,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::Line(vec![(-10.0, 0.0), (10.0, 0.0)]),
        );
        let mut spec = spec_for("transportation", false);
        spec.zoom_range(1, 1);
        let rendered = renderer(0, 14).render(&source, &spec).unwrap();
        let mut tiles: Vec<(u32, u32)> =
            rendered.iter().map(|f| (f.tile.x, f.tile.y)).collect();
        tiles.sort_unstable();
        assert_eq!(tiles, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        for feature in &rendered {
            match &feature.geometry {
                TileGeometry::Lines(lines) => {
                    assert!(!lines.is_empty());
                    for line in lines {
                        assert!(line.len() >= 2);
                        for &(x, _) in line {
                            // Never outside the buffered extent.
                            assert!((-64..=4096 + 64).contains(&x));
                        }
                    }
                }
                other => panic!("unexpected geometry {:?}", other),
            }
        }
    }

    #[test]
    fn test_polygon_covering_tile_survives_with_positive_area() {
        let ring = vec![
            (-60.0, -50.0),
            (60.0, -50.0),
            (60.0, 50.0),
            (-60.0, 50.0),
            (-60.0, -50.0),
        ];
        let source = SourceFeature::new(
            9,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::ClosedRing(ring),
        );
        let mut collector = FeatureCollector::new();
        collector.polygon("water").zoom_range(0, 0);
        let spec = collector.drain().pop().unwrap();
        let rendered = renderer(0, 14).render(&source, &spec).unwrap();
        assert_eq!(rendered.len(), 1);
        match &rendered[0].geometry {
            TileGeometry::Polygons(polygons) => {
                assert_eq!(polygons.len(), 1);
                assert!(signed_area(&polygons[0].exterior) > 0);
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_degenerate_ring_is_dropped() {
        // Collapses to a point at any zoom this small.
        let ring = vec![
            (0.0, 0.0),
            (1e-9, 0.0),
            (1e-9, 1e-9),
            (0.0, 0.0),
        ];
        let source = SourceFeature::new(
            3,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::ClosedRing(ring),
        );
        let mut collector = FeatureCollector::new();
        collector.polygon("water").zoom_range(0, 0);
        let spec = collector.drain().pop().unwrap();
        let rendered = renderer(0, 14).render(&source, &spec).unwrap();
        assert!(rendered.is_empty());
    }

    #[test]
    fn test_min_pixel_size_gates_low_zooms() {
        // Half a degree square: a fraction of a pixel at z0, hundreds at z10.
        let ring = vec![
            (10.0, 10.0),
            (10.5, 10.0),
            (10.5, 10.5),
            (10.0, 10.5),
            (10.0, 10.0),
        ];
        let source = SourceFeature::new(
            8,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::ClosedRing(ring),
        );
        let mut collector = FeatureCollector::new();
        collector
            .polygon("water")
            .zoom_range(0, 10)
            .min_pixel_size(4.0);
        let spec = collector.drain().pop().unwrap();
        let rendered = renderer(0, 14).render(&source, &spec).unwrap();
        let zooms: Vec<u8> = rendered.iter().map(|f| f.tile.z).collect();
        assert!(!zooms.contains(&0), "sub-pixel zoom kept: {:?}", zooms);
        assert!(!zooms.contains(&1));
        assert!(zooms.contains(&10), "large zoom dropped: {:?}", zooms);
        // Without the floor, every zoom down to 0 renders.
        let mut collector = FeatureCollector::new();
        collector.polygon("water").zoom_range(0, 10);
        let spec = collector.drain().pop().unwrap();
        let all = renderer(0, 14).render(&source, &spec).unwrap();
        assert!(all.iter().any(|f| f.tile.z == 0));
    }

    #[test]
    fn test_bounds_filter_excludes_far_tiles() {
        let source = point_feature(100.0, 40.0);
        let mut spec = spec_for("poi", true);
        spec.zoom_range(5, 5);
        let europe = Bounds {
            min_lon: -10.0,
            min_lat: 35.0,
            max_lon: 30.0,
            max_lat: 60.0,
        };
        let renderer = FeatureRenderer::with_options(0, 14, 0.0625, Some(europe));
        assert!(renderer.render(&source, &spec).unwrap().is_empty());
    }

    #[test]
    fn test_centroid_of_polygon_is_a_point() {
        let ring = vec![
            (10.0, 10.0),
            (12.0, 10.0),
            (12.0, 12.0),
            (10.0, 12.0),
            (10.0, 10.0),
        ];
        let source = SourceFeature::new(
            4,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::ClosedRing(ring),
        );
        let mut collector = FeatureCollector::new();
        collector.centroid("place_label").zoom_range(4, 4);
        let spec = collector.drain().pop().unwrap();
        let rendered = renderer(0, 14).render(&source, &spec).unwrap();
        assert_eq!(rendered.len(), 1);
        assert!(matches!(rendered[0].geometry, TileGeometry::Points(_)));
    }

    #[test]
    fn test_point_intent_on_line_is_invalid() {
        let source = SourceFeature::new(
            5,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::Line(vec![(0.0, 0.0), (1.0, 1.0)]),
        );
        let spec = spec_for("poi", true);
        assert!(matches!(
            renderer(0, 14).render(&source, &spec),
            Err(FeatureError::GeometryInvalid { .. })
        ));
    }
}
