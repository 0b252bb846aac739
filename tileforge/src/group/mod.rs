//! Grouping the sorted feature stream into per-tile batches.
//!
//! The merged sort output arrives tile by tile; this stage cuts it at tile
//! boundaries, splits each tile's features by layer (preserving the sorted
//! z-order / feature-id order), applies group-key density limits, and
//! optionally merges same-attribute neighbors for layers that opt in.

use std::collections::HashMap;

use geo::BooleanOps;
use geo_types::{Coord, LineString, MultiPolygon, Polygon};

use crate::coord::TileCoord;
use crate::error::{PipelineError, Result};
use crate::feature::{RenderedFeature, TileGeometry, TilePolygon};
use crate::sort::{SortRecord, SortedStream};

/// Per-layer merge behavior, chosen by the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Concatenate lines whose endpoints coincide.
    Lines,
    /// Union polygons into one multipolygon feature.
    Polygons,
}

/// Options for one run of the grouper.
#[derive(Debug, Clone, Default)]
pub struct GroupOptions {
    /// Layers that asked for merging, and how.
    pub merge_layers: HashMap<String, MergeMode>,
}

/// All features of one layer within one tile, in delivery order.
#[derive(Debug)]
pub struct LayerBatch {
    pub name: String,
    pub features: Vec<RenderedFeature>,
}

/// All features of one tile.
#[derive(Debug)]
pub struct TileBatch {
    pub tile: TileCoord,
    pub layers: Vec<LayerBatch>,
}

impl TileBatch {
    pub fn feature_count(&self) -> usize {
        self.layers.iter().map(|l| l.features.len()).sum()
    }
}

/// Streaming grouper over the sorted record stream.
pub struct FeatureGrouper {
    stream: SortedStream,
    pending: Option<SortRecord>,
    options: GroupOptions,
}

impl FeatureGrouper {
    pub fn new(stream: SortedStream, options: GroupOptions) -> Self {
        Self {
            stream,
            pending: None,
            options,
        }
    }

    /// Next tile batch, or `None` at end of stream.
    pub fn next_batch(&mut self) -> Result<Option<TileBatch>> {
        let first = match self.pending.take() {
            Some(record) => record,
            None => match self.stream.next_record()? {
                Some(record) => record,
                None => return Ok(None),
            },
        };
        let tile_id = first.key.tile_id();
        let mut records = vec![first];
        loop {
            match self.stream.next_record()? {
                None => break,
                Some(record) if record.key.tile_id() == tile_id => records.push(record),
                Some(record) => {
                    self.pending = Some(record);
                    break;
                }
            }
        }
        let mut features = Vec::with_capacity(records.len());
        for record in records {
            let feature = RenderedFeature::decode(&record.payload)
                .map_err(|e| PipelineError::Internal(e.to_string()))?;
            features.push(feature);
        }
        let tile = features[0].tile;
        Ok(Some(self.build_batch(tile, features)))
    }

    fn build_batch(&self, tile: TileCoord, features: Vec<RenderedFeature>) -> TileBatch {
        // Split by layer, preserving the delivered order.
        let mut layers: Vec<LayerBatch> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut group_counts: HashMap<(usize, u64), u32> = HashMap::new();
        for feature in features {
            let layer_idx = *index.entry(feature.layer.clone()).or_insert_with(|| {
                layers.push(LayerBatch {
                    name: feature.layer.clone(),
                    features: Vec::new(),
                });
                layers.len() - 1
            });
            // Density cap: first `limit` features per group key win, in
            // delivered (z-order, feature id) order.
            if let Some((group_key, limit)) = feature.group {
                let count = group_counts.entry((layer_idx, group_key)).or_insert(0);
                if *count >= limit {
                    continue;
                }
                *count += 1;
            }
            layers[layer_idx].features.push(feature);
        }
        for layer in &mut layers {
            if let Some(mode) = self.options.merge_layers.get(&layer.name) {
                layer.features = merge_features(std::mem::take(&mut layer.features), *mode);
            }
        }
        TileBatch { tile, layers }
    }
}

impl Iterator for FeatureGrouper {
    type Item = Result<TileBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// Merges runs of adjacent features that share attributes.
fn merge_features(features: Vec<RenderedFeature>, mode: MergeMode) -> Vec<RenderedFeature> {
    let mut out: Vec<RenderedFeature> = Vec::with_capacity(features.len());
    for feature in features {
        let kind_matches = match (mode, out.last().map(|l| &l.geometry), &feature.geometry) {
            (MergeMode::Lines, Some(TileGeometry::Lines(_)), TileGeometry::Lines(_)) => true,
            (MergeMode::Polygons, Some(TileGeometry::Polygons(_)), TileGeometry::Polygons(_)) => {
                true
            }
            _ => false,
        };
        let mergeable = kind_matches
            && out.last().is_some_and(|last| {
                last.attrs == feature.attrs && last.z_order == feature.z_order
            });
        if !mergeable {
            out.push(feature);
            continue;
        }
        let last = out.last_mut().unwrap();
        match (mode, &mut last.geometry, feature.geometry) {
            (MergeMode::Lines, TileGeometry::Lines(existing), TileGeometry::Lines(incoming)) => {
                for line in incoming {
                    append_line(existing, line);
                }
            }
            (
                MergeMode::Polygons,
                TileGeometry::Polygons(existing),
                TileGeometry::Polygons(incoming),
            ) => {
                *existing = union_polygons(std::mem::take(existing), incoming);
            }
            _ => unreachable!("guarded by the kind check above"),
        }
    }
    out
}

/// Appends a line, stitching it onto an existing one when endpoints meet.
fn append_line(lines: &mut Vec<Vec<(i32, i32)>>, line: Vec<(i32, i32)>) {
    if let (Some(start), Some(_)) = (line.first().copied(), line.last().copied()) {
        for existing in lines.iter_mut() {
            if existing.last() == Some(&start) {
                existing.extend(line.into_iter().skip(1));
                return;
            }
        }
    }
    lines.push(line);
}

/// Unions polygon sets in f64 space and re-quantizes.
fn union_polygons(a: Vec<TilePolygon>, b: Vec<TilePolygon>) -> Vec<TilePolygon> {
    let to_multi = |polygons: Vec<TilePolygon>| {
        MultiPolygon(
            polygons
                .into_iter()
                .map(|p| {
                    Polygon::new(
                        ring_to_line_string(&p.exterior),
                        p.interiors.iter().map(|r| ring_to_line_string(r)).collect(),
                    )
                })
                .collect::<Vec<_>>(),
        )
    };
    let merged = to_multi(a).union(&to_multi(b));
    merged
        .0
        .into_iter()
        .filter_map(|polygon| {
            let exterior = line_string_to_ring(polygon.exterior());
            if exterior.len() < 3 {
                return None;
            }
            Some(TilePolygon {
                exterior,
                interiors: polygon
                    .interiors()
                    .iter()
                    .map(line_string_to_ring)
                    .filter(|r| r.len() >= 3)
                    .collect(),
            })
        })
        .collect()
}

fn ring_to_line_string(ring: &[(i32, i32)]) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|&(x, y)| Coord {
            x: x as f64,
            y: y as f64,
        })
        .collect();
    if let Some(first) = coords.first().copied() {
        coords.push(first);
    }
    LineString::from(coords)
}

fn line_string_to_ring(line: &LineString<f64>) -> Vec<(i32, i32)> {
    let mut ring: Vec<(i32, i32)> = line
        .coords()
        .map(|c| (c.x.round() as i32, c.y.round() as i32))
        .collect();
    if ring.len() >= 2 && ring.first() == ring.last() {
        ring.pop();
    }
    ring.dedup();
    ring
}
