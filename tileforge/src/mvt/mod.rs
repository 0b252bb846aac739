//! MVT wire encoding and compression of tile batches.
//!
//! Wraps the `mvt` crate's encoder: one MVT layer per [`LayerBatch`], one
//! MVT feature per rendered feature, key/value pools handled by the crate.
//! Feature order within a layer is preserved exactly as delivered, which is
//! what carries the z-order guarantee into the output bytes.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use mvt::{GeomEncoder, GeomType, Tile};

use crate::coord::TILE_EXTENT;
use crate::error::{PipelineError, Result};
use crate::feature::{FieldValue, TileGeometry};
use crate::group::TileBatch;

/// Default gzip level for tile blobs.
pub const DEFAULT_GZIP_LEVEL: u32 = 6;

/// Stateless tile encoder, shared by all encode workers.
#[derive(Debug, Clone)]
pub struct TileEncoder {
    gzip_level: u32,
}

impl Default for TileEncoder {
    fn default() -> Self {
        Self {
            gzip_level: DEFAULT_GZIP_LEVEL,
        }
    }
}

impl TileEncoder {
    pub fn new(gzip_level: u32) -> Self {
        Self { gzip_level }
    }

    /// Encodes one batch to gzip-compressed MVT bytes. `None` when every
    /// layer in the batch turned out empty.
    pub fn encode(&self, batch: &TileBatch) -> Result<Option<Vec<u8>>> {
        let raw = self.encode_uncompressed(batch)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut gz = GzEncoder::new(
            Vec::with_capacity(raw.len() / 2),
            Compression::new(self.gzip_level),
        );
        gz.write_all(&raw)
            .and_then(|_| gz.finish())
            .map(Some)
            .map_err(|e| PipelineError::Internal(format!("gzip: {}", e)))
    }

    /// The raw MVT protobuf, for tests and debugging.
    pub fn encode_uncompressed(&self, batch: &TileBatch) -> Result<Option<Vec<u8>>> {
        let mut tile = Tile::new(TILE_EXTENT);
        let mut wrote_layer = false;
        for layer_batch in &batch.layers {
            if layer_batch.features.is_empty() {
                continue;
            }
            let mut layer = tile.create_layer(&layer_batch.name);
            let mut encoded = 0usize;
            for feature in &layer_batch.features {
                let Some(geom_data) = encode_geometry(&feature.geometry)? else {
                    continue;
                };
                let mut builder = layer.into_feature(geom_data);
                builder.set_id(feature.feature_id);
                for (key, value) in &feature.attrs {
                    match value {
                        FieldValue::I64(v) => builder.add_tag_sint(key, *v),
                        FieldValue::F64(v) => builder.add_tag_double(key, *v),
                        FieldValue::Bool(v) => builder.add_tag_bool(key, *v),
                        FieldValue::Str(v) => builder.add_tag_string(key, v),
                    }
                }
                layer = builder.into_layer();
                encoded += 1;
            }
            if encoded > 0 {
                tile.add_layer(layer)
                    .map_err(|e| PipelineError::Internal(format!("mvt layer: {}", e)))?;
                wrote_layer = true;
            }
        }
        if !wrote_layer {
            return Ok(None);
        }
        tile.to_bytes()
            .map(Some)
            .map_err(|e| PipelineError::Internal(format!("mvt encode: {}", e)))
    }
}

fn encode_geometry(geometry: &TileGeometry) -> Result<Option<mvt::GeomData>> {
    let internal = |e: mvt::Error| PipelineError::Internal(format!("mvt geometry: {}", e));
    match geometry {
        TileGeometry::Points(points) => {
            if points.is_empty() {
                return Ok(None);
            }
            let mut encoder = GeomEncoder::new(GeomType::Point);
            for &(x, y) in points {
                encoder = encoder.point(x as f64, y as f64).map_err(internal)?;
            }
            encoder.encode().map(Some).map_err(internal)
        }
        TileGeometry::Lines(lines) => {
            if lines.is_empty() {
                return Ok(None);
            }
            let mut encoder = GeomEncoder::new(GeomType::Linestring);
            for line in lines {
                for &(x, y) in line {
                    encoder = encoder.point(x as f64, y as f64).map_err(internal)?;
                }
                encoder = encoder.complete().map_err(internal)?;
            }
            encoder.encode().map(Some).map_err(internal)
        }
        TileGeometry::Polygons(polygons) => {
            if polygons.is_empty() {
                return Ok(None);
            }
            let mut encoder = GeomEncoder::new(GeomType::Polygon);
            for polygon in polygons {
                for &(x, y) in &polygon.exterior {
                    encoder = encoder.point(x as f64, y as f64).map_err(internal)?;
                }
                encoder = encoder.complete().map_err(internal)?;
                for interior in &polygon.interiors {
                    for &(x, y) in interior {
                        encoder = encoder.point(x as f64, y as f64).map_err(internal)?;
                    }
                    encoder = encoder.complete().map_err(internal)?;
                }
            }
            encoder.encode().map(Some).map_err(internal)
        }
    }
}
