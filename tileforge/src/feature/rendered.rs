//! Rendered (per-tile) features and their on-disk record form.
//!
//! The external sort never inspects geometry; it orders fixed-size keys and
//! carries the rest as an opaque payload. The key packs
//! `(tile id, layer id, biased z-order)` into one `u64` so plain integer
//! comparison yields the (tile, layer, z-order) order; the feature id rides
//! alongside as the explicit secondary key.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use super::value::FieldValue;
use crate::coord::TileCoord;

/// Tile-local integer coordinates, one polygon: exterior plus holes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePolygon {
    pub exterior: Vec<(i32, i32)>,
    pub interiors: Vec<Vec<(i32, i32)>>,
}

/// Quantized geometry inside one tile (4096 extent, y down).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileGeometry {
    Points(Vec<(i32, i32)>),
    Lines(Vec<Vec<(i32, i32)>>),
    Polygons(Vec<TilePolygon>),
}

impl TileGeometry {
    pub fn is_empty(&self) -> bool {
        match self {
            TileGeometry::Points(p) => p.is_empty(),
            TileGeometry::Lines(l) => l.is_empty(),
            TileGeometry::Polygons(p) => p.is_empty(),
        }
    }
}

/// Assigns small stable ids to layer names for sort-key packing.
///
/// Ids are assigned on first sight under a lock; identical names always map
/// to the same id, which is all the sort order requires (relative order of
/// distinct layers within a tile is unspecified).
#[derive(Debug, Default)]
pub struct LayerRegistry {
    ids: Mutex<HashMap<String, u8>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `layer`, assigning the next free one on first sight.
    ///
    /// Panics past 255 layers; real schemas have a few dozen.
    pub fn id(&self, layer: &str) -> u8 {
        let mut ids = self.ids.lock();
        if let Some(id) = ids.get(layer) {
            return *id;
        }
        let next = ids.len();
        assert!(next < 256, "layer registry overflow");
        ids.insert(layer.to_string(), next as u8);
        next as u8
    }
}

/// The packed primary sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey(pub u64);

const Z_ORDER_BIAS: i64 = 1 << 23;

impl SortKey {
    pub fn pack(tile_id: u32, layer_id: u8, z_order: i32) -> Self {
        let biased = (z_order as i64 + Z_ORDER_BIAS).clamp(0, (1 << 24) - 1) as u64;
        SortKey(((tile_id as u64) << 32) | ((layer_id as u64) << 24) | biased)
    }

    pub fn tile_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn layer_id(&self) -> u8 {
        ((self.0 >> 24) & 0xFF) as u8
    }

    pub fn z_order(&self) -> i32 {
        ((self.0 & 0xFF_FFFF) as i64 - Z_ORDER_BIAS) as i32
    }
}

/// One feature rendered into one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFeature {
    pub tile: TileCoord,
    pub layer: String,
    pub z_order: i32,
    pub feature_id: u64,
    pub geometry: TileGeometry,
    pub attrs: Vec<(String, FieldValue)>,
    /// Label-density capping: retain at most `.1` features sharing `.0`
    /// within this tile and layer.
    pub group: Option<(u64, u32)>,
}

impl RenderedFeature {
    pub fn sort_key(&self, layers: &LayerRegistry) -> SortKey {
        SortKey::pack(self.tile.id(), layers.id(&self.layer), self.z_order)
    }
}

/// Payload decode failures (always an internal error: we wrote the bytes).
#[derive(Debug, Error)]
#[error("corrupt feature payload at byte {at}: {reason}")]
pub struct PayloadError {
    at: usize,
    reason: &'static str,
}

// ---------------------------------------------------------------------------
// Payload codec. Fixed-width little-endian integers, length-prefixed strings;
// simple enough to audit byte-by-byte against the writer.
// ---------------------------------------------------------------------------

const TAG_I64: u8 = 0;
const TAG_F64: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_STR: u8 = 3;

const GEOM_POINTS: u8 = 0;
const GEOM_LINES: u8 = 1;
const GEOM_POLYGONS: u8 = 2;

impl RenderedFeature {
    /// Serializes everything except what the sort key already carries
    /// implicitly — the payload must be self-contained for the reader, so
    /// tile and layer are included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.tile.id().to_le_bytes());
        write_str(&mut buf, &self.layer);
        buf.extend_from_slice(&self.z_order.to_le_bytes());
        buf.extend_from_slice(&self.feature_id.to_le_bytes());
        match &self.group {
            None => buf.push(0),
            Some((key, limit)) => {
                buf.push(1);
                buf.extend_from_slice(&key.to_le_bytes());
                buf.extend_from_slice(&limit.to_le_bytes());
            }
        }
        buf.extend_from_slice(&(self.attrs.len() as u16).to_le_bytes());
        for (key, value) in &self.attrs {
            write_str(&mut buf, key);
            match value {
                FieldValue::I64(v) => {
                    buf.push(TAG_I64);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                FieldValue::F64(v) => {
                    buf.push(TAG_F64);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                FieldValue::Bool(v) => {
                    buf.push(TAG_BOOL);
                    buf.push(*v as u8);
                }
                FieldValue::Str(v) => {
                    buf.push(TAG_STR);
                    write_str(&mut buf, v);
                }
            }
        }
        match &self.geometry {
            TileGeometry::Points(points) => {
                buf.push(GEOM_POINTS);
                write_ring(&mut buf, points);
            }
            TileGeometry::Lines(lines) => {
                buf.push(GEOM_LINES);
                buf.extend_from_slice(&(lines.len() as u32).to_le_bytes());
                for line in lines {
                    write_ring(&mut buf, line);
                }
            }
            TileGeometry::Polygons(polygons) => {
                buf.push(GEOM_POLYGONS);
                buf.extend_from_slice(&(polygons.len() as u32).to_le_bytes());
                for polygon in polygons {
                    write_ring(&mut buf, &polygon.exterior);
                    buf.extend_from_slice(&(polygon.interiors.len() as u32).to_le_bytes());
                    for interior in &polygon.interiors {
                        write_ring(&mut buf, interior);
                    }
                }
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader { bytes, pos: 0 };
        let tile_id = r.u32()?;
        let layer = r.string()?;
        let z_order = r.i32()?;
        let feature_id = r.u64()?;
        let group = match r.u8()? {
            0 => None,
            1 => Some((r.u64()?, r.u32()?)),
            _ => return Err(r.fail("bad group flag")),
        };
        let attr_count = r.u16()? as usize;
        let mut attrs = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            let key = r.string()?;
            let value = match r.u8()? {
                TAG_I64 => FieldValue::I64(i64::from_le_bytes(r.array()?)),
                TAG_F64 => FieldValue::F64(f64::from_le_bytes(r.array()?)),
                TAG_BOOL => FieldValue::Bool(r.u8()? != 0),
                TAG_STR => FieldValue::Str(r.string()?),
                _ => return Err(r.fail("bad value tag")),
            };
            attrs.push((key, value));
        }
        let geometry = match r.u8()? {
            GEOM_POINTS => TileGeometry::Points(r.ring()?),
            GEOM_LINES => {
                let n = r.u32()? as usize;
                let mut lines = Vec::with_capacity(n);
                for _ in 0..n {
                    lines.push(r.ring()?);
                }
                TileGeometry::Lines(lines)
            }
            GEOM_POLYGONS => {
                let n = r.u32()? as usize;
                let mut polygons = Vec::with_capacity(n);
                for _ in 0..n {
                    let exterior = r.ring()?;
                    let hole_count = r.u32()? as usize;
                    let mut interiors = Vec::with_capacity(hole_count);
                    for _ in 0..hole_count {
                        interiors.push(r.ring()?);
                    }
                    polygons.push(TilePolygon {
                        exterior,
                        interiors,
                    });
                }
                TileGeometry::Polygons(polygons)
            }
            _ => return Err(r.fail("bad geometry tag")),
        };
        Ok(RenderedFeature {
            tile: TileCoord::from_id(tile_id),
            layer,
            z_order,
            feature_id,
            geometry,
            attrs,
            group,
        })
    }

    /// Attrs as a map, for grouping comparisons.
    pub fn attr_map(&self) -> HashMap<&str, &FieldValue> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_ring(buf: &mut Vec<u8>, points: &[(i32, i32)]) {
    buf.extend_from_slice(&(points.len() as u32).to_le_bytes());
    for &(x, y) in points {
        buf.extend_from_slice(&x.to_le_bytes());
        buf.extend_from_slice(&y.to_le_bytes());
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn fail(&self, reason: &'static str) -> PayloadError {
        PayloadError {
            at: self.pos,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        if self.pos + n > self.bytes.len() {
            return Err(self.fail("truncated"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PayloadError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    fn u8(&mut self) -> Result<u8, PayloadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PayloadError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, PayloadError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, PayloadError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, PayloadError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, PayloadError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.fail("invalid utf-8"))
    }

    fn ring(&mut self) -> Result<Vec<(i32, i32)>, PayloadError> {
        let n = self.u32()? as usize;
        let mut out = Vec::with_capacity(n.min(1 << 20));
        for _ in 0..n {
            let x = self.i32()?;
            let y = self.i32()?;
            out.push((x, y));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RenderedFeature {
        RenderedFeature {
            tile: TileCoord::new(3, 5, 4).unwrap(),
            layer: "aerodrome_label".to_string(),
            z_order: -7,
            feature_id: 42,
            geometry: TileGeometry::Polygons(vec![TilePolygon {
                exterior: vec![(0, 0), (100, 0), (100, 100), (0, 100), (0, 0)],
                interiors: vec![vec![(40, 40), (60, 40), (60, 60), (40, 40)]],
            }]),
            attrs: vec![
                ("iata".to_string(), FieldValue::from("XXX")),
                ("elevation".to_string(), FieldValue::from(37i64)),
                ("intl".to_string(), FieldValue::from(true)),
                ("score".to_string(), FieldValue::from(0.5f64)),
            ],
            group: Some((7, 3)),
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let feature = sample();
        let decoded = RenderedFeature::decode(&feature.encode()).unwrap();
        assert_eq!(decoded, feature);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let bytes = sample().encode();
        assert!(RenderedFeature::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_sort_key_orders_tile_then_layer_then_z() {
        let a = SortKey::pack(5, 0, 0);
        let b = SortKey::pack(5, 1, -100);
        let c = SortKey::pack(6, 0, -100);
        assert!(a < b && b < c);
        let low = SortKey::pack(9, 2, -1);
        let high = SortKey::pack(9, 2, 1);
        assert!(low < high);
    }

    #[test]
    fn test_sort_key_unpacks() {
        let key = SortKey::pack(1234, 9, -55);
        assert_eq!(key.tile_id(), 1234);
        assert_eq!(key.layer_id(), 9);
        assert_eq!(key.z_order(), -55);
    }

    #[test]
    fn test_layer_registry_is_stable() {
        let registry = LayerRegistry::new();
        let a = registry.id("water");
        let b = registry.id("roads");
        assert_ne!(a, b);
        assert_eq!(registry.id("water"), a);
        assert_eq!(registry.id("roads"), b);
    }
}
