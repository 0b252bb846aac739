//! Natural Earth reader over its SQLite packaging.
//!
//! Every `ne_*` table is streamed; non-geometry columns become tags (plus a
//! `table` tag so profiles can tell themes apart) and the geometry column is
//! decoded from WKB. Blobs may carry a GeoPackage header or an EWKB SRID
//! prefix; both are skipped.

use std::collections::HashMap;
use std::path::PathBuf;

use crossbeam_channel::Sender;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::{debug, warn};

use super::{BatchSender, SourceReader};
use crate::error::{PipelineError, Result};
use crate::feature::{ElementKind, FieldValue, RawGeometry, SourceFeature};
use crate::pipeline::CancelToken;

pub struct NaturalEarthReader {
    path: PathBuf,
}

impl NaturalEarthReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SourceReader for NaturalEarthReader {
    fn name(&self) -> &'static str {
        "natural_earth"
    }

    fn read(&mut self, sink: &Sender<Vec<SourceFeature>>, cancel: &CancelToken) -> Result<()> {
        let conn = Connection::open_with_flags(
            &self.path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'ne_%'")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        debug!(tables = tables.len(), "reading natural earth");

        let mut batch = BatchSender::new(sink, cancel);
        let mut feature_id = 0u64;
        for table in &tables {
            cancel.check()?;
            let mut stmt = conn.prepare(&format!("SELECT * FROM \"{}\"", table))?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                feature_id += 1;
                let mut tags: HashMap<String, FieldValue> = HashMap::new();
                tags.insert("table".to_string(), FieldValue::from(table.as_str()));
                let mut geometry: Option<RawGeometry> = None;
                for (idx, name) in column_names.iter().enumerate() {
                    let value = row.get_ref(idx)?;
                    if name.eq_ignore_ascii_case("geometry") {
                        if let ValueRef::Blob(blob) = value {
                            match parse_wkb(blob) {
                                Ok(parsed) => geometry = parsed,
                                Err(message) => {
                                    warn!(table = %table, row = feature_id, %message,
                                        "skipping bad geometry");
                                }
                            }
                        }
                        continue;
                    }
                    match value {
                        ValueRef::Integer(v) => {
                            tags.insert(name.to_lowercase(), FieldValue::I64(v));
                        }
                        ValueRef::Real(v) => {
                            tags.insert(name.to_lowercase(), FieldValue::F64(v));
                        }
                        ValueRef::Text(v) => {
                            if let Ok(text) = std::str::from_utf8(v) {
                                tags.insert(name.to_lowercase(), FieldValue::from(text));
                            }
                        }
                        ValueRef::Null | ValueRef::Blob(_) => {}
                    }
                }
                let Some(raw) = geometry else { continue };
                let kind = match &raw {
                    RawGeometry::Point { .. } => ElementKind::Point,
                    RawGeometry::Line(_) => ElementKind::Line,
                    _ => ElementKind::Polygon,
                };
                batch.push(
                    SourceFeature::new(feature_id, kind, tags, raw)
                        .with_source("natural_earth"),
                )?;
            }
        }
        batch.flush()
    }
}

// ---------------------------------------------------------------------------
// WKB decoding (points, linestrings, polygons, and their multis)
// ---------------------------------------------------------------------------

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;

const EWKB_SRID_FLAG: u32 = 0x2000_0000;

/// Decodes a WKB blob into raw geometry; `None` for empty geometries.
pub(crate) fn parse_wkb(blob: &[u8]) -> std::result::Result<Option<RawGeometry>, String> {
    let blob = strip_gpkg_header(blob)?;
    let mut cursor = WkbCursor {
        bytes: blob,
        pos: 0,
        little: true,
    };
    parse_geometry(&mut cursor)
}

/// GeoPackage blobs start with magic "GP"; skip the header and envelope.
fn strip_gpkg_header(blob: &[u8]) -> std::result::Result<&[u8], String> {
    if blob.len() >= 8 && blob[0] == b'G' && blob[1] == b'P' {
        let flags = blob[3];
        let envelope_len = match (flags >> 1) & 0x07 {
            0 => 0,
            1 => 32,
            2 | 3 => 48,
            4 => 64,
            other => return Err(format!("bad gpkg envelope code {}", other)),
        };
        let offset = 8 + envelope_len;
        if blob.len() < offset {
            return Err("truncated gpkg header".to_string());
        }
        Ok(&blob[offset..])
    } else {
        Ok(blob)
    }
}

fn parse_geometry(
    cursor: &mut WkbCursor<'_>,
) -> std::result::Result<Option<RawGeometry>, String> {
    let kind = cursor.header()?;
    match kind {
        WKB_POINT => {
            let (lon, lat) = cursor.point()?;
            Ok(Some(RawGeometry::Point { lon, lat }))
        }
        WKB_LINESTRING => {
            let points = cursor.point_run()?;
            if points.len() < 2 {
                return Ok(None);
            }
            Ok(Some(RawGeometry::Line(points)))
        }
        WKB_POLYGON => Ok(polygon_rings(cursor)?.map(RawGeometry::MultiPolygon)),
        WKB_MULTIPOINT => {
            // Uncommon in Natural Earth; take the first point.
            let n = cursor.u32()?;
            if n == 0 {
                return Ok(None);
            }
            cursor.header()?;
            let (lon, lat) = cursor.point()?;
            Ok(Some(RawGeometry::Point { lon, lat }))
        }
        WKB_MULTILINESTRING => {
            let n = cursor.u32()?;
            let mut longest: Vec<(f64, f64)> = Vec::new();
            for _ in 0..n {
                let inner = cursor.header()?;
                if inner != WKB_LINESTRING {
                    return Err(format!("unexpected {} in multilinestring", inner));
                }
                let points = cursor.point_run()?;
                if points.len() > longest.len() {
                    longest = points;
                }
            }
            if longest.len() < 2 {
                return Ok(None);
            }
            Ok(Some(RawGeometry::Line(longest)))
        }
        WKB_MULTIPOLYGON => {
            let n = cursor.u32()?;
            let mut rings = Vec::new();
            for _ in 0..n {
                let inner = cursor.header()?;
                if inner != WKB_POLYGON {
                    return Err(format!("unexpected {} in multipolygon", inner));
                }
                if let Some(mut polygon) = polygon_rings(cursor)? {
                    rings.append(&mut polygon);
                }
            }
            if rings.is_empty() {
                return Ok(None);
            }
            Ok(Some(RawGeometry::MultiPolygon(rings)))
        }
        other => Err(format!("unsupported wkb type {}", other)),
    }
}

/// Rings of one polygon: first is outer, the rest are holes.
fn polygon_rings(
    cursor: &mut WkbCursor<'_>,
) -> std::result::Result<Option<Vec<(Vec<(f64, f64)>, bool)>>, String> {
    let ring_count = cursor.u32()? as usize;
    let mut rings = Vec::with_capacity(ring_count);
    for i in 0..ring_count {
        let ring = cursor.point_run()?;
        if ring.len() >= 4 {
            rings.push((ring, i > 0));
        }
    }
    if rings.is_empty() || rings[0].1 {
        return Ok(None);
    }
    Ok(Some(rings))
}

struct WkbCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    little: bool,
}

impl WkbCursor<'_> {
    fn take(&mut self, n: usize) -> std::result::Result<&[u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err(format!("truncated wkb at byte {}", self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a geometry header (byte order + type), returning the base type
    /// with any EWKB SRID prefix consumed.
    fn header(&mut self) -> std::result::Result<u32, String> {
        let order = self.take(1)?[0];
        self.little = match order {
            0 => false,
            1 => true,
            other => return Err(format!("bad byte order {}", other)),
        };
        let mut kind = self.u32()?;
        if kind & EWKB_SRID_FLAG != 0 {
            kind &= !EWKB_SRID_FLAG;
            self.take(4)?;
        }
        Ok(kind)
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(if self.little {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }

    fn f64(&mut self) -> std::result::Result<f64, String> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(if self.little {
            f64::from_le_bytes(bytes)
        } else {
            f64::from_be_bytes(bytes)
        })
    }

    fn point(&mut self) -> std::result::Result<(f64, f64), String> {
        Ok((self.f64()?, self.f64()?))
    }

    fn point_run(&mut self) -> std::result::Result<Vec<(f64, f64)>, String> {
        let n = self.u32()? as usize;
        let mut points = Vec::with_capacity(n.min(1 << 20));
        for _ in 0..n {
            points.push(self.point()?);
        }
        Ok(points)
    }
}
