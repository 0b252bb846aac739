//! Minimal ESRI shapefile reader.
//!
//! Reads the `.shp` geometry stream only: point, polyline, and polygon
//! records, which covers the water-polygon and lake-centerline sidecars.
//! The main file header is 100 bytes (big-endian lengths, little-endian
//! bbox); each record is a big-endian header followed by a little-endian
//! shape. Sources shipped in EPSG:3857 are detected by coordinate range and
//! inverse-projected to lon/lat.

use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use super::{BatchSender, SourceReader};
use crate::error::{PipelineError, Result};
use crate::feature::{ElementKind, RawGeometry, SourceFeature};
use crate::pipeline::CancelToken;

const SHP_MAGIC: i32 = 9994;

const SHAPE_NULL: i32 = 0;
const SHAPE_POINT: i32 = 1;
const SHAPE_POLYLINE: i32 = 3;
const SHAPE_POLYGON: i32 = 5;

/// Web Mercator half-circumference in meters.
const MERC_MAX: f64 = 20_037_508.342789244;

pub struct ShapefileReader {
    name: &'static str,
    path: PathBuf,
}

impl ShapefileReader {
    pub fn new(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
        }
    }
}

impl SourceReader for ShapefileReader {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&mut self, sink: &Sender<Vec<SourceFeature>>, cancel: &CancelToken) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| PipelineError::from_io(&self.path, e))?;
        let mut reader = BufReader::with_capacity(1 << 20, file);

        let header = read_bytes::<100>(&mut reader, &self.path)?;
        let magic = i32::from_be_bytes(header[0..4].try_into().unwrap());
        if magic != SHP_MAGIC {
            return Err(PipelineError::SourceParse {
                path: self.path.clone(),
                message: format!("bad shapefile magic {:#x}", magic),
            });
        }
        // Header bbox tells us whether coordinates are degrees or meters.
        let min_x = f64::from_le_bytes(header[36..44].try_into().unwrap());
        let max_x = f64::from_le_bytes(header[52..60].try_into().unwrap());
        let mercator = min_x.abs() > 360.0 || max_x.abs() > 360.0;
        debug!(
            path = %self.path.display(),
            mercator,
            "reading shapefile"
        );

        let mut batch = BatchSender::new(sink, cancel);
        let mut record_id = 0u64;
        loop {
            let mut record_header = [0u8; 8];
            match reader.read_exact(&mut record_header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(PipelineError::from_io(&self.path, e)),
            }
            // Content length is in 16-bit words.
            let content_words =
                i32::from_be_bytes(record_header[4..8].try_into().unwrap());
            let content_len = (content_words as usize) * 2;
            let mut content = vec![0u8; content_len];
            reader
                .read_exact(&mut content)
                .map_err(|e| PipelineError::from_io(&self.path, e))?;
            record_id += 1;
            match parse_record(&content, mercator) {
                Ok(geometries) => {
                    for raw in geometries {
                        let kind = match &raw {
                            RawGeometry::Point { .. } => ElementKind::Point,
                            RawGeometry::Line(_) => ElementKind::Line,
                            _ => ElementKind::Polygon,
                        };
                        let feature =
                            SourceFeature::new(record_id, kind, Default::default(), raw)
                                .with_source(self.name);
                        batch.push(feature)?;
                    }
                }
                Err(message) => {
                    warn!(record = record_id, %message, "skipping bad shapefile record");
                }
            }
        }
        batch.flush()
    }
}

fn read_bytes<const N: usize>(reader: &mut impl Read, path: &Path) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|e| PipelineError::from_io(path, e))?;
    Ok(buf)
}

/// Parses one record's content into raw lon/lat geometries (a multi-part
/// polyline yields one line per part).
fn parse_record(content: &[u8], mercator: bool) -> std::result::Result<Vec<RawGeometry>, String> {
    let mut cursor = Cursor::new(content);
    let shape_type = cursor.i32()?;
    let project = |x: f64, y: f64| -> (f64, f64) {
        if mercator {
            mercator_to_lon_lat(x, y)
        } else {
            (x, y)
        }
    };
    match shape_type {
        SHAPE_NULL => Ok(Vec::new()),
        SHAPE_POINT => {
            let x = cursor.f64()?;
            let y = cursor.f64()?;
            let (lon, lat) = project(x, y);
            Ok(vec![RawGeometry::Point { lon, lat }])
        }
        SHAPE_POLYLINE | SHAPE_POLYGON => {
            cursor.skip(32)?; // bbox
            let num_parts = cursor.i32()? as usize;
            let num_points = cursor.i32()? as usize;
            if num_parts == 0 || num_points == 0 {
                return Ok(Vec::new());
            }
            let mut parts = Vec::with_capacity(num_parts);
            for _ in 0..num_parts {
                parts.push(cursor.i32()? as usize);
            }
            let mut points = Vec::with_capacity(num_points);
            for _ in 0..num_points {
                let x = cursor.f64()?;
                let y = cursor.f64()?;
                points.push(project(x, y));
            }
            let mut rings: Vec<Vec<(f64, f64)>> = Vec::with_capacity(num_parts);
            for (i, &start) in parts.iter().enumerate() {
                let end = parts.get(i + 1).copied().unwrap_or(num_points);
                if start >= end || end > num_points {
                    return Err(format!("bad part range {}..{}", start, end));
                }
                rings.push(points[start..end].to_vec());
            }
            if shape_type == SHAPE_POLYLINE {
                Ok(rings
                    .into_iter()
                    .filter(|part| part.len() >= 2)
                    .map(RawGeometry::Line)
                    .collect())
            } else {
                // Shapefile polygons: clockwise rings are outer, counter-
                // clockwise are holes (y-up convention).
                let tagged = rings
                    .into_iter()
                    .filter(|r| r.len() >= 4)
                    .map(|ring| {
                        let inner = shoelace(&ring) > 0.0;
                        (ring, inner)
                    })
                    .collect::<Vec<_>>();
                if tagged.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![RawGeometry::MultiPolygon(tagged)])
            }
        }
        other => Err(format!("unsupported shape type {}", other)),
    }
}

fn shoelace(ring: &[(f64, f64)]) -> f64 {
    let mut area = 0.0;
    for i in 0..ring.len() {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % ring.len()];
        area += x0 * y1 - x1 * y0;
    }
    area / 2.0
}

fn mercator_to_lon_lat(x: f64, y: f64) -> (f64, f64) {
    let lon = x / MERC_MAX * 180.0;
    let lat = ((y / MERC_MAX * PI).sinh()).atan() * 180.0 / PI;
    (lon, lat)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err(format!("truncated record at byte {}", self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> std::result::Result<(), String> {
        self.take(n).map(|_| ())
    }

    fn i32(&mut self) -> std::result::Result<i32, String> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> std::result::Result<f64, String> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a tiny one-record shapefile in memory, then writes it out.
    fn write_shapefile(path: &Path, shape_type: i32, content: &[u8]) {
        let mut file_bytes = Vec::new();
        let total_words = (100 + 8 + content.len() + 4) / 2;
        file_bytes.extend_from_slice(&SHP_MAGIC.to_be_bytes());
        file_bytes.extend_from_slice(&[0u8; 20]);
        file_bytes.extend_from_slice(&(total_words as i32).to_be_bytes());
        file_bytes.extend_from_slice(&1000i32.to_le_bytes());
        file_bytes.extend_from_slice(&shape_type.to_le_bytes());
        // bbox + z/m ranges, all zero (degree-range coordinates)
        file_bytes.extend_from_slice(&[0u8; 64]);
        assert_eq!(file_bytes.len(), 100);
        // one record
        file_bytes.extend_from_slice(&1i32.to_be_bytes());
        let words = (content.len() + 4) / 2;
        file_bytes.extend_from_slice(&(words as i32).to_be_bytes());
        file_bytes.extend_from_slice(&shape_type.to_le_bytes());
        file_bytes.extend_from_slice(content);
        std::fs::write(path, file_bytes).unwrap();
    }

    fn read_all(path: &Path) -> Vec<SourceFeature> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reader = ShapefileReader::new("water_polygons", path);
        reader.read(&tx, &CancelToken::new()).unwrap();
        drop(tx);
        rx.iter().flatten().collect()
    }

    #[test]
    fn test_point_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.shp");
        let mut content = Vec::new();
        content.extend_from_slice(&12.5f64.to_le_bytes());
        content.extend_from_slice(&(-33.0f64).to_le_bytes());
        write_shapefile(&path, SHAPE_POINT, &content);
        let features = read_all(&path);
        assert_eq!(features.len(), 1);
        match features[0].raw_geometry() {
            RawGeometry::Point { lon, lat } => {
                assert_eq!(*lon, 12.5);
                assert_eq!(*lat, -33.0);
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_polygon_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("water.shp");
        let mut content = Vec::new();
        content.extend_from_slice(&[0u8; 32]); // bbox
        content.extend_from_slice(&1i32.to_le_bytes()); // num parts
        content.extend_from_slice(&5i32.to_le_bytes()); // num points
        content.extend_from_slice(&0i32.to_le_bytes()); // part offset
        // Clockwise square (outer ring in shapefile convention).
        for (x, y) in [(0.0, 0.0), (0.0, 2.0), (2.0, 2.0), (2.0, 0.0), (0.0, 0.0)] {
            content.extend_from_slice(&(x as f64).to_le_bytes());
            content.extend_from_slice(&(y as f64).to_le_bytes());
        }
        write_shapefile(&path, SHAPE_POLYGON, &content);
        let features = read_all(&path);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].source(), "water_polygons");
        match features[0].raw_geometry() {
            RawGeometry::MultiPolygon(rings) => {
                assert_eq!(rings.len(), 1);
                assert!(!rings[0].1, "clockwise ring is outer");
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_bad_magic_is_source_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.shp");
        std::fs::write(&path, [0u8; 200]).unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut reader = ShapefileReader::new("water_polygons", &path);
        assert!(matches!(
            reader.read(&tx, &CancelToken::new()),
            Err(PipelineError::SourceParse { .. })
        ));
    }

    #[test]
    fn test_mercator_inverse_projection() {
        let (lon, lat) = mercator_to_lon_lat(MERC_MAX, 0.0);
        assert!((lon - 180.0).abs() < 1e-9);
        assert!(lat.abs() < 1e-9);
        let (_, lat) = mercator_to_lon_lat(0.0, MERC_MAX);
        assert!((lat - 85.05112878).abs() < 1e-6);
    }
}
