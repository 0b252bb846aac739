//! Source features as consumed by profiles.

use std::cell::OnceCell;
use std::collections::HashMap;

use geo_types::{Coord, Geometry, LineString, Point, Polygon};

use super::value::FieldValue;

/// What kind of source element a feature came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Node,
    Way,
    Relation,
    /// Pre-built point from an auxiliary source.
    Point,
    /// Pre-built line from an auxiliary source.
    Line,
    /// Pre-built polygon from an auxiliary source.
    Polygon,
}

impl ElementKind {
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Node => "node",
            ElementKind::Way => "way",
            ElementKind::Relation => "relation",
            ElementKind::Point => "point",
            ElementKind::Line => "line",
            ElementKind::Polygon => "polygon",
        }
    }
}

/// Membership of a way in a parent relation, as seen in pass-2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRole {
    pub relation_id: u64,
    pub role: String,
}

/// Coordinates as delivered by a reader, before any geometry validation.
#[derive(Debug, Clone)]
pub enum RawGeometry {
    Point { lon: f64, lat: f64 },
    /// Open way / polyline, lon-lat pairs in source order.
    Line(Vec<(f64, f64)>),
    /// Closed way; interpreted as polygon or line depending on what the
    /// profile asks for.
    ClosedRing(Vec<(f64, f64)>),
    /// Assembled multipolygon rings; `(ring, is_inner)`.
    MultiPolygon(Vec<(Vec<(f64, f64)>, bool)>),
}

/// One feature from a source, as handed to [`crate::profile::Profile`].
///
/// Geometry is a thunk: nothing past the raw coordinate list exists until a
/// profile callback asks, and the built [`Geometry`] is cached for the
/// renderer. A profile that bails on tags alone never pays for geometry.
pub struct SourceFeature {
    id: u64,
    kind: ElementKind,
    source: &'static str,
    tags: HashMap<String, FieldValue>,
    raw: RawGeometry,
    relations: Vec<RelationRole>,
    geometry: OnceCell<Result<Geometry<f64>, String>>,
}

impl SourceFeature {
    pub fn new(
        id: u64,
        kind: ElementKind,
        tags: HashMap<String, FieldValue>,
        raw: RawGeometry,
    ) -> Self {
        Self {
            id,
            kind,
            source: "osm",
            tags,
            raw,
            relations: Vec::new(),
            geometry: OnceCell::new(),
        }
    }

    pub fn with_source(mut self, source: &'static str) -> Self {
        self.source = source;
        self
    }

    pub fn with_relations(mut self, relations: Vec<RelationRole>) -> Self {
        self.relations = relations;
        self
    }

    /// Name of the source this feature came from (`osm`, `water_polygons`…).
    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn tags(&self) -> &HashMap<String, FieldValue> {
        &self.tags
    }

    /// String value of a tag, if present and a string.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(FieldValue::as_str)
    }

    /// True when `key` is present with exactly `value`.
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tag(key) == Some(value)
    }

    pub fn relations(&self) -> &[RelationRole] {
        &self.relations
    }

    /// True for closed ways and assembled multipolygons.
    pub fn can_be_polygon(&self) -> bool {
        matches!(
            self.raw,
            RawGeometry::ClosedRing(_) | RawGeometry::MultiPolygon(_)
        ) || self.kind == ElementKind::Polygon
    }

    pub fn is_point(&self) -> bool {
        matches!(self.raw, RawGeometry::Point { .. })
    }

    /// Lon-lat geometry, built and cached on first access.
    pub fn geometry(&self) -> Result<&Geometry<f64>, String> {
        self.geometry
            .get_or_init(|| build_geometry(&self.raw))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// The raw coordinates, for callers that want them untyped.
    pub fn raw_geometry(&self) -> &RawGeometry {
        &self.raw
    }
}

fn build_geometry(raw: &RawGeometry) -> Result<Geometry<f64>, String> {
    match raw {
        RawGeometry::Point { lon, lat } => Ok(Geometry::Point(Point::new(*lon, *lat))),
        RawGeometry::Line(points) => {
            if points.len() < 2 {
                return Err(format!("line with {} points", points.len()));
            }
            Ok(Geometry::LineString(to_line_string(points)))
        }
        RawGeometry::ClosedRing(points) => {
            if points.len() < 4 {
                return Err(format!("ring with {} points", points.len()));
            }
            Ok(Geometry::Polygon(Polygon::new(
                to_line_string(points),
                vec![],
            )))
        }
        RawGeometry::MultiPolygon(rings) => {
            let mut outers: Vec<Polygon<f64>> = Vec::new();
            let mut inners: Vec<LineString<f64>> = Vec::new();
            for (ring, is_inner) in rings {
                if ring.len() < 4 {
                    return Err(format!("multipolygon ring with {} points", ring.len()));
                }
                if *is_inner {
                    inners.push(to_line_string(ring));
                } else {
                    outers.push(Polygon::new(to_line_string(ring), vec![]));
                }
            }
            if outers.is_empty() {
                return Err("multipolygon without outer ring".to_string());
            }
            // Inner rings attach to the single outer when unambiguous; with
            // several outers each inner goes to the first container by bbox.
            let mut polygons: Vec<Polygon<f64>> = outers;
            for inner in inners {
                let target = polygons
                    .iter()
                    .position(|p| bbox_contains(p.exterior(), &inner))
                    .unwrap_or(0);
                let (exterior, mut interiors) = polygons[target].clone().into_inner();
                interiors.push(inner);
                polygons[target] = Polygon::new(exterior, interiors);
            }
            if polygons.len() == 1 {
                Ok(Geometry::Polygon(polygons.pop().unwrap()))
            } else {
                Ok(Geometry::MultiPolygon(polygons.into()))
            }
        }
    }
}

fn to_line_string(points: &[(f64, f64)]) -> LineString<f64> {
    LineString::from(
        points
            .iter()
            .map(|&(x, y)| Coord { x, y })
            .collect::<Vec<_>>(),
    )
}

fn bbox_contains(outer: &LineString<f64>, inner: &LineString<f64>) -> bool {
    let bounds = |ls: &LineString<f64>| {
        let mut b = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for c in ls.coords() {
            b.0 = b.0.min(c.x);
            b.1 = b.1.min(c.y);
            b.2 = b.2.max(c.x);
            b.3 = b.3.max(c.y);
        }
        b
    };
    let o = bounds(outer);
    let i = bounds(inner);
    i.0 >= o.0 && i.1 >= o.1 && i.2 <= o.2 && i.3 <= o.3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_point_geometry() {
        let f = SourceFeature::new(
            1,
            ElementKind::Node,
            tags(&[("amenity", "airport")]),
            RawGeometry::Point { lon: 1.0, lat: 2.0 },
        );
        assert!(f.is_point());
        match f.geometry().unwrap() {
            Geometry::Point(p) => {
                assert_eq!(p.x(), 1.0);
                assert_eq!(p.y(), 2.0);
            }
            other => panic!("unexpected geometry {:?}", other),
        }
    }

    #[test]
    fn test_geometry_is_cached() {
        let f = SourceFeature::new(
            1,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::Line(vec![(0.0, 0.0), (1.0, 1.0)]),
        );
        let a = f.geometry().unwrap() as *const _;
        let b = f.geometry().unwrap() as *const _;
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_line_is_an_error() {
        let f = SourceFeature::new(
            1,
            ElementKind::Way,
            HashMap::new(),
            RawGeometry::Line(vec![(0.0, 0.0)]),
        );
        assert!(f.geometry().is_err());
    }

    #[test]
    fn test_tag_lookup() {
        let f = SourceFeature::new(
            1,
            ElementKind::Node,
            tags(&[("iata", "TXL")]),
            RawGeometry::Point { lon: 0.0, lat: 0.0 },
        );
        assert_eq!(f.tag("iata"), Some("TXL"));
        assert!(f.has_tag("iata", "TXL"));
        assert!(!f.has_tag("iata", "SXF"));
    }

    #[test]
    fn test_multipolygon_assigns_inner_to_containing_outer() {
        let outer = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)];
        let inner = vec![(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0), (4.0, 4.0)];
        let f = SourceFeature::new(
            9,
            ElementKind::Relation,
            HashMap::new(),
            RawGeometry::MultiPolygon(vec![(outer, false), (inner, true)]),
        );
        match f.geometry().unwrap() {
            Geometry::Polygon(p) => assert_eq!(p.interiors().len(), 1),
            other => panic!("unexpected geometry {:?}", other),
        }
    }
}
