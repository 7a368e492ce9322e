//! Planar polygon primitives used by the consolidation engine.
//!
//! All inputs are in metres. Offsetting and union go through Clipper on an
//! integer lattice (`CLIPPER_FACTOR` units per metre); validity, area,
//! distance and simplification use `geo`.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{
    Area, Contains, Coord, EuclideanDistance, Intersects, Line, LineString, MultiPolygon, Polygon,
    Simplify,
};
use geo_clipper::{Clipper, EndType, JoinType};
use rstar::{RTree, RTreeObject, AABB};
use thiserror::Error;

/// Clipper lattice resolution: 1000 units per metre (millimetres).
pub const CLIPPER_FACTOR: f64 = 1000.0;

/// Arc tolerance for round joins, handed to Clipper as-is.
const ARC_TOLERANCE: f64 = 0.25;

/// Topological shape of a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    SinglePolygon,
    MultiPolygon,
    /// Empty or otherwise not polygonal.
    Other,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnionError {
    #[error("nothing to union")]
    Empty,
    #[error("union produced an invalid geometry ({parts} part(s))")]
    Invalid { parts: usize },
}

/// Offset a polygon outwards by `distance` metres with round joins.
/// A zero distance returns the polygon unchanged.
pub fn buffer(polygon: &Polygon<f64>, distance: f64) -> MultiPolygon<f64> {
    if distance == 0.0 {
        return MultiPolygon::new(vec![polygon.clone()]);
    }

    polygon.offset(
        distance,
        JoinType::Round(ARC_TOLERANCE),
        EndType::ClosedPolygon,
        CLIPPER_FACTOR,
    )
}

/// Union all parts into one geometry. The result is checked for validity.
pub fn union(parts: &[MultiPolygon<f64>]) -> Result<MultiPolygon<f64>, UnionError> {
    let (first, rest) = parts.split_first().ok_or(UnionError::Empty)?;

    let merged = rest
        .iter()
        .fold(first.clone(), |acc, part| acc.union(part, CLIPPER_FACTOR));

    if is_valid(&merged) {
        Ok(merged)
    } else {
        Err(UnionError::Invalid {
            parts: merged.0.len(),
        })
    }
}

pub fn geometry_kind(geometry: &MultiPolygon<f64>) -> GeometryKind {
    match geometry.0.len() {
        0 => GeometryKind::Other,
        1 => GeometryKind::SinglePolygon,
        _ => GeometryKind::MultiPolygon,
    }
}

/// Douglas-Peucker simplification with the given tolerance in metres.
/// The result may be invalid; callers check with [`is_valid`].
#[inline]
pub fn simplify(geometry: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
    geometry.simplify(&tolerance)
}

/// Planar area in m².
#[inline]
pub fn area(geometry: &MultiPolygon<f64>) -> f64 {
    geometry.unsigned_area()
}

/// Planar distance in metres; zero when the polygons touch or overlap.
#[inline]
pub fn distance(a: &Polygon<f64>, b: &Polygon<f64>) -> f64 {
    a.euclidean_distance(b)
}

/// A geometry is valid when it has at least one polygon, every ring is a
/// closed, finite, non-degenerate simple ring, and no two rings cross or
/// overlap along an edge. Rings may touch each other at single points.
/// Holes must lie inside their shell and outside each other, and no polygon
/// may sit inside another polygon of the same geometry.
pub fn is_valid(geometry: &MultiPolygon<f64>) -> bool {
    if geometry.0.is_empty() {
        return false;
    }

    let mut segments = Vec::new();
    let mut ring_no = 0usize;

    for polygon in &geometry.0 {
        let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
        for ring in rings {
            if !ring_is_well_formed(ring) {
                return false;
            }
            push_ring_segments(ring, ring_no, &mut segments);
            ring_no += 1;
        }
    }

    segments_are_simple(segments) && rings_are_nested(geometry)
}

/// With crossings ruled out, a ring is entirely inside or outside another,
/// so testing its vertices decides placement. Vertices on the other ring's
/// boundary are single-point touches and do not count as inside.
fn rings_are_nested(geometry: &MultiPolygon<f64>) -> bool {
    for polygon in &geometry.0 {
        let shell = Polygon::new(polygon.exterior().clone(), vec![]);
        let holes: Vec<Polygon<f64>> = polygon
            .interiors()
            .iter()
            .map(|ring| Polygon::new(ring.clone(), vec![]))
            .collect();

        for (i, hole) in polygon.interiors().iter().enumerate() {
            if !hole.points().all(|p| shell.intersects(&p)) {
                return false;
            }
            let nested = holes
                .iter()
                .enumerate()
                .any(|(j, other)| i != j && hole.points().any(|p| other.contains(&p)));
            if nested {
                return false;
            }
        }
    }

    for (i, a) in geometry.0.iter().enumerate() {
        for (j, b) in geometry.0.iter().enumerate() {
            if i != j && a.exterior().points().any(|p| b.contains(&p)) {
                return false;
            }
        }
    }

    true
}

fn ring_is_well_formed(ring: &LineString<f64>) -> bool {
    if !ring.is_closed() || ring.0.len() < 4 {
        return false;
    }
    if ring.0.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return false;
    }

    Polygon::new(ring.clone(), vec![]).unsigned_area() > 0.0
}

/// A non-degenerate ring edge tagged with its position.
struct Segment {
    line: Line<f64>,
    ring: usize,
    index: usize,
    ring_len: usize,
}

impl RTreeObject for Segment {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        let Coord { x: x0, y: y0 } = self.line.start;
        let Coord { x: x1, y: y1 } = self.line.end;
        AABB::from_corners([x0.min(x1), y0.min(y1)], [x0.max(x1), y0.max(y1)])
    }
}

impl Segment {
    fn adjacent_to(&self, other: &Segment) -> bool {
        if self.ring != other.ring {
            return false;
        }
        let (lo, hi) = (self.index.min(other.index), self.index.max(other.index));
        hi - lo == 1 || (lo == 0 && hi + 1 == self.ring_len)
    }
}

fn push_ring_segments(ring: &LineString<f64>, ring_no: usize, out: &mut Vec<Segment>) {
    // Repeated vertices are tolerated; they only produce zero-length edges.
    let lines: Vec<Line<f64>> = ring.lines().filter(|l| l.start != l.end).collect();
    let ring_len = lines.len();

    out.extend(lines.into_iter().enumerate().map(|(index, line)| Segment {
        line,
        ring: ring_no,
        index,
        ring_len,
    }));
}

fn segments_are_simple(segments: Vec<Segment>) -> bool {
    // Degenerate rings (all points coincident) are caught by the area check.
    let tree = RTree::bulk_load(segments);

    for a in tree.iter() {
        for b in tree.locate_in_envelope_intersecting(&a.envelope()) {
            // Each unordered pair once.
            if (b.ring, b.index) <= (a.ring, a.index) {
                continue;
            }

            let Some(hit) = line_intersection(a.line, b.line) else {
                continue;
            };

            let ok = match hit {
                LineIntersection::Collinear { .. } => false,
                LineIntersection::SinglePoint { is_proper, .. } => {
                    if a.adjacent_to(b) {
                        !is_proper
                    } else if a.ring == b.ring {
                        false
                    } else {
                        !is_proper
                    }
                }
            };

            if !ok {
                return false;
            }
        }
    }

    true
}
