//! Local planar frame: maps CRS:84 lon/lat degrees to metres around a
//! reference point and back, so that every area and distance the engine
//! computes is planar.

use geo::{Coord, MapCoords, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters.
    pub const A: f64 = 6_378_137.0;

    /// Flattening factor (1 / 298.257223563).
    pub const F: f64 = 1.0 / 298.257_223_563;

    /// First eccentricity squared.
    pub const E2: f64 = F * (2.0 - F);
}

/// How to interpret incoming coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputCs {
    /// Decide from coordinate ranges.
    Auto,
    /// `[lon, lat]` in degrees.
    Geodetic,
    /// Already planar metres.
    Planar,
}

impl fmt::Display for InputCs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputCs::Auto => "auto",
            InputCs::Geodetic => "geodetic",
            InputCs::Planar => "planar",
        };

        f.write_str(s)
    }
}

/// Heuristic: treat the data as geodetic when at least 90% of the sampled
/// vertices fall inside lon/lat bounds.
pub fn detect_input_cs(sample: &[[f64; 2]]) -> InputCs {
    let sample_len = sample.len().max(1) as f64;

    let geo_like = sample
        .iter()
        .filter(|p| p[0].abs() <= 180.0 && p[1].abs() <= 90.0)
        .count();

    if (geo_like as f64) / sample_len >= 0.90 {
        InputCs::Geodetic
    } else {
        InputCs::Planar
    }
}

/// Conversion between storage coordinates and the planar working frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalFrame {
    /// Storage coordinates are already metres.
    Identity,
    /// Curvature-corrected tangent frame around `(lon0, lat0)`.
    Geodetic {
        lon0: f64,
        lat0: f64,
        meters_to_deg_lon: f64,
        meters_to_deg_lat: f64,
    },
}

impl LocalFrame {
    /// Build a frame centred on the given lon/lat bbox.
    pub fn around_bbox(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Self {
        let lat0 = 0.5 * (lat_min + lat_max);
        let lon0 = 0.5 * (lon_min + lon_max);

        // Radii of curvature at the centre latitude.
        let (sin_lat, cos_lat) = lat0.to_radians().sin_cos();
        let denom = (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt();

        // Prime vertical (east-west) and meridional (north-south) radii.
        let n = wgs84::A / denom;
        let m = wgs84::A * (1.0 - wgs84::E2) / (denom * denom * denom);

        LocalFrame::Geodetic {
            lon0,
            lat0,
            meters_to_deg_lon: (1.0 / (n * cos_lat.abs().max(1e-6))).to_degrees(),
            meters_to_deg_lat: (1.0 / m).to_degrees(),
        }
    }

    #[inline]
    pub fn to_planar(&self, c: Coord<f64>) -> Coord<f64> {
        match *self {
            LocalFrame::Identity => c,
            LocalFrame::Geodetic {
                lon0,
                lat0,
                meters_to_deg_lon,
                meters_to_deg_lat,
            } => Coord {
                x: (c.x - lon0) / meters_to_deg_lon,
                y: (c.y - lat0) / meters_to_deg_lat,
            },
        }
    }

    #[inline]
    pub fn to_storage(&self, c: Coord<f64>) -> Coord<f64> {
        match *self {
            LocalFrame::Identity => c,
            LocalFrame::Geodetic {
                lon0,
                lat0,
                meters_to_deg_lon,
                meters_to_deg_lat,
            } => Coord {
                x: lon0 + c.x * meters_to_deg_lon,
                y: lat0 + c.y * meters_to_deg_lat,
            },
        }
    }

    pub fn polygon_to_planar(&self, polygon: &Polygon<f64>) -> Polygon<f64> {
        polygon.map_coords(|c| self.to_planar(c))
    }

    pub fn multi_polygon_to_storage(&self, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        geometry.map_coords(|c| self.to_storage(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_geodetic_and_planar_samples() {
        let lonlat = [[-1.5, 52.1], [-1.4, 52.2], [-1.3, 52.0]];
        assert_eq!(detect_input_cs(&lonlat), InputCs::Geodetic);

        let bng = [[451_000.0, 206_000.0], [452_500.0, 207_250.0]];
        assert_eq!(detect_input_cs(&bng), InputCs::Planar);
    }

    #[test]
    fn geodetic_frame_round_trips_and_scales_sensibly() {
        let frame = LocalFrame::around_bbox(-1.6, 52.0, -1.4, 52.2);
        let p = Coord { x: -1.45, y: 52.15 };
        let back = frame.to_storage(frame.to_planar(p));
        assert!((back.x - p.x).abs() < 1e-12 && (back.y - p.y).abs() < 1e-12);

        // One hundredth of a degree of latitude is roughly 1.11 km.
        let a = frame.to_planar(Coord { x: -1.5, y: 52.10 });
        let b = frame.to_planar(Coord { x: -1.5, y: 52.11 });
        let d = (b.y - a.y).abs();
        assert!((1_100.0..1_125.0).contains(&d), "d = {d}");
    }
}
