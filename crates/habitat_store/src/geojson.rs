//! GeoJSON import of raw candidates and export of consolidated habitats.
//!
//! Input: a `FeatureCollection` of `Polygon` features whose properties carry
//! `polygon_id` (integer) and `h_type` (habitat code). Output: one feature per
//! habitat with `polygon_id`, `h_type` and `habitat` (class name).

use crate::frame::{detect_input_cs, InputCs, LocalFrame};
use crate::types::{Candidate, CandidateId, ConsolidatedHabitat, HabitatType};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Number of leading vertices inspected when auto-detecting the input CS.
const CS_SAMPLE: usize = 4_096;

#[derive(Debug, Error)]
pub enum GeoJsonError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("feature {index}: {reason}")]
    InvalidFeature { index: usize, reason: String },

    #[error("{0} already exists (pass --overwrite to replace it)")]
    OutputExists(String),
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionIn {
    features: Vec<FeatureIn>,
}

#[derive(Debug, Deserialize)]
struct FeatureIn {
    geometry: GeometryIn,
    properties: PropertiesIn,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GeometryIn {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
}

#[derive(Debug, Deserialize)]
struct PropertiesIn {
    polygon_id: CandidateId,
    h_type: u8,
}

/// Candidates in planar metres plus the frame needed to write results back.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub candidates: Vec<Candidate>,
    pub frame: LocalFrame,
    /// The coordinate system actually used (never `Auto`).
    pub input_cs: InputCs,
}

pub fn read_candidates<R: Read>(reader: R, input_cs: InputCs) -> Result<Dataset, GeoJsonError> {
    let root: FeatureCollectionIn = serde_json::from_reader(BufReader::new(reader))?;

    // Parse everything in storage coordinates first; the frame depends on all of it.
    let mut raw = Vec::with_capacity(root.features.len());
    for (index, feature) in root.features.into_iter().enumerate() {
        let invalid = |reason: String| GeoJsonError::InvalidFeature { index, reason };

        let habitat_type = HabitatType::from_code(feature.properties.h_type)
            .ok_or_else(|| invalid(format!("unknown h_type {}", feature.properties.h_type)))?;

        let GeometryIn::Polygon { coordinates } = feature.geometry;
        let polygon = polygon_from_rings(&coordinates).map_err(invalid)?;

        raw.push((feature.properties.polygon_id, habitat_type, polygon));
    }

    let cs = match input_cs {
        InputCs::Auto => {
            let sample: Vec<[f64; 2]> = raw
                .iter()
                .flat_map(|(_, _, p)| p.exterior().coords())
                .take(CS_SAMPLE)
                .map(|c| [c.x, c.y])
                .collect();
            let guess = detect_input_cs(&sample);
            log::info!("Input CS (auto-detected): {guess}");
            guess
        }
        forced => {
            log::info!("Input CS (forced): {forced}");
            forced
        }
    };

    let frame = match cs {
        InputCs::Geodetic => geodetic_frame(&raw),
        _ => LocalFrame::Identity,
    };

    let candidates = raw
        .into_iter()
        .map(|(id, t, polygon)| Candidate::new(id, t, frame.polygon_to_planar(&polygon)))
        .collect();

    Ok(Dataset {
        candidates,
        frame,
        input_cs: cs,
    })
}

pub fn read_candidates_file(path: &Path, input_cs: InputCs) -> Result<Dataset, GeoJsonError> {
    read_candidates(File::open(path)?, input_cs)
}

fn polygon_from_rings(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>, String> {
    let mut rings = rings.iter().map(|ring| {
        let coords = ring
            .iter()
            .map(|pos| match pos.as_slice() {
                [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
                _ => Err(format!("bad position {pos:?}")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if coords.len() < 3 {
            return Err(format!("ring with {} position(s)", coords.len()));
        }
        Ok(LineString::from(coords))
    });

    let exterior = rings.next().ok_or_else(|| "polygon without rings".to_string())??;
    let interiors = rings.collect::<Result<Vec<_>, _>>()?;

    // Polygon::new closes open rings.
    Ok(Polygon::new(exterior, interiors))
}

fn geodetic_frame(raw: &[(CandidateId, HabitatType, Polygon<f64>)]) -> LocalFrame {
    let (mut lon_min, mut lat_min) = (f64::INFINITY, f64::INFINITY);
    let (mut lon_max, mut lat_max) = (f64::NEG_INFINITY, f64::NEG_INFINITY);

    for c in raw.iter().flat_map(|(_, _, p)| p.exterior().coords()) {
        lon_min = lon_min.min(c.x);
        lon_max = lon_max.max(c.x);
        lat_min = lat_min.min(c.y);
        lat_max = lat_max.max(c.y);
    }

    if !lon_min.is_finite() {
        return LocalFrame::Identity;
    }

    LocalFrame::around_bbox(lon_min, lat_min, lon_max, lat_max)
}

#[derive(Serialize)]
struct FeatureCollectionOut {
    #[serde(rename = "type")]
    kind: &'static str,
    features: Vec<FeatureOut>,
}

#[derive(Serialize)]
struct FeatureOut {
    #[serde(rename = "type")]
    kind: &'static str,
    geometry: GeometryOut,
    properties: PropertiesOut,
}

type Ring = Vec<[f64; 2]>;

#[derive(Serialize)]
#[serde(tag = "type")]
enum GeometryOut {
    Polygon { coordinates: Vec<Ring> },
    MultiPolygon { coordinates: Vec<Vec<Ring>> },
}

#[derive(Serialize)]
struct PropertiesOut {
    polygon_id: CandidateId,
    h_type: u8,
    habitat: &'static str,
}

fn rings_of(polygon: &Polygon<f64>) -> Vec<Ring> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
        .collect()
}

fn geometry_out(geometry: &MultiPolygon<f64>) -> GeometryOut {
    match geometry.0.as_slice() {
        [single] => GeometryOut::Polygon {
            coordinates: rings_of(single),
        },
        many => GeometryOut::MultiPolygon {
            coordinates: many.iter().map(rings_of).collect(),
        },
    }
}

/// Write habitats as a FeatureCollection, converting back to storage coordinates.
/// Features are ordered by representative id.
pub fn write_habitats<W: Write>(
    writer: W,
    habitats: &[ConsolidatedHabitat],
    frame: &LocalFrame,
) -> Result<(), GeoJsonError> {
    let mut sorted: Vec<&ConsolidatedHabitat> = habitats.iter().collect();
    sorted.sort_by_key(|h| h.representative_id);

    let features = sorted
        .into_iter()
        .map(|h| FeatureOut {
            kind: "Feature",
            geometry: geometry_out(&frame.multi_polygon_to_storage(&h.geometry)),
            properties: PropertiesOut {
                polygon_id: h.representative_id,
                h_type: h.habitat_type.code(),
                habitat: h.habitat_type.class_name(),
            },
        })
        .collect();

    let mut out = BufWriter::new(writer);
    serde_json::to_writer(
        &mut out,
        &FeatureCollectionOut {
            kind: "FeatureCollection",
            features,
        },
    )?;
    out.flush()?;
    Ok(())
}

pub fn write_habitats_file(
    path: &Path,
    habitats: &[ConsolidatedHabitat],
    frame: &LocalFrame,
    overwrite: bool,
) -> Result<(), GeoJsonError> {
    if path.exists() && !overwrite {
        return Err(GeoJsonError::OutputExists(path.display().to_string()));
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    write_habitats(file, habitats, frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    const TWO_SQUARES: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature",
             "properties": {"polygon_id": 7, "h_type": 20},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[100,0],[100,100],[0,100],[0,0]]]}},
            {"type": "Feature",
             "properties": {"polygon_id": 8, "h_type": 50, "extra": "ignored"},
             "geometry": {"type": "Polygon", "coordinates": [[[500,0,12.5],[520,0,12.5],[520,20,12.5],[500,20,12.5]]]}}
        ]
    }"#;

    #[test]
    fn reads_planar_candidates_and_closes_rings() {
        let ds = read_candidates(TWO_SQUARES.as_bytes(), InputCs::Auto).unwrap();
        assert_eq!(ds.input_cs, InputCs::Planar);
        assert_eq!(ds.frame, LocalFrame::Identity);
        assert_eq!(ds.candidates.len(), 2);

        let a = &ds.candidates[0];
        assert_eq!((a.id, a.habitat_type), (7, HabitatType::Wood));
        assert_eq!(a.area, 10_000.0);

        let b = &ds.candidates[1];
        assert_eq!(b.habitat_type, HabitatType::Arable);
        assert!(b.geometry.exterior().is_closed());
        assert_eq!(b.area, 400.0);
    }

    #[test]
    fn rejects_unknown_habitat_codes() {
        let doc = TWO_SQUARES.replace("\"h_type\": 50", "\"h_type\": 51");
        let err = read_candidates(doc.as_bytes(), InputCs::Planar).unwrap_err();
        assert!(matches!(err, GeoJsonError::InvalidFeature { index: 1, .. }), "{err}");
    }

    #[test]
    fn geodetic_input_is_measured_in_metres() {
        // Roughly 0.001 deg x 0.001 deg near 52N: about 68.7 m x 111.3 m.
        let doc = r#"{"type":"FeatureCollection","features":[{"type":"Feature",
            "properties":{"polygon_id":1,"h_type":20},
            "geometry":{"type":"Polygon","coordinates":[[[-1.0,52.0],[-0.999,52.0],[-0.999,52.001],[-1.0,52.001],[-1.0,52.0]]]}}]}"#;
        let ds = read_candidates(doc.as_bytes(), InputCs::Auto).unwrap();
        assert_eq!(ds.input_cs, InputCs::Geodetic);
        let area = ds.candidates[0].area;
        assert!((7_500.0..7_800.0).contains(&area), "area = {area}");
    }

    #[test]
    fn written_habitats_can_be_read_back_as_candidates() {
        let habitat = ConsolidatedHabitat {
            representative_id: 42,
            habitat_type: HabitatType::Mountain,
            geometry: MultiPolygon::new(vec![polygon![
                (x: 0.0, y: 0.0),
                (x: 10.0, y: 0.0),
                (x: 10.0, y: 10.0),
                (x: 0.0, y: 0.0),
            ]]),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("habitats.geojson");
        write_habitats_file(&path, &[habitat.clone()], &LocalFrame::Identity, false).unwrap();

        let again = write_habitats_file(&path, &[habitat], &LocalFrame::Identity, false);
        assert!(matches!(again, Err(GeoJsonError::OutputExists(_))));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"habitat\":\"hab_mountain\""));

        let ds = read_candidates_file(&path, InputCs::Planar).unwrap();
        assert_eq!(ds.candidates[0].id, 42);
        assert_eq!(ds.candidates[0].habitat_type, HabitatType::Mountain);
        assert_eq!(ds.candidates[0].area, 50.0);
    }
}
