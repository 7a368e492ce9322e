use geo::{Area, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a raw candidate polygon (`polygon_id` in the input data).
pub type CandidateId = i64;

/// Closed set of habitat types. The discriminant is the wire code used in
/// the `h_type` property of input and output features.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HabitatType {
    None = 0,
    Urban = 10,
    Wood = 20,
    Wetland = 30,
    Water = 31,
    River = 32,
    Grassland = 40,
    Arable = 50,
    Seminatural = 60,
    Mountain = 70,
}

impl HabitatType {
    pub const ALL: [HabitatType; 10] = [
        HabitatType::None,
        HabitatType::Urban,
        HabitatType::Wood,
        HabitatType::Wetland,
        HabitatType::Water,
        HabitatType::River,
        HabitatType::Grassland,
        HabitatType::Arable,
        HabitatType::Seminatural,
        HabitatType::Mountain,
    ];

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code. Unknown codes are rejected rather than mapped to `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Output class name written next to the code in exported habitats.
    pub fn class_name(self) -> &'static str {
        match self {
            HabitatType::None => "none",
            HabitatType::Urban => "hab_builtup",
            HabitatType::Wood => "hab_wood",
            HabitatType::Wetland | HabitatType::Water | HabitatType::River => "hab_fwater",
            HabitatType::Grassland => "hab_impgrass",
            HabitatType::Arable => "hab_arable",
            HabitatType::Seminatural => "hab_sngrass",
            HabitatType::Mountain => "hab_mountain",
        }
    }
}

impl fmt::Display for HabitatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HabitatType::None => "none",
            HabitatType::Urban => "urban",
            HabitatType::Wood => "wood",
            HabitatType::Wetland => "wetland",
            HabitatType::Water => "water",
            HabitatType::River => "river",
            HabitatType::Grassland => "grassland",
            HabitatType::Arable => "arable",
            HabitatType::Seminatural => "seminatural",
            HabitatType::Mountain => "mountain",
        };

        f.write_str(s)
    }
}

/// A raw polygon awaiting merge evaluation. Geometry is in planar metres.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: CandidateId,
    pub habitat_type: HabitatType,
    pub geometry: Polygon<f64>,
    /// Planar area in m².
    pub area: f64,
}

impl Candidate {
    /// Build a candidate, computing its planar area.
    pub fn new(id: CandidateId, habitat_type: HabitatType, geometry: Polygon<f64>) -> Self {
        let area = geometry.unsigned_area();
        Self {
            id,
            habitat_type,
            geometry,
            area,
        }
    }
}

/// One hit of a proximity query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: CandidateId,
    /// Planar distance in metres between the query geometry and this candidate.
    pub distance: f64,
    pub area: f64,
}

/// A committed output row.
#[derive(Debug, Clone)]
pub struct ConsolidatedHabitat {
    pub representative_id: CandidateId,
    pub habitat_type: HabitatType,
    pub geometry: MultiPolygon<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_and_unknown_codes_are_rejected() {
        for t in HabitatType::ALL {
            assert_eq!(HabitatType::from_code(t.code()), Some(t));
        }
        assert_eq!(HabitatType::from_code(33), None);
        assert_eq!(HabitatType::from_code(255), None);
    }

    #[test]
    fn freshwater_types_share_an_output_class() {
        assert_eq!(HabitatType::Wetland.class_name(), "hab_fwater");
        assert_eq!(HabitatType::River.class_name(), HabitatType::Water.class_name());
        assert_eq!(HabitatType::Wood.class_name(), "hab_wood");
    }
}
