use crate::types::{Candidate, CandidateId, ConsolidatedHabitat, HabitatType, Neighbor};
use geo::Polygon;
use thiserror::Error;

/// Failure reported by a geometry store. Aborts the current work item only.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("candidate {0} not found")]
    UnknownCandidate(CandidateId),

    #[error("candidate {0} appears more than once")]
    DuplicateCandidate(CandidateId),

    #[error("habitat {0} already committed")]
    DuplicateHabitat(CandidateId),

    #[error("store session unavailable: {0}")]
    Unavailable(String),
}

/// Source of candidates and sink of consolidated habitats.
///
/// A store is shared by reference between workers; each worker opens its own
/// [`StoreSession`] and never shares it.
pub trait GeometryStore: Sync {
    type Session: StoreSession;

    fn open_session(&self) -> Result<Self::Session, StoreError>;
}

/// One worker's connection to a [`GeometryStore`].
pub trait StoreSession: Send {
    /// All candidates whose type is not in `exclude`, ordered by area ascending.
    fn list_candidates(&mut self, exclude: &[HabitatType]) -> Result<Vec<Candidate>, StoreError>;

    /// Same-type candidates within `radius` metres of `geometry`, excluding
    /// `origin` itself.
    fn query_within(
        &mut self,
        origin: CandidateId,
        geometry: &Polygon<f64>,
        habitat_type: HabitatType,
        radius: f64,
    ) -> Result<Vec<Neighbor>, StoreError>;

    /// Geometries for `ids`, in the order requested.
    fn fetch(&mut self, ids: &[CandidateId]) -> Result<Vec<(CandidateId, Polygon<f64>)>, StoreError>;

    /// Persist one consolidated habitat. Either the whole row lands or nothing does.
    fn commit(&mut self, habitat: ConsolidatedHabitat) -> Result<(), StoreError>;
}
