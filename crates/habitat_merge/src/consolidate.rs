//! Per-cluster consolidation: buffer, union, simplify, size check, commit.
//!
//! Every step either succeeds for the whole cluster or fails it as a unit;
//! a failed cluster commits nothing and its members go back to the
//! coordinator as unmerged.

use crate::cluster::Cluster;
use crate::config::MergeConfig;
use geo::MultiPolygon;
use habitat_store::geometry::{self, GeometryKind, UnionError};
use habitat_store::{CandidateId, ConsolidatedHabitat, HabitatType, StoreError, StoreSession};
use log::debug;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("cluster has {0} member(s), need at least 2")]
    TooFewMembers(usize),

    #[error("no thresholds configured for `{0}`")]
    Unconfigured(HabitatType),

    #[error("buffered geometry of {id} is invalid")]
    InvalidMember { id: CandidateId },

    #[error(transparent)]
    InvalidUnion(#[from] UnionError),

    #[error("union is {kind:?}, not a single polygon")]
    NotSinglePolygon { kind: GeometryKind },

    #[error("area {area:.1} m² is below the minimum {min_size:.1} m²")]
    TooSmall { area: f64, min_size: f64 },

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Failure categories, as counted in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    Validation,
    Topology,
    SizeRejected,
    Store,
    /// The worker holding the cluster died before reporting it.
    WorkerLost,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            FailureKind::Validation => "validation",
            FailureKind::Topology => "topology",
            FailureKind::SizeRejected => "size-rejected",
            FailureKind::Store => "store",
            FailureKind::WorkerLost => "worker-lost",
        })
    }
}

impl ConsolidationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConsolidationError::TooFewMembers(_)
            | ConsolidationError::Unconfigured(_)
            | ConsolidationError::InvalidMember { .. }
            | ConsolidationError::InvalidUnion(_) => FailureKind::Validation,
            ConsolidationError::NotSinglePolygon { .. } => FailureKind::Topology,
            ConsolidationError::TooSmall { .. } => FailureKind::SizeRejected,
            ConsolidationError::Store(_) => FailureKind::Store,
        }
    }
}

/// What a successful consolidation committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merged {
    pub representative: CandidateId,
    pub area: f64,
    /// Tolerance that produced the committed geometry; `None` if unsimplified.
    pub tolerance: Option<f64>,
}

/// Simplify with the largest tolerance that still yields a valid geometry.
///
/// Starts at `max_tolerance` and halves while the tolerance is above
/// `floor`. Falls back to the input when no tolerance works.
pub fn adaptive_simplify(
    shape: &MultiPolygon<f64>,
    max_tolerance: f64,
    floor: f64,
) -> (MultiPolygon<f64>, Option<f64>) {
    let mut tolerance = max_tolerance;
    while tolerance > floor {
        let simplified = geometry::simplify(shape, tolerance);
        if geometry::is_valid(&simplified) {
            return (simplified, Some(tolerance));
        }
        tolerance /= 2.0;
    }
    (shape.clone(), None)
}

/// Merge one cluster into a single habitat keyed by its first member.
pub fn consolidate_cluster<S: StoreSession>(
    session: &mut S,
    cluster: &Cluster,
    config: &MergeConfig,
) -> Result<Merged, ConsolidationError> {
    if cluster.len() < 2 {
        return Err(ConsolidationError::TooFewMembers(cluster.len()));
    }

    let representative = cluster.representative();
    let thresholds = config
        .thresholds(cluster.habitat_type)
        .ok_or(ConsolidationError::Unconfigured(cluster.habitat_type))?;

    let members = session.fetch(&cluster.members)?;

    let mut buffered = Vec::with_capacity(members.len());
    for (id, polygon) in &members {
        let grown = geometry::buffer(polygon, thresholds.merge_buffer);
        if !geometry::is_valid(&grown) {
            return Err(ConsolidationError::InvalidMember { id: *id });
        }
        buffered.push(grown);
    }

    let merged = geometry::union(&buffered)?;

    let kind = geometry::geometry_kind(&merged);
    if kind != GeometryKind::SinglePolygon {
        return Err(ConsolidationError::NotSinglePolygon { kind });
    }

    let (simplified, tolerance) = adaptive_simplify(
        &merged,
        config.max_simplify_tolerance,
        config.min_simplify_tolerance,
    );

    let area = geometry::area(&simplified);
    debug!(
        "cluster {representative}: {} members, {area:.1} m², tolerance {tolerance:?}",
        cluster.len()
    );
    if area < config.min_size {
        return Err(ConsolidationError::TooSmall {
            area,
            min_size: config.min_size,
        });
    }

    session.commit(ConsolidatedHabitat {
        representative_id: representative,
        habitat_type: cluster.habitat_type,
        geometry: simplified,
    })?;

    Ok(Merged {
        representative,
        area,
        tolerance,
    })
}
