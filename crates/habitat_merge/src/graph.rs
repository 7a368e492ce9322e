//! Proximity graph: which candidates are close enough to be one feature.
//!
//! Workers each scan a share of the candidates against the whole (read-only)
//! store and return a [`LocalEdges`]; one reducer folds those into a
//! [`ProximityGraph`] after every worker has joined.

use crate::catalog::Catalog;
use crate::config::MergeConfig;
use crate::progress::Tick;
use crate::shutdown::ShutdownToken;
use habitat_store::{Candidate, CandidateId, StoreSession};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

const PROGRESS_EVERY: usize = 1_000;

/// Unordered pair of same-type candidates within merge distance.
pub type Edge = (CandidateId, CandidateId);

/// One worker's share of the graph.
#[derive(Debug, Default)]
pub struct LocalEdges {
    pub edges: Vec<Edge>,
    /// Candidates whose neighbourhood was queried.
    pub queried: usize,
    /// Queries that failed in the store.
    pub store_failures: usize,
}

/// Scan `candidates` for neighbours, stopping early if shutdown is requested.
pub fn search_candidates<S: StoreSession>(
    label: &str,
    session: &mut S,
    candidates: &[&Candidate],
    catalog: &Catalog,
    config: &MergeConfig,
    token: &ShutdownToken,
) -> LocalEdges {
    info!("{label} start ({} candidates)", candidates.len());

    let mut local = LocalEdges::default();
    let mut tick = Tick::new(label, "queried", candidates.len(), PROGRESS_EVERY);

    for candidate in candidates {
        if token.is_cancelled() {
            info!("{label} shutdown after {} candidates", local.queried);
            return local;
        }

        // Unconfigured types were rejected by validation; skip rather than guess.
        let Some(thresholds) = config.thresholds(candidate.habitat_type) else {
            warn!("{label}: no thresholds for {}, skipping {}", candidate.habitat_type, candidate.id);
            continue;
        };

        let matches = match session.query_within(
            candidate.id,
            &candidate.geometry,
            candidate.habitat_type,
            config.search_distance,
        ) {
            Ok(m) => m,
            Err(e) => {
                warn!("{label}: neighbour query for {} failed: {e}", candidate.id);
                local.store_failures += 1;
                continue;
            }
        };

        local.queried += 1;

        if matches.is_empty() {
            debug!("{label}: {} nothing found", candidate.id);
        }

        for neighbor in matches {
            debug!("{label}: {} -> {} at {:.2} m", candidate.id, neighbor.id, neighbor.distance);
            if catalog.contains(neighbor.id) && neighbor.distance <= thresholds.merge_distance {
                local.edges.push((candidate.id, neighbor.id));
            }
        }

        tick.step(local.queried);
    }

    info!("{label} finish ({} edges)", local.edges.len());
    local
}

/// Symmetric adjacency over candidate ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProximityGraph {
    adjacency: BTreeMap<CandidateId, BTreeSet<CandidateId>>,
}

impl ProximityGraph {
    /// Single reducer over every worker's local edges.
    pub fn from_local<'a>(parts: impl IntoIterator<Item = &'a LocalEdges>) -> Self {
        let mut graph = Self::default();
        for part in parts {
            for &(a, b) in &part.edges {
                graph.add_edge(a, b);
            }
        }
        graph
    }

    /// Register `a -- b` in both directions. Self loops are ignored.
    pub fn add_edge(&mut self, a: CandidateId, b: CandidateId) {
        if a == b {
            return;
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
    }

    pub fn neighbors(&self, id: CandidateId) -> impl Iterator<Item = CandidateId> + '_ {
        self.adjacency.get(&id).into_iter().flatten().copied()
    }

    pub fn contains_edge(&self, a: CandidateId, b: CandidateId) -> bool {
        self.adjacency.get(&a).is_some_and(|n| n.contains(&b))
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Number of ids with at least one edge.
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }
}
