use crate::catalog::Catalog;
use crate::graph::ProximityGraph;
use habitat_store::{CandidateId, HabitatType};
use std::collections::{BTreeSet, HashSet};

/// A connected component of two or more candidates, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub habitat_type: HabitatType,
    pub members: Vec<CandidateId>,
}

impl Cluster {
    /// The first-visited, and therefore largest, member.
    #[inline]
    pub fn representative(&self) -> CandidateId {
        self.members[0]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Extraction {
    /// Clusters in discovery order.
    pub clusters: Vec<Cluster>,
    /// Ids that formed a component of their own.
    pub unmerged: BTreeSet<CandidateId>,
}

/// Split the graph into connected components.
///
/// Start nodes are taken largest-area first, and every node's unvisited
/// neighbours are explored largest-area first, so the first id of each
/// cluster is its biggest member and the result never depends on how the
/// graph was built.
pub fn extract_clusters(catalog: &Catalog, graph: &ProximityGraph) -> Extraction {
    let mut visited: HashSet<CandidateId> = HashSet::with_capacity(catalog.len());
    let mut out = Extraction::default();
    let mut stack: Vec<CandidateId> = Vec::new();
    let mut next: Vec<CandidateId> = Vec::new();

    for start in catalog.ids_by_area_desc() {
        if visited.contains(&start) {
            continue;
        }

        let mut members = Vec::new();
        stack.push(start);

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            members.push(id);

            next.clear();
            next.extend(
                graph
                    .neighbors(id)
                    .filter(|n| catalog.contains(*n) && !visited.contains(n)),
            );
            next.sort_by(|&a, &b| catalog.cmp_area_desc(a, b));
            // Reversed so the largest neighbour is popped first.
            stack.extend(next.iter().rev());
        }

        if members.len() < 2 {
            out.unmerged.insert(start);
            continue;
        }

        // Edges are type-homogeneous, so the start node's type is the cluster's.
        let Some(entry) = catalog.get(start) else {
            continue;
        };
        out.clusters.push(Cluster {
            habitat_type: entry.habitat_type,
            members,
        });
    }

    out
}
