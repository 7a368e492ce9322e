//! In-memory [`GeometryStore`] over a fixed candidate snapshot.
//!
//! Candidates are indexed by bounding box in an R-tree; committed habitats
//! are collected behind a mutex and handed back once the run is over.

use crate::geometry;
use crate::store::{GeometryStore, StoreError, StoreSession};
use crate::types::{Candidate, CandidateId, ConsolidatedHabitat, HabitatType, Neighbor};
use geo::{BoundingRect, Polygon};
use log::debug;
use parking_lot::Mutex;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone)]
struct CandidateBox {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for CandidateBox {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

fn envelope_of(polygon: &Polygon<f64>, pad: f64) -> Option<AABB<[f64; 2]>> {
    let rect = polygon.bounding_rect()?;
    Some(AABB::from_corners(
        [rect.min().x - pad, rect.min().y - pad],
        [rect.max().x + pad, rect.max().y + pad],
    ))
}

struct Inner {
    candidates: Vec<Candidate>,
    by_id: HashMap<CandidateId, usize>,
    tree: RTree<CandidateBox>,
    committed: Mutex<BTreeMap<CandidateId, ConsolidatedHabitat>>,
    failing_commits: HashSet<CandidateId>,
}

/// Cheap to clone; clones share the same snapshot and output.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Index a candidate snapshot. Ids must be unique.
    pub fn new(mut candidates: Vec<Candidate>) -> Result<Self, StoreError> {
        // Area ascending, id as tie-break, so listings are stable.
        candidates.sort_by(|a, b| a.area.total_cmp(&b.area).then(a.id.cmp(&b.id)));

        let mut by_id = HashMap::with_capacity(candidates.len());
        for (idx, c) in candidates.iter().enumerate() {
            if by_id.insert(c.id, idx).is_some() {
                return Err(StoreError::DuplicateCandidate(c.id));
            }
        }

        let boxes: Vec<CandidateBox> = candidates
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| envelope_of(&c.geometry, 0.0).map(|env| CandidateBox { idx, env }))
            .collect();

        debug!("Indexed {} candidate envelopes", boxes.len());

        Ok(Self {
            inner: Arc::new(Inner {
                candidates,
                by_id,
                tree: RTree::bulk_load(boxes),
                committed: Mutex::new(BTreeMap::new()),
                failing_commits: HashSet::new(),
            }),
        })
    }

    /// Make every commit keyed by one of `ids` fail with [`StoreError::Unavailable`].
    ///
    /// Only effective before the store is shared.
    pub fn with_failing_commits(mut self, ids: impl IntoIterator<Item = CandidateId>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.failing_commits.extend(ids);
        }
        self
    }

    /// Snapshot of everything committed so far, ordered by representative id.
    pub fn habitats(&self) -> Vec<ConsolidatedHabitat> {
        self.inner.committed.lock().values().cloned().collect()
    }
}

impl GeometryStore for MemoryStore {
    type Session = MemorySession;

    fn open_session(&self) -> Result<Self::Session, StoreError> {
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
        })
    }
}

pub struct MemorySession {
    inner: Arc<Inner>,
}

impl MemorySession {
    fn get(&self, id: CandidateId) -> Result<&Candidate, StoreError> {
        self.inner
            .by_id
            .get(&id)
            .map(|&idx| &self.inner.candidates[idx])
            .ok_or(StoreError::UnknownCandidate(id))
    }
}

impl StoreSession for MemorySession {
    fn list_candidates(&mut self, exclude: &[HabitatType]) -> Result<Vec<Candidate>, StoreError> {
        Ok(self
            .inner
            .candidates
            .iter()
            .filter(|c| !exclude.contains(&c.habitat_type))
            .cloned()
            .collect())
    }

    fn query_within(
        &mut self,
        origin: CandidateId,
        geometry: &Polygon<f64>,
        habitat_type: HabitatType,
        radius: f64,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let Some(search) = envelope_of(geometry, radius) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Neighbor> = self
            .inner
            .tree
            .locate_in_envelope_intersecting(&search)
            .map(|b| &self.inner.candidates[b.idx])
            .filter(|c| c.id != origin && c.habitat_type == habitat_type)
            .filter_map(|c| {
                let distance = geometry::distance(geometry, &c.geometry);
                (distance <= radius).then_some(Neighbor {
                    id: c.id,
                    distance,
                    area: c.area,
                })
            })
            .collect();

        hits.sort_by_key(|n| n.id);
        Ok(hits)
    }

    fn fetch(&mut self, ids: &[CandidateId]) -> Result<Vec<(CandidateId, Polygon<f64>)>, StoreError> {
        ids.iter()
            .map(|&id| self.get(id).map(|c| (id, c.geometry.clone())))
            .collect()
    }

    fn commit(&mut self, habitat: ConsolidatedHabitat) -> Result<(), StoreError> {
        let id = habitat.representative_id;
        if self.inner.failing_commits.contains(&id) {
            return Err(StoreError::Unavailable(format!("commit of {id} rejected")));
        }

        let mut committed = self.inner.committed.lock();
        if committed.contains_key(&id) {
            return Err(StoreError::DuplicateHabitat(id));
        }
        committed.insert(id, habitat);
        Ok(())
    }
}
