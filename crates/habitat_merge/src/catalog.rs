use habitat_store::{Candidate, CandidateId, HabitatType};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub habitat_type: HabitatType,
    pub area: f64,
}

/// Read-only facts about the non-excluded candidates of one run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: HashMap<CandidateId, Entry>,
}

impl Catalog {
    pub fn from_candidates(candidates: &[Candidate]) -> Self {
        Self {
            entries: candidates
                .iter()
                .map(|c| {
                    (
                        c.id,
                        Entry {
                            habitat_type: c.habitat_type,
                            area: c.area,
                        },
                    )
                })
                .collect(),
        }
    }

    #[inline]
    pub fn get(&self, id: CandidateId) -> Option<Entry> {
        self.entries.get(&id).copied()
    }

    #[inline]
    pub fn contains(&self, id: CandidateId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Larger area first; equal areas by ascending id. Unknown ids sort last.
    pub fn cmp_area_desc(&self, a: CandidateId, b: CandidateId) -> Ordering {
        let area = |id| self.get(id).map_or(f64::NEG_INFINITY, |e| e.area);
        area(b).total_cmp(&area(a)).then(a.cmp(&b))
    }

    /// Every id, largest area first.
    pub fn ids_by_area_desc(&self) -> Vec<CandidateId> {
        let mut ids: Vec<CandidateId> = self.entries.keys().copied().collect();
        ids.sort_by(|&a, &b| self.cmp_area_desc(a, b));
        ids
    }
}
