use crate::catalog::{Catalog, Entry};
use crate::config::MergeConfig;
use crate::consolidate::{adaptive_simplify, ConsolidationError};
use crate::shutdown::ShutdownToken;
use habitat_store::geometry;
use habitat_store::{CandidateId, ConsolidatedHabitat, StoreError, StoreSession};
use log::{debug, info, warn};
use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct FallbackOutcome {
    /// Committed as standalone copies.
    pub committed: Vec<CandidateId>,
    /// Below the minimum size.
    pub dropped: Vec<CandidateId>,
    /// Nothing committed: store error or unusable geometry.
    pub failed: Vec<CandidateId>,
    /// Never attempted because of shutdown.
    pub pending: Vec<CandidateId>,
}

/// Commit a buffered, simplified copy of every unmerged candidate that is
/// large enough on its own, smallest id first.
pub fn finalize<S: StoreSession>(
    session: &mut S,
    unmerged: &BTreeSet<CandidateId>,
    catalog: &Catalog,
    config: &MergeConfig,
    token: &ShutdownToken,
) -> FallbackOutcome {
    info!("fallback start ({} candidates)", unmerged.len());
    let mut out = FallbackOutcome::default();

    let mut ids = unmerged.iter().copied();
    while let Some(id) = ids.next() {
        if token.is_cancelled() {
            out.pending = std::iter::once(id).chain(ids.by_ref()).collect();
            info!("fallback shutdown with {} candidates left", out.pending.len());
            break;
        }

        let Some(entry) = catalog.get(id) else {
            warn!("fallback: {id} is not an eligible candidate");
            out.failed.push(id);
            continue;
        };

        // The size rule uses the original area, before buffering.
        if entry.area < config.min_size {
            debug!("fallback: drop {id} ({:.1} m²)", entry.area);
            out.dropped.push(id);
            continue;
        }

        match standalone(session, id, entry, config) {
            Ok(()) => out.committed.push(id),
            Err(e) => {
                warn!("fallback: {id}: {e}");
                out.failed.push(id);
            }
        }
    }

    info!(
        "fallback finish: {} committed, {} dropped, {} failed",
        out.committed.len(),
        out.dropped.len(),
        out.failed.len()
    );
    out
}

fn standalone<S: StoreSession>(
    session: &mut S,
    id: CandidateId,
    entry: Entry,
    config: &MergeConfig,
) -> Result<(), ConsolidationError> {
    let thresholds = config
        .thresholds(entry.habitat_type)
        .ok_or(ConsolidationError::Unconfigured(entry.habitat_type))?;

    let (_, polygon) = session
        .fetch(&[id])?
        .into_iter()
        .next()
        .ok_or(StoreError::UnknownCandidate(id))?;

    let grown = geometry::buffer(&polygon, thresholds.merge_buffer);
    if !geometry::is_valid(&grown) {
        return Err(ConsolidationError::InvalidMember { id });
    }

    let (simplified, tolerance) = adaptive_simplify(
        &grown,
        config.max_simplify_tolerance,
        config.min_simplify_tolerance,
    );
    debug!(
        "fallback: {id} {:.1} m², tolerance {tolerance:?}",
        geometry::area(&simplified)
    );

    session.commit(ConsolidatedHabitat {
        representative_id: id,
        habitat_type: entry.habitat_type,
        geometry: simplified,
    })?;
    Ok(())
}
