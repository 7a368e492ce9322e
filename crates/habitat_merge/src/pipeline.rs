//! One consolidation run: validate, load, graph, extract, merge, fallback.

use crate::catalog::Catalog;
use crate::cluster::extract_clusters;
use crate::config::{ConfigError, MergeConfig};
use crate::consolidate::FailureKind;
use crate::fallback::{finalize, FallbackOutcome};
use crate::scheduler::{run_graph_phase, run_merge_phase, SchedulerError};
use crate::shutdown::ShutdownToken;
use habitat_store::{Candidate, CandidateId, GeometryStore, HabitatType, StoreError, StoreSession};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("geometry store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Shutdown was requested; the run stopped after the phase in flight.
    Cancelled,
}

/// Where a candidate ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Part of the habitat keyed by `representative`.
    Merged { representative: CandidateId },
    /// Committed on its own by the fallback path.
    Fallback,
    /// Below the minimum size.
    Dropped,
    /// The store refused it or its geometry was unusable.
    Failed,
    /// Not reached before shutdown.
    Pending,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    pub load: Duration,
    pub graph: Duration,
    pub extract: Duration,
    pub merge: Duration,
    pub fallback: Duration,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    /// Eligible candidates.
    pub candidates: usize,
    /// Rows the store returned despite an excluded type.
    pub excluded: usize,
    pub edges: usize,
    pub clusters: usize,
    pub merged_clusters: usize,
    /// Members of clusters that failed to consolidate.
    pub retried: usize,
    pub fallback_committed: usize,
    pub dropped: usize,
    pub failed: usize,
    pub store_failures: usize,
    pub failures: BTreeMap<FailureKind, usize>,
    pub timings: PhaseTimings,
    pub outcomes: BTreeMap<CandidateId, Outcome>,
}

impl RunReport {
    fn new(catalog: &Catalog, excluded: usize) -> Self {
        Self {
            status: RunStatus::Completed,
            candidates: catalog.len(),
            excluded,
            edges: 0,
            clusters: 0,
            merged_clusters: 0,
            retried: 0,
            fallback_committed: 0,
            dropped: 0,
            failed: 0,
            store_failures: 0,
            failures: BTreeMap::new(),
            timings: PhaseTimings::default(),
            outcomes: catalog
                .ids_by_area_desc()
                .into_iter()
                .map(|id| (id, Outcome::Pending))
                .collect(),
        }
    }

    fn cancelled(mut self) -> Self {
        self.status = RunStatus::Cancelled;
        self
    }

    pub fn outcome(&self, id: CandidateId) -> Option<Outcome> {
        self.outcomes.get(&id).copied()
    }

    /// Number of habitats committed by this run.
    pub fn committed(&self) -> usize {
        self.merged_clusters + self.fallback_committed
    }

    pub fn log(&self) {
        let t = &self.timings;
        info!(
            "run {:?}: {} candidates ({} excluded), {} edges, {} clusters",
            self.status, self.candidates, self.excluded, self.edges, self.clusters
        );
        info!(
            "merged {} clusters, {} ids retried, {} fallback copies, {} dropped, {} failed, {} store failures",
            self.merged_clusters,
            self.retried,
            self.fallback_committed,
            self.dropped,
            self.failed,
            self.store_failures
        );
        for (kind, n) in &self.failures {
            info!("  {kind:<14} {n}");
        }
        info!(
            "timings: load {:.2?}, graph {:.2?}, extract {:.2?}, merge {:.2?}, fallback {:.2?}",
            t.load, t.graph, t.extract, t.merge, t.fallback
        );
    }

    fn absorb_fallback(&mut self, fallback: &FallbackOutcome) {
        for &id in &fallback.committed {
            self.outcomes.insert(id, Outcome::Fallback);
        }
        for &id in &fallback.dropped {
            self.outcomes.insert(id, Outcome::Dropped);
        }
        for &id in &fallback.failed {
            self.outcomes.insert(id, Outcome::Failed);
        }
        self.fallback_committed = fallback.committed.len();
        self.dropped = fallback.dropped.len();
        self.failed = fallback.failed.len();
    }
}

/// Run the whole consolidation against `store`.
///
/// Store problems on individual items are logged and counted; only
/// configuration errors, a store that cannot list candidates, or failing to
/// start workers abort the run.
pub fn run<G: GeometryStore>(
    store: &G,
    config: &MergeConfig,
    token: &ShutdownToken,
) -> Result<RunReport, PipelineError> {
    config.validate()?;

    let started = Instant::now();
    let mut session = store.open_session()?;

    let excluded_types: Vec<HabitatType> = HabitatType::ALL
        .into_iter()
        .filter(|&t| config.is_excluded(t))
        .collect();

    // The store is asked to filter, but eligibility is decided here.
    let (candidates, excluded): (Vec<Candidate>, Vec<Candidate>) = session
        .list_candidates(&excluded_types)?
        .into_iter()
        .partition(|c| !config.is_excluded(c.habitat_type));
    if !excluded.is_empty() {
        warn!("store returned {} candidates of excluded types", excluded.len());
    }

    let catalog = Catalog::from_candidates(&candidates);
    let mut report = RunReport::new(&catalog, excluded.len());
    report.timings.load = started.elapsed();
    info!("loaded {} candidates in {:.2?}", catalog.len(), report.timings.load);

    if token.is_cancelled() {
        return Ok(report.cancelled());
    }

    // Phase 1
    let t = Instant::now();
    let graph_phase = run_graph_phase(store, &candidates, &catalog, config, token)?;
    report.timings.graph = t.elapsed();
    report.edges = graph_phase.graph.edge_count();
    report.store_failures += graph_phase.store_failures;
    info!(
        "graph: {} edges over {} nodes in {:.2?}",
        report.edges,
        graph_phase.graph.node_count(),
        report.timings.graph
    );

    if token.is_cancelled() {
        return Ok(report.cancelled());
    }

    let t = Instant::now();
    let extraction = extract_clusters(&catalog, &graph_phase.graph);
    report.timings.extract = t.elapsed();
    report.clusters = extraction.clusters.len();
    info!(
        "extracted {} clusters, {} unclustered",
        report.clusters,
        extraction.unmerged.len()
    );

    // Phase 2
    let t = Instant::now();
    let merge_phase = run_merge_phase(store, extraction.clusters, config, token)?;
    report.timings.merge = t.elapsed();
    report.merged_clusters = merge_phase.merged.len();
    report.retried = merge_phase.retry.len();
    report.store_failures += merge_phase.store_failures();
    report.failures = merge_phase.failures.clone();
    for (merged, members) in &merge_phase.merged {
        for &id in members {
            report.outcomes.insert(
                id,
                Outcome::Merged {
                    representative: merged.representative,
                },
            );
        }
    }

    if token.is_cancelled() {
        return Ok(report.cancelled());
    }

    let unmerged: BTreeSet<CandidateId> = extraction
        .unmerged
        .into_iter()
        .chain(merge_phase.retry.iter().copied())
        .collect();

    let t = Instant::now();
    let fallback = finalize(&mut session, &unmerged, &catalog, config, token);
    report.timings.fallback = t.elapsed();
    report.absorb_fallback(&fallback);

    if !fallback.pending.is_empty() {
        return Ok(report.cancelled());
    }

    Ok(report)
}
