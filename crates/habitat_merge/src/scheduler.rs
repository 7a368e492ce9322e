//! Two-phase work scheduling.
//!
//! Phase 1 runs on a rayon pool: each task opens its own session and returns
//! its local edges, merged by one reducer after the pool is done. Phase 2
//! runs one named OS thread per worker. A worker owns its cluster list and
//! its session, and reports back only through its own channel. The
//! coordinator joins every worker before draining any channel.

use crate::catalog::Catalog;
use crate::cluster::Cluster;
use crate::config::MergeConfig;
use crate::consolidate::{consolidate_cluster, FailureKind, Merged};
use crate::graph::{search_candidates, LocalEdges, ProximityGraph};
use crate::progress::Tick;
use crate::shutdown::ShutdownToken;
use clap::ValueEnum;
use crossbeam_channel::{unbounded, Receiver, Sender};
use habitat_store::{Candidate, CandidateId, GeometryStore};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::thread;
use thiserror::Error;

/// How items are dealt out to workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Item `i` goes to worker `i % n`.
    #[default]
    RoundRobin,
    /// Each item goes to the currently lightest worker.
    SizeBalanced,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build the graph worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to spawn {label}: {source}")]
    Spawn {
        label: String,
        source: std::io::Error,
    },
}

/// Deal `items` out to `workers` buckets. Order inside a bucket follows
/// the input order.
pub fn partition<T>(
    items: Vec<T>,
    workers: usize,
    strategy: PartitionStrategy,
    weight: impl Fn(&T) -> usize,
) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let mut buckets: Vec<Vec<T>> = (0..workers).map(|_| Vec::new()).collect();

    match strategy {
        PartitionStrategy::RoundRobin => {
            for (i, item) in items.into_iter().enumerate() {
                buckets[i % workers].push(item);
            }
        }
        PartitionStrategy::SizeBalanced => {
            let mut loads = vec![0usize; workers];
            for item in items {
                let lightest = (0..workers).min_by_key(|&w| (loads[w], w)).unwrap_or(0);
                loads[lightest] += weight(&item);
                buckets[lightest].push(item);
            }
        }
    }

    buckets
}

/// Result of phase 1.
#[derive(Debug, Default)]
pub struct GraphPhase {
    pub graph: ProximityGraph,
    pub queried: usize,
    pub store_failures: usize,
}

pub fn run_graph_phase<G: GeometryStore>(
    store: &G,
    candidates: &[Candidate],
    catalog: &Catalog,
    config: &MergeConfig,
    token: &ShutdownToken,
) -> Result<GraphPhase, SchedulerError> {
    let refs: Vec<&Candidate> = candidates.iter().collect();
    let parts = partition(refs, config.graph_workers, config.partition, |_| 1);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parts.len())
        .thread_name(|i| format!("graph-{i}"))
        .build()?;

    let locals: Vec<LocalEdges> = pool.install(|| {
        parts
            .into_par_iter()
            .enumerate()
            .map(|(i, part)| {
                let label = format!("graph worker {i}");
                match store.open_session() {
                    Ok(mut session) => {
                        search_candidates(&label, &mut session, &part, catalog, config, token)
                    }
                    Err(e) => {
                        warn!("{label}: cannot open a session: {e}");
                        LocalEdges {
                            store_failures: part.len(),
                            ..LocalEdges::default()
                        }
                    }
                }
            })
            .collect()
    });

    let graph = ProximityGraph::from_local(&locals);
    Ok(GraphPhase {
        queried: locals.iter().map(|l| l.queried).sum(),
        store_failures: locals.iter().map(|l| l.store_failures).sum(),
        graph,
    })
}

/// What a phase 2 worker reports for each cluster it touched.
#[derive(Debug)]
pub enum WorkerMessage {
    Merged {
        merged: Merged,
        members: Vec<CandidateId>,
    },
    Retry {
        representative: CandidateId,
        members: Vec<CandidateId>,
        kind: FailureKind,
        reason: String,
    },
    /// Shutdown was requested; these members were never attempted.
    Stopped { remaining: Vec<CandidateId> },
}

/// Result of phase 2.
#[derive(Debug, Default)]
pub struct MergePhase {
    /// Committed clusters, sorted by representative.
    pub merged: Vec<(Merged, Vec<CandidateId>)>,
    /// Members of failed clusters, destined for the fallback path.
    pub retry: BTreeSet<CandidateId>,
    pub failures: BTreeMap<FailureKind, usize>,
    /// Members never attempted because of shutdown.
    pub pending: BTreeSet<CandidateId>,
}

impl MergePhase {
    pub fn store_failures(&self) -> usize {
        self.failures.get(&FailureKind::Store).copied().unwrap_or(0)
    }

    fn absorb(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Merged { merged, members } => self.merged.push((merged, members)),
            WorkerMessage::Retry {
                representative,
                members,
                kind,
                reason,
            } => {
                debug!(
                    "cluster {representative} ({} members) to fallback, {kind}: {reason}",
                    members.len()
                );
                *self.failures.entry(kind).or_default() += 1;
                self.retry.extend(members);
            }
            WorkerMessage::Stopped { remaining } => self.pending.extend(remaining),
        }
    }
}

pub fn run_merge_phase<G: GeometryStore>(
    store: &G,
    mut clusters: Vec<Cluster>,
    config: &MergeConfig,
    token: &ShutdownToken,
) -> Result<MergePhase, SchedulerError> {
    // Largest clusters first; the sort is stable so equal sizes keep discovery order.
    clusters.sort_by(|a, b| b.len().cmp(&a.len()));
    let parts = partition(clusters, config.merge_workers, config.partition, Cluster::len);

    let mut phase = MergePhase::default();

    thread::scope(|scope| -> Result<(), SchedulerError> {
        let mut workers = Vec::with_capacity(parts.len());

        for (i, part) in parts.into_iter().enumerate() {
            let label = format!("merge worker {i}");
            let assigned: Vec<Cluster> = part.clone();
            let (tx, rx) = unbounded();

            let worker_label = label.clone();
            let handle = thread::Builder::new()
                .name(format!("merge-{i}"))
                .spawn_scoped(scope, move || {
                    merge_worker(&worker_label, store, part, config, token, tx)
                })
                .map_err(|source| SchedulerError::Spawn {
                    label: label.clone(),
                    source,
                })?;

            workers.push((label, handle, rx, assigned));
        }

        let joined: Vec<(String, bool, Receiver<WorkerMessage>, Vec<Cluster>)> = workers
            .into_iter()
            .map(|(label, handle, rx, assigned)| {
                let ok = handle.join().is_ok();
                (label, ok, rx, assigned)
            })
            .collect();

        for (label, ok, rx, assigned) in joined {
            let mut reported: HashSet<CandidateId> = HashSet::new();
            for msg in rx.try_iter() {
                match &msg {
                    WorkerMessage::Merged { members, .. }
                    | WorkerMessage::Retry { members, .. } => reported.extend(members),
                    WorkerMessage::Stopped { remaining } => reported.extend(remaining),
                }
                phase.absorb(msg);
            }

            if !ok {
                error!("{label} panicked; unreported clusters go to fallback");
                for cluster in assigned {
                    if !reported.contains(&cluster.representative()) {
                        phase.absorb(WorkerMessage::Retry {
                            representative: cluster.representative(),
                            members: cluster.members,
                            kind: FailureKind::WorkerLost,
                            reason: format!("{label} panicked"),
                        });
                    }
                }
            }
        }

        Ok(())
    })?;

    phase.merged.sort_by_key(|(m, _)| m.representative);
    Ok(phase)
}

const MERGE_PROGRESS_EVERY: usize = 100;

fn merge_worker<G: GeometryStore>(
    label: &str,
    store: &G,
    clusters: Vec<Cluster>,
    config: &MergeConfig,
    token: &ShutdownToken,
    tx: Sender<WorkerMessage>,
) {
    info!("{label} start ({} clusters)", clusters.len());

    let report = |msg: WorkerMessage| {
        if tx.send(msg).is_err() {
            warn!("{label}: coordinator hung up");
        }
    };

    let mut session = match store.open_session() {
        Ok(s) => s,
        Err(e) => {
            warn!("{label}: cannot open a session: {e}");
            for cluster in clusters {
                report(WorkerMessage::Retry {
                    representative: cluster.representative(),
                    members: cluster.members,
                    kind: FailureKind::Store,
                    reason: e.to_string(),
                });
            }
            return;
        }
    };

    let total = clusters.len();
    let mut done = 0usize;
    let mut tick = Tick::new(label, "clusters", total, MERGE_PROGRESS_EVERY);
    let mut queue = clusters.into_iter();

    while let Some(cluster) = queue.next() {
        if token.is_cancelled() {
            let remaining: Vec<CandidateId> = std::iter::once(cluster)
                .chain(queue.by_ref())
                .flat_map(|c| c.members)
                .collect();
            info!("{label} shutdown with {} candidates unattempted", remaining.len());
            report(WorkerMessage::Stopped { remaining });
            return;
        }

        let representative = cluster.representative();
        match consolidate_cluster(&mut session, &cluster, config) {
            Ok(merged) => report(WorkerMessage::Merged {
                merged,
                members: cluster.members,
            }),
            Err(e) => {
                let kind = e.kind();
                if kind == FailureKind::Store {
                    warn!("{label}: cluster {representative}: {e}");
                } else {
                    info!("{label}: cluster {representative} reverted ({kind}): {e}");
                }
                report(WorkerMessage::Retry {
                    representative,
                    members: cluster.members,
                    kind,
                    reason: e.to_string(),
                });
            }
        }

        done += 1;
        tick.step(done);
    }

    info!("{label} finish ({done} clusters)");
}
