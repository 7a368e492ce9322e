//! habitat_merge: proximity clustering and consolidation of habitat polygons.
//!
//! A run goes through four steps against any [`habitat_store::GeometryStore`]:
//!
//! 1. **graph**: every eligible candidate queries its same-type neighbours
//!    on a rayon pool; pairs within the per-type merge distance become edges.
//! 2. **extract**: connected components, largest area first.
//! 3. **merge**: each cluster is buffered, unioned, simplified and committed
//!    as one habitat by an isolated worker thread, or reverted.
//! 4. **fallback**: everything left over is committed on its own if large
//!    enough, otherwise dropped.
//!
//! See [`pipeline::run`].

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod consolidate;
pub mod fallback;
pub mod graph;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod shutdown;

pub use cluster::{extract_clusters, Cluster, Extraction};
pub use config::{ConfigError, DatasetMode, MergeConfig, TypeThresholds};
pub use consolidate::{adaptive_simplify, consolidate_cluster, ConsolidationError, FailureKind};
pub use graph::ProximityGraph;
pub use pipeline::{run, Outcome, PipelineError, RunReport, RunStatus};
pub use scheduler::PartitionStrategy;
pub use shutdown::ShutdownToken;
