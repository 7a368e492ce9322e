//! habitat_store: the geometry side of habitat consolidation.
//!
//! - Typed raw candidates (`polygon_id`, habitat type, polygon, planar area).
//! - The [`GeometryStore`] / [`StoreSession`] contract the merge engine runs
//!   against, and an R-tree backed in-memory implementation.
//! - Planar primitives: buffer, union, validity, kind, simplify, area.
//! - A local metre frame for CRS:84 input and GeoJSON import/export.
//!
//! Every area and distance is in metres / m² of the planar working frame,
//! whatever the storage coordinates were.

pub mod frame;
pub mod geojson;
pub mod geometry;
pub mod memory;
pub mod store;
pub mod types;

pub use frame::{InputCs, LocalFrame};
pub use geometry::GeometryKind;
pub use memory::{MemorySession, MemoryStore};
pub use store::{GeometryStore, StoreError, StoreSession};
pub use types::{Candidate, CandidateId, ConsolidatedHabitat, HabitatType, Neighbor};
