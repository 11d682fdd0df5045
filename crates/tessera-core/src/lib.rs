//! # tessera-core
//!
//! Core abstractions shared by the Tessera store's subsystems:
//! - Member identity and version tags for concurrency control
//! - Region version vectors (RVVs) with exception and GC tracking
//! - The region model and its pluggable backends (region map, disk
//!   RVV store, GC distributor)
//! - The cache runtime seam: clock, cancellation, worker pool,
//!   performance gauges and memory usage
//!
//! Subsystems such as tombstone reclamation depend on regions and the
//! cache only through the narrow traits defined here, so they can be
//! tested against in-memory backends.

mod member;
mod region;
mod runtime;
mod version;
mod version_vector;

pub use member::MemberId;
pub use region::{
    DataPolicy, DiskError, DiskRvvStore, GcDistributor, NoopDistributor, Region,
    RegionAttributes, RegionAttributesBuilder, RegionBuilder, RegionEntry, RegionId, RegionMap,
    RegionMapError, Scope, TombstoneGcMessage,
};
pub use runtime::{
    CachePerfStats, CacheRuntime, CancelCriterion, Clock, FixedMemory, InlinePool, Latch,
    ManualClock, NeverCancelled, RuntimeMemoryUsage, SystemClock, TaskPool, ThreadPool,
    UnboundedMemory,
};
pub use version::{VersionStamp, VersionTag};
pub use version_vector::RegionVersionVector;
