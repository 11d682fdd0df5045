//! # tessera-reclaim
//!
//! Tombstone reclamation for the Tessera store.
//!
//! Destroyed entries are not erased immediately: a tombstone is kept so
//! that late-arriving updates with stale versions can be detected and
//! discarded. This crate times tombstones out, reclaims their memory,
//! and coordinates the cluster-wide GC watermark so that peers agree on
//! what has been collected.
//!
//! ## Architecture
//!
//! A [`TombstoneService`] owns two sweepers, each a dedicated
//! background thread:
//! - the *replicated* sweeper batches expired tombstones and reclaims
//!   them together, advancing and persisting the region's GC version
//!   vector before any in-memory removal;
//! - the *non-replicated* sweeper (client and non-replicated regions)
//!   removes tombstones one by one on a shorter timeout.
//!
//! Reclamation can also be driven externally: by peer GC messages
//! carrying per-member version watermarks ([`TombstoneService::gc_by_rvv`])
//! or, for clients of partitioned servers, by reclaimed key sets
//! ([`TombstoneService::gc_by_keys`]).
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::CacheRuntime;
//! use tessera_reclaim::{ReclamationConfig, TombstoneService};
//!
//! let runtime = std::sync::Arc::new(CacheRuntime::new());
//! let service = TombstoneService::new(runtime, ReclamationConfig::default());
//!
//! service.schedule(&region, entry, destroyed_version);
//! // ... tombstones age out in the background ...
//! service.stop();
//! ```

mod config;
mod error;
mod service;
mod sweeper;
mod tombstone;

pub use config::{ReclamationConfig, ReclamationConfigBuilder};
pub use error::ReclamationError;
pub use service::TombstoneService;
pub use tombstone::{Tombstone, PER_TOMBSTONE_OVERHEAD};
