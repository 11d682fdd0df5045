//! Error types for tombstone reclamation.

use tessera_core::{DiskError, RegionMapError};
use thiserror::Error;

/// Errors surfaced by reclamation operations.
///
/// The subsystem is best-effort: most failures are logged where they
/// occur and the affected tombstone is dropped from the sweeper's
/// view. These variants exist for the few paths where a caller needs
/// to distinguish the cause.
#[derive(Error, Debug)]
pub enum ReclamationError {
    #[error("entry in region {region} has no version stamp")]
    UnversionedEntry { region: String },

    #[error(transparent)]
    Persistence(#[from] DiskError),

    #[error(transparent)]
    RegionMap(#[from] RegionMapError),
}
