//! Version tags carried by entry operations.

use crate::member::MemberId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The version stamp produced by a destroy (or any entry operation).
///
/// `region_version` is the per-member monotonic counter used for
/// conflict detection across replicas; `entry_version` detects
/// resurrection of the same key; `timestamp_ms` is the cache time of
/// the operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTag {
    /// The member that originated the operation. Absent when the local
    /// member is implied; consumers substitute the region's version
    /// member at GC time.
    pub member_id: Option<MemberId>,
    /// Per-member monotonic region version.
    pub region_version: u64,
    /// Per-entry version, bumped on every update of the key.
    pub entry_version: u64,
    /// Cache time of the operation, in milliseconds.
    pub timestamp_ms: u64,
}

impl VersionTag {
    /// Create a tag stamped by a specific member.
    pub fn new(
        member_id: MemberId,
        region_version: u64,
        entry_version: u64,
        timestamp_ms: u64,
    ) -> Self {
        VersionTag {
            member_id: Some(member_id),
            region_version,
            entry_version,
            timestamp_ms,
        }
    }

    /// Create a tag with no originating member recorded.
    pub fn local(region_version: u64, entry_version: u64, timestamp_ms: u64) -> Self {
        VersionTag {
            member_id: None,
            region_version,
            entry_version,
            timestamp_ms,
        }
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.member_id {
            Some(m) => write!(
                f,
                "rv{}/ev{}@{} by {}",
                self.region_version, self.entry_version, self.timestamp_ms, m
            ),
            None => write!(
                f,
                "rv{}/ev{}@{}",
                self.region_version, self.entry_version, self.timestamp_ms
            ),
        }
    }
}

/// The version information a region-map entry exposes. Entries without
/// a stamp are unversioned and cannot take part in tombstone
/// reclamation.
pub type VersionStamp = VersionTag;
