//! Region version vectors.
//!
//! A region version vector (RVV) tracks, per member, the highest
//! contiguous region version observed, together with an exception list
//! for gaps created by out-of-order delivery. A companion GC map holds
//! the versions whose tombstones have been reclaimed cluster-wide; the
//! GC map must only ever advance, since peers use it to discard stale
//! updates permanently.

use crate::member::MemberId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A gap in the versions received from one member.
///
/// Versions `v` with `after < v < until` have not been observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGap {
    pub after: u64,
    pub until: u64,
}

impl VersionGap {
    fn contains(&self, version: u64) -> bool {
        self.after < version && version < self.until
    }

    fn is_empty(&self) -> bool {
        self.until <= self.after + 1
    }
}

/// Versions observed from a single member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MemberVersions {
    /// Highest version received; versions at or below this are present
    /// unless listed in `exceptions`.
    version: u64,
    /// Gaps below `version`, kept sorted and non-overlapping.
    exceptions: Vec<VersionGap>,
}

impl MemberVersions {
    fn record(&mut self, version: u64) {
        if version == self.version + 1 {
            self.version = version;
        } else if version > self.version {
            self.exceptions.push(VersionGap {
                after: self.version,
                until: version,
            });
            self.exceptions.sort_by_key(|g| g.after);
            self.version = version;
        } else {
            // A version below the frontier either fills part of a gap or
            // is a duplicate.
            let mut split = Vec::new();
            self.exceptions.retain(|g| {
                if g.contains(version) {
                    let low = VersionGap {
                        after: g.after,
                        until: version,
                    };
                    let high = VersionGap {
                        after: version,
                        until: g.until,
                    };
                    if !low.is_empty() {
                        split.push(low);
                    }
                    if !high.is_empty() {
                        split.push(high);
                    }
                    false
                } else {
                    true
                }
            });
            self.exceptions.extend(split);
            self.exceptions.sort_by_key(|g| g.after);
        }
    }

    fn contains(&self, version: u64) -> bool {
        version <= self.version && !self.exceptions.iter().any(|g| g.contains(version))
    }
}

/// Per-region vector clock with GC tracking.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionVersionVector {
    versions: BTreeMap<MemberId, MemberVersions>,
    gc_versions: BTreeMap<MemberId, u64>,
}

impl RegionVersionVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        RegionVersionVector::default()
    }

    /// Record receipt of `version` from `member`, creating or healing
    /// exceptions as needed.
    pub fn record_version(&mut self, member: &MemberId, version: u64) {
        self.versions
            .entry(member.clone())
            .or_default()
            .record(version);
    }

    /// The highest version received from `member` (0 if none).
    pub fn version_for(&self, member: &MemberId) -> u64 {
        self.versions.get(member).map(|v| v.version).unwrap_or(0)
    }

    /// Whether `version` from `member` has been observed.
    pub fn contains(&self, member: &MemberId, version: u64) -> bool {
        self.versions
            .get(member)
            .map(|v| v.contains(version))
            .unwrap_or(false)
    }

    /// Record that tombstones from `member` up to `version` have been
    /// reclaimed. The GC version never moves backwards.
    pub fn record_gc_version(&mut self, member: &MemberId, version: u64) {
        let gc = self.gc_versions.entry(member.clone()).or_insert(0);
        *gc = (*gc).max(version);
    }

    /// The reclaimed-version watermark for `member` (0 if none).
    pub fn gc_version(&self, member: &MemberId) -> u64 {
        self.gc_versions.get(member).copied().unwrap_or(0)
    }

    /// All reclaimed-version watermarks.
    pub fn gc_versions(&self) -> impl Iterator<Item = (&MemberId, u64)> {
        self.gc_versions.iter().map(|(m, &v)| (m, v))
    }

    /// Drop exception entries made obsolete by the GC watermark: a gap
    /// whose missing versions all fall at or below the member's GC
    /// version can never be filled by a live operation.
    pub fn prune_old_exceptions(&mut self) {
        for (member, versions) in self.versions.iter_mut() {
            let gc = self.gc_versions.get(member).copied().unwrap_or(0);
            versions.exceptions.retain(|g| g.until > gc + 1);
        }
    }

    /// The exception gaps currently tracked for `member`.
    pub fn exceptions_for(&self, member: &MemberId) -> &[VersionGap] {
        self.versions
            .get(member)
            .map(|v| v.exceptions.as_slice())
            .unwrap_or(&[])
    }

    /// True if every version observed in `other` is observed here.
    pub fn dominates(&self, other: &RegionVersionVector) -> bool {
        other.versions.iter().all(|(member, theirs)| {
            let Some(ours) = self.versions.get(member) else {
                return theirs.version == 0;
            };
            if ours.version < theirs.version {
                return false;
            }
            // A gap of ours below their frontier hides a version they
            // observed, unless they are missing it too.
            ours.exceptions
                .iter()
                .all(|g| g.after >= theirs.version || theirs.exceptions.contains(g))
        })
    }

    /// Number of members tracked.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether any member has been recorded.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
