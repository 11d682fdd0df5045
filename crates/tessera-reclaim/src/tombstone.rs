//! Tombstone records and the sweep queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tessera_core::{Region, RegionEntry, RegionId, VersionTag};

/// Fixed bookkeeping cost of a queued tombstone, in bytes: the queue
/// slot, the region/entry/member back-references, the tombstone marker
/// held by the entry, and the version numbers and timestamp.
pub const PER_TOMBSTONE_OVERHEAD: u64 = 8 + 8 * 3 + 8 + 18;

/// A destroyed-entry marker retained for concurrency checks.
///
/// Immutable once created. The region back-reference is weak so a
/// tombstone never extends the life of a closed region; `unschedule`
/// drops a region's tombstones when it closes, and any stragglers are
/// discarded when their upgrade fails.
pub struct Tombstone {
    region: Weak<Region>,
    entry: Arc<dyn RegionEntry>,
    tag: VersionTag,
    key_size: u64,
}

impl Tombstone {
    pub fn new(region: &Arc<Region>, entry: Arc<dyn RegionEntry>, destroyed: VersionTag) -> Self {
        let key_size = entry.key().len() as u64;
        Tombstone {
            region: Arc::downgrade(region),
            entry,
            tag: destroyed,
            key_size,
        }
    }

    /// The owning region, if it is still open.
    pub fn region(&self) -> Option<Arc<Region>> {
        self.region.upgrade()
    }

    /// Whether this tombstone belongs to `region`.
    pub fn is_for(&self, region: &Arc<Region>) -> bool {
        self.region_id() == Some(region.id())
    }

    fn region_id(&self) -> Option<RegionId> {
        self.region.upgrade().map(|r| r.id())
    }

    pub fn entry(&self) -> &Arc<dyn RegionEntry> {
        &self.entry
    }

    /// The destroyed version this tombstone guards.
    pub fn tag(&self) -> &VersionTag {
        &self.tag
    }

    pub fn region_version(&self) -> u64 {
        self.tag.region_version
    }

    pub fn entry_version(&self) -> u64 {
        self.tag.entry_version
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.tag.timestamp_ms
    }

    /// Bytes this tombstone accounts for in the sweep queue.
    pub fn size(&self) -> u64 {
        PER_TOMBSTONE_OVERHEAD + self.key_size
    }

    /// Whether the tombstone has outlived `expiry_ms` as of `now_ms`.
    pub fn is_expired(&self, expiry_ms: u64, now_ms: u64) -> bool {
        self.tag.timestamp_ms.saturating_add(expiry_ms) <= now_ms
    }
}

impl fmt::Display for Tombstone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.region.upgrade();
        write!(
            f,
            "({}; {}; {})",
            self.entry.key(),
            path.as_deref().map(Region::full_path).unwrap_or("<closed>"),
            self.tag
        )
    }
}

/// The sweeper's live tombstones: a FIFO of scheduled tombstones plus
/// the single slot the sweeper is currently waiting on.
///
/// Both live behind the sweeper's current-tombstone lock so external
/// scans observe the slot and the queue as one logical sequence; a
/// tombstone can never vanish mid-scan because the sweeper advanced
/// its slot.
pub(crate) struct SweepQueue {
    pub(crate) current: Option<Arc<Tombstone>>,
    pub(crate) queue: VecDeque<Arc<Tombstone>>,
}

impl SweepQueue {
    pub(crate) fn new() -> Self {
        SweepQueue {
            current: None,
            queue: VecDeque::new(),
        }
    }

    /// Append a tombstone at the tail.
    pub(crate) fn push(&mut self, tombstone: Arc<Tombstone>) {
        self.queue.push_back(tombstone);
    }

    /// Take the head of the queue.
    pub(crate) fn poll(&mut self) -> Option<Arc<Tombstone>> {
        self.queue.pop_front()
    }

    /// Tombstones present, counting the current slot.
    pub(crate) fn len(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    /// Visit the slot and every queued tombstone; remove and return
    /// those for which `predicate` is true.
    pub(crate) fn remove_matching<F>(&mut self, mut predicate: F) -> Vec<Arc<Tombstone>>
    where
        F: FnMut(&Arc<Tombstone>) -> bool,
    {
        let mut removed = Vec::new();
        if let Some(current) = &self.current {
            if predicate(current) {
                removed.push(self.current.take().unwrap());
            }
        }
        self.queue.retain(|t| {
            if predicate(t) {
                removed.push(t.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every tombstone of `region`, returning them.
    pub(crate) fn remove_region(&mut self, region: &Arc<Region>) -> Vec<Arc<Tombstone>> {
        self.remove_matching(|t| t.is_for(region))
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
        self.queue.clear();
    }
}
