//! The tombstone reclamation service.
//!
//! The cache holds one `TombstoneService`. It owns the two sweepers,
//! routes each region to the right one, and exposes the external
//! reclamation operations: scheduling, unscheduling, peer-driven GC by
//! version watermark or by key, and the block-GC counter used to keep
//! tombstones stable while a peer streams state derived from them.

use crate::config::ReclamationConfig;
use crate::error::ReclamationError;
use crate::sweeper::TombstoneSweeper;
use crate::tombstone::Tombstone;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{CacheRuntime, Latch, MemberId, Region, RegionEntry, RegionMapError, VersionTag};
use tracing::{debug, trace, warn};

/// Tracks and times out tombstones, and coordinates their
/// cluster-wide reclamation.
pub struct TombstoneService {
    /// Batch-mode sweeper for replicated regions (including
    /// partitioned-region buckets).
    replicated: Arc<TombstoneSweeper>,
    /// Sweeper for client and non-replicated regions; shorter timeout,
    /// no batching.
    non_replicated: Arc<TombstoneSweeper>,
    /// While positive, cluster GC of replicated tombstones is
    /// suppressed (a peer is mid-handshake on current tombstone state).
    block_gc: Arc<Mutex<u32>>,
    config: ReclamationConfig,
}

impl TombstoneService {
    /// Build both sweepers and start their background threads.
    pub fn new(runtime: Arc<CacheRuntime>, config: ReclamationConfig) -> Self {
        let block_gc = Arc::new(Mutex::new(0));
        let replicated = Arc::new(TombstoneSweeper::new(
            config.replicated_timeout_ms,
            true,
            config.clone(),
            Arc::clone(&runtime),
            Arc::clone(&block_gc),
        ));
        let non_replicated = Arc::new(TombstoneSweeper::new(
            config.non_replicated_timeout_ms,
            false,
            config.clone(),
            runtime,
            Arc::clone(&block_gc),
        ));
        replicated.start();
        non_replicated.start();
        TombstoneService {
            replicated,
            non_replicated,
            block_gc,
            config,
        }
    }

    /// Stop both sweeper threads and drop all queued tombstones.
    pub fn stop(&self) {
        self.replicated.stop();
        self.non_replicated.stop();
    }

    /// Schedule a tombstone for the destroyed entry. Entries without a
    /// version stamp cannot take part in concurrency checks and are
    /// rejected.
    pub fn schedule(
        &self,
        region: &Arc<Region>,
        entry: Arc<dyn RegionEntry>,
        destroyed: VersionTag,
    ) {
        if entry.version_stamp().is_none() {
            let err = ReclamationError::UnversionedEntry {
                region: region.full_path().to_string(),
            };
            warn!(
                key = entry.key(),
                error = %err,
                "attempt to schedule a tombstone for an entry that is not versioned"
            );
            return;
        }
        let tombstone = Arc::new(Tombstone::new(region, entry, destroyed));
        let sweeper = self.sweeper_for(region);
        sweeper.schedule(tombstone);
        if self.config.debug_tombstone_count {
            trace!(
                replicated = self.replicated.queued_count(),
                non_replicated = self.non_replicated.queued_count(),
                "tombstone scheduled"
            );
        }
    }

    /// Remove all tombstones for `region`. Called when the region is
    /// cleared or destroyed.
    pub fn unschedule(&self, region: &Arc<Region>) {
        let dropped = self.sweeper_for(region).unschedule(region);
        debug!(region = %region.full_path(), dropped, "unscheduled tombstones");
    }

    /// The current block-GC count.
    pub fn block_gc_count(&self) -> u32 {
        *self.block_gc.lock()
    }

    /// Suppress cluster GC of replicated tombstones; returns the new
    /// count.
    pub fn increment_block_gc(&self) -> u32 {
        let mut count = self.block_gc.lock();
        *count += 1;
        *count
    }

    /// Release one suppression; returns the new count.
    pub fn decrement_block_gc(&self) -> u32 {
        let mut count = self.block_gc.lock();
        *count = count.saturating_sub(1);
        *count
    }

    /// Remove tombstones of `region` whose region versions are covered
    /// by `gc_versions` (per destroying member). The region's GC RVV is
    /// advanced first, and persisted before any removal if the region
    /// is persistent.
    ///
    /// Returns `None` when GC is currently blocked (the caller should
    /// retry later); otherwise the set of removed keys, which is empty
    /// unless `needs_keys` is set.
    pub fn gc_by_rvv(
        &self,
        region: &Arc<Region>,
        gc_versions: &HashMap<MemberId, u64>,
        needs_keys: bool,
    ) -> Option<HashSet<String>> {
        let block = self.block_gc.lock();
        if *block > 0 {
            debug!(count = *block, "gc by rvv skipped, gc is blocked");
            return None;
        }
        debug!(region = %region.full_path(), versions = ?gc_versions, "gc by rvv");

        let my_id = region.version_member().clone();
        let sweeper = self.sweeper_for(region);
        let removals = sweeper.remove_matching(|t| {
            if !t.is_for(region) {
                return false;
            }
            let destroyer = t.tag().member_id.as_ref().unwrap_or(&my_id);
            gc_versions
                .get(destroyer)
                .is_some_and(|&max| t.region_version() <= max)
        });
        let bytes: i64 = removals.iter().map(|t| t.size() as i64).sum();
        sweeper.inc_queue_bytes(-bytes);

        // Record the GC versions now so they can be persisted before
        // the entries leave the map.
        {
            let mut rvv = region.version_vector().write();
            for (member, &version) in gc_versions {
                rvv.record_gc_version(member, version);
            }
            rvv.prune_old_exceptions();
        }
        if region.is_persistent() {
            if let Err(e) = region.persist_gc_rvv() {
                warn!(
                    region = %region.full_path(),
                    error = %ReclamationError::from(e),
                    "failed to persist GC RVV, deferring tombstone removal"
                );
                // Nothing was removed from the map; put the tombstones
                // back so a retry can still find them.
                for t in removals {
                    sweeper.schedule(t);
                }
                return None;
            }
        }

        let mut removed_keys = HashSet::new();
        for t in removals {
            match region.remove_tombstone(t.entry(), t.tag(), false, true) {
                Ok(still_present) => {
                    if needs_keys && still_present {
                        removed_keys.insert(t.entry().key().to_string());
                    }
                }
                Err(RegionMapError::Cancelled) => {}
                Err(e) => warn!(tombstone = %t, error = %e, "error removing gc'd tombstone"),
            }
        }
        Some(removed_keys)
    }

    /// Remove tombstones of `region` matching the given keys. This is
    /// the client-side path for partitioned servers: bucket version
    /// vectors make no sense on the client, so the server sends the
    /// reclaimed keys instead.
    pub fn gc_by_keys(&self, region: &Arc<Region>, keys: &HashSet<String>) {
        if !region.has_server_proxy() {
            // Without a server there is nothing to mirror.
            return;
        }
        debug!(region = %region.full_path(), count = keys.len(), "gc by keys");

        let sweeper = self.sweeper_for(region);
        let removals =
            sweeper.remove_matching(|t| t.is_for(region) && keys.contains(t.entry().key()));
        let bytes: i64 = removals.iter().map(|t| t.size() as i64).sum();
        sweeper.inc_queue_bytes(-bytes);

        for t in removals {
            match region.remove_tombstone(t.entry(), t.tag(), false, true) {
                Ok(_) => {}
                Err(RegionMapError::Cancelled) => {}
                Err(e) => warn!(tombstone = %t, error = %e, "error removing gc'd tombstone"),
            }
        }
    }

    /// Test support: force expiration of `count` replicated tombstones
    /// and wait (bounded) for the resulting batch reclamation.
    pub fn force_batch_expiration_for_tests(&self, count: u64) -> bool {
        let latch = Arc::new(Latch::new(1));
        self.replicated.set_batch_hook(Some(Arc::clone(&latch)));
        self.replicated.force_expiration(count);
        self.replicated.notify();
        // Bounded so a wedged sweeper fails the test instead of
        // hanging it.
        let expired = latch.wait_for(Duration::from_secs(30));
        self.replicated.set_batch_hook(None);
        expired
    }

    /// Bytes held by replicated-region tombstones.
    pub fn replicated_queue_bytes(&self) -> u64 {
        self.replicated.queue_bytes()
    }

    /// Bytes held by non-replicated tombstones.
    pub fn non_replicated_queue_bytes(&self) -> u64 {
        self.non_replicated.queue_bytes()
    }

    /// The sweeper servicing `region`: replicated scope goes to the
    /// batch sweeper, everything else (including regions without a
    /// data policy) to the non-replicated one.
    fn sweeper_for(&self, region: &Arc<Region>) -> &Arc<TombstoneSweeper> {
        if region.is_replicated_scope() {
            &self.replicated
        } else {
            &self.non_replicated
        }
    }
}

impl fmt::Display for TombstoneService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Destroyed entries GC service. replicated: {} queued ({} bytes, {} expired), \
             non-replicated: {} queued ({} bytes)",
            self.replicated.queued_count(),
            self.replicated.queue_bytes(),
            self.replicated.expired_count(),
            self.non_replicated.queued_count(),
            self.non_replicated.queue_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{
        DataPolicy, RegionAttributes, RegionMap, Scope, VersionStamp,
    };

    struct NullMap;

    impl RegionMap for NullMap {
        fn remove_tombstone(
            &self,
            _entry: &Arc<dyn RegionEntry>,
            _tag: &VersionTag,
            _cancelled: bool,
            _destroy: bool,
        ) -> Result<bool, RegionMapError> {
            Ok(true)
        }

        fn is_tombstone_not_needed(
            &self,
            _entry: &Arc<dyn RegionEntry>,
            _entry_version: u64,
        ) -> bool {
            false
        }
    }

    struct TestEntry {
        key: String,
        versioned: bool,
    }

    impl RegionEntry for TestEntry {
        fn key(&self) -> &str {
            &self.key
        }

        fn version_stamp(&self) -> Option<VersionStamp> {
            self.versioned.then(|| VersionTag::local(1, 1, 0))
        }
    }

    fn entry(key: &str) -> Arc<dyn RegionEntry> {
        Arc::new(TestEntry {
            key: key.to_string(),
            versioned: true,
        })
    }

    fn replicated_region(path: &str) -> Arc<Region> {
        Region::builder(path, Arc::new(NullMap))
            .attributes(
                RegionAttributes::builder()
                    .scope(Scope::Distributed)
                    .data_policy(DataPolicy {
                        with_replication: true,
                        with_persistence: false,
                    })
                    .build(),
            )
            .build()
    }

    fn local_region(path: &str) -> Arc<Region> {
        Region::builder(path, Arc::new(NullMap))
            .attributes(RegionAttributes::default())
            .build()
    }

    fn service() -> TombstoneService {
        TombstoneService::new(Arc::new(CacheRuntime::new()), ReclamationConfig::default())
    }

    #[test]
    fn test_dispatch_by_region_kind() {
        let service = service();
        let replicated = replicated_region("/rep");
        let local = local_region("/loc");

        service.schedule(&replicated, entry("a"), VersionTag::new(MemberId::new("m"), 1, 1, 0));
        service.schedule(&local, entry("b"), VersionTag::new(MemberId::new("m"), 1, 1, 0));

        assert!(service.replicated_queue_bytes() > 0);
        assert!(service.non_replicated_queue_bytes() > 0);

        service.stop();
    }

    #[test]
    fn test_unversioned_entry_is_rejected() {
        let service = service();
        let region = local_region("/r");
        let unversioned = Arc::new(TestEntry {
            key: "k".to_string(),
            versioned: false,
        });

        service.schedule(&region, unversioned, VersionTag::new(MemberId::new("m"), 1, 1, 0));

        assert_eq!(service.non_replicated_queue_bytes(), 0);
        service.stop();
    }

    #[test]
    fn test_block_gc_counter() {
        let service = service();

        assert_eq!(service.block_gc_count(), 0);
        assert_eq!(service.increment_block_gc(), 1);
        assert_eq!(service.increment_block_gc(), 2);
        assert_eq!(service.decrement_block_gc(), 1);
        assert_eq!(service.decrement_block_gc(), 0);
        // Extra decrements never underflow.
        assert_eq!(service.decrement_block_gc(), 0);

        service.stop();
    }

    #[test]
    fn test_gc_by_rvv_blocked_returns_sentinel() {
        let service = service();
        let region = replicated_region("/r");

        service.increment_block_gc();
        let result = service.gc_by_rvv(&region, &HashMap::new(), false);
        assert!(result.is_none());

        service.decrement_block_gc();
        let result = service.gc_by_rvv(&region, &HashMap::new(), false);
        assert_eq!(result, Some(HashSet::new()));

        service.stop();
    }

    #[test]
    fn test_gc_by_keys_requires_server_proxy() {
        let service = service();
        let region = local_region("/r");

        service.schedule(&region, entry("k1"), VersionTag::new(MemberId::new("m"), 1, 1, 0));
        let before = service.non_replicated_queue_bytes();

        // No server proxy: nothing to gc for a server.
        let mut keys = HashSet::new();
        keys.insert("k1".to_string());
        service.gc_by_keys(&region, &keys);

        assert_eq!(service.non_replicated_queue_bytes(), before);
        service.stop();
    }

    #[test]
    fn test_display_summary() {
        let service = service();
        let text = service.to_string();
        assert!(text.contains("GC service"));
        service.stop();
    }
}
