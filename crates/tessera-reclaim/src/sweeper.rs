//! The tombstone sweeper.
//!
//! One sweeper instance services one class of regions (replicated or
//! not); the two instances differ only in expiry and batch mode. Each
//! owns a dedicated background thread that waits out the head of the
//! sweep queue, periodically scans for defunct (resurrected)
//! tombstones, and in batch mode accumulates expired tombstones until
//! a cluster-coordinated reclamation pass is worthwhile.

use crate::config::ReclamationConfig;
use crate::tombstone::{SweepQueue, Tombstone};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tessera_core::{CacheRuntime, Latch, Region, RegionId, RegionMapError};
use tracing::{debug, error, trace, warn};

/// Longest the sweeper waits before re-evaluating its queue.
const MAX_SLEEP_MS: u64 = 10_000;

/// Starting estimate of the time a defunct scan needs.
const MIN_SCAN_MS: u64 = 100;

/// What the sweeper thread should do after one loop iteration.
pub(crate) enum Flow {
    /// Wait up to this many milliseconds (0 = re-run immediately).
    Sleep(u64),
    /// Leave the loop.
    Exit,
}

/// Loop-local state carried between iterations.
pub(crate) struct SweepCursor {
    last_scan_ms: u64,
    min_scan_ms: u64,
    force_batch: bool,
}

impl SweepCursor {
    pub(crate) fn new(now_ms: u64) -> Self {
        SweepCursor {
            last_scan_ms: now_ms,
            min_scan_ms: MIN_SCAN_MS,
            force_batch: false,
        }
    }
}

pub(crate) struct TombstoneSweeper {
    expiry_ms: u64,
    batch_mode: bool,
    config: ReclamationConfig,
    runtime: Arc<CacheRuntime>,
    /// The current-tombstone lock: guards the slot and the queue as one
    /// logical sequence.
    state: Mutex<SweepQueue>,
    /// Bytes held by queued tombstones. Signed so concurrent removals
    /// may transiently race ahead of additions.
    queue_bytes: AtomicI64,
    /// Age-expired tombstones awaiting cluster GC (batch mode only).
    expired: Mutex<Vec<Arc<Tombstone>>>,
    /// Reentrancy guard: part of a reclamation pass runs on the worker
    /// pool, and until that completes no new pass may start.
    batch_in_progress: Arc<AtomicBool>,
    /// Count of tombstones to expire ahead of schedule (test driven).
    forced_expiration: AtomicU64,
    /// Cluster-wide GC suppression counter, shared with the service.
    block_gc: Arc<Mutex<u32>>,
    stopped: AtomicBool,
    /// Wait/notify rendezvous for the loop. Leaf lock: nothing else is
    /// acquired while it is held.
    wake: Mutex<()>,
    wake_cv: Condvar,
    batch_expired_hook: Mutex<Option<Arc<Latch>>>,
    exited: Latch,
}

impl TombstoneSweeper {
    pub(crate) fn new(
        expiry_ms: u64,
        batch_mode: bool,
        config: ReclamationConfig,
        runtime: Arc<CacheRuntime>,
        block_gc: Arc<Mutex<u32>>,
    ) -> Self {
        TombstoneSweeper {
            expiry_ms,
            batch_mode,
            config,
            runtime,
            state: Mutex::new(SweepQueue::new()),
            queue_bytes: AtomicI64::new(0),
            expired: Mutex::new(Vec::new()),
            batch_in_progress: Arc::new(AtomicBool::new(false)),
            forced_expiration: AtomicU64::new(0),
            block_gc,
            stopped: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            batch_expired_hook: Mutex::new(None),
            exited: Latch::new(1),
        }
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let sweeper = Arc::clone(self);
        let name = if self.batch_mode {
            "tessera-tombstone-gc-replicated"
        } else {
            "tessera-tombstone-gc-non-replicated"
        };
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || sweeper.run());
        if let Err(e) = spawned {
            error!(error = %e, "failed to start tombstone sweeper");
            self.exited.count_down();
        }
    }

    /// Flag the loop to stop, wake it, and wait briefly for it to
    /// leave; then drop all queued tombstones.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify();
        let _ = self.exited.wait_for(Duration::from_millis(100));
        self.state.lock().clear();
        self.expired.lock().clear();
        self.queue_bytes.store(0, Ordering::SeqCst);
    }

    /// Wake the sweeper thread out of its timed wait.
    pub(crate) fn notify(&self) {
        let _guard = self.wake.lock();
        self.wake_cv.notify_all();
    }

    pub(crate) fn schedule(&self, tombstone: Arc<Tombstone>) {
        let size = tombstone.size() as i64;
        self.state.lock().push(tombstone);
        self.inc_queue_bytes(size);
    }

    /// Remove every tombstone of `region` from the slot, the queue and
    /// the expired batch. Returns how many were dropped.
    pub(crate) fn unschedule(&self, region: &Arc<Region>) -> usize {
        let mut removed = self.state.lock().remove_region(region);
        self.expired.lock().retain(|t| {
            if t.is_for(region) {
                removed.push(t.clone());
                false
            } else {
                true
            }
        });
        let bytes: i64 = removed.iter().map(|t| t.size() as i64).sum();
        self.inc_queue_bytes(-bytes);
        removed.len()
    }

    /// Scan the current slot and the queue as one sequence under the
    /// current-tombstone lock, removing and returning every tombstone
    /// the predicate claims.
    pub(crate) fn remove_matching<F>(&self, predicate: F) -> Vec<Arc<Tombstone>>
    where
        F: FnMut(&Arc<Tombstone>) -> bool,
    {
        self.state.lock().remove_matching(predicate)
    }

    pub(crate) fn queue_bytes(&self) -> u64 {
        self.queue_bytes.load(Ordering::SeqCst).max(0) as u64
    }

    pub(crate) fn inc_queue_bytes(&self, delta: i64) {
        self.queue_bytes.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.state.lock().len()
    }

    pub(crate) fn expired_count(&self) -> usize {
        self.expired.lock().len()
    }

    pub(crate) fn force_expiration(&self, count: u64) {
        self.forced_expiration.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn set_batch_hook(&self, hook: Option<Arc<Latch>>) {
        *self.batch_expired_hook.lock() = hook;
    }

    fn run(&self) {
        trace!(
            expiry_ms = self.expiry_ms,
            batch_mode = self.batch_mode,
            "tombstone sweeper starting"
        );
        let mut cursor = SweepCursor::new(self.runtime.cache_time_ms());
        loop {
            match self.sweep_once(&mut cursor) {
                Flow::Exit => break,
                Flow::Sleep(0) => continue,
                Flow::Sleep(ms) => {
                    trace!(ms, "sweeper sleeping");
                    let mut idle = self.wake.lock();
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    self.wake_cv
                        .wait_for(&mut idle, Duration::from_millis(ms));
                }
            }
        }
        self.exited.count_down();
    }

    /// One iteration of the sweeper loop.
    pub(crate) fn sweep_once(&self, cursor: &mut SweepCursor) -> Flow {
        if self.stopped.load(Ordering::SeqCst) {
            return Flow::Exit;
        }
        if let Some(reason) = self.runtime.cancel.cancel_in_progress() {
            debug!(reason = %reason, "sweeper exiting, cache shutdown in progress");
            return Flow::Exit;
        }

        self.publish_stats();
        let now = self.runtime.cache_time_ms();

        if self.batch_mode && self.forced_expiration.load(Ordering::SeqCst) == 0 {
            self.process_batch(cursor);
            self.check_memory_pressure(cursor);
        }

        let scan_interval = self.config.defunct_scan_interval_ms.min(self.expiry_ms);
        let min_retention = (self.expiry_ms / 10) as i64;

        let mut state = self.state.lock();
        if state.current.is_none() {
            match state.poll() {
                Some(t) => {
                    trace!(tombstone = %t, "current tombstone");
                    state.current = Some(t);
                }
                None => {
                    self.forced_expiration.store(0, Ordering::SeqCst);
                }
            }
        }

        let mut sleep_ms: i64 = 0;
        let mut expire_current = false;
        match &state.current {
            None => sleep_ms = self.expiry_ms as i64,
            Some(t) => {
                let remaining = t.timestamp_ms() as i64 + self.expiry_ms as i64 - now as i64;
                let age = now as i64 - t.timestamp_ms() as i64;
                if self.forced_expiration.load(Ordering::SeqCst) > 0 {
                    if remaining > 0 && (remaining <= min_retention || age < min_retention) {
                        // Tombstones about to expire are simply waited
                        // out, and those below the retention floor may
                        // not be expired early at all.
                        sleep_ms = remaining;
                    } else {
                        self.forced_expiration.fetch_sub(1, Ordering::SeqCst);
                        expire_current = true;
                    }
                } else if remaining > 0 {
                    sleep_ms = remaining;
                } else {
                    expire_current = true;
                }
            }
        }

        if expire_current {
            let t = state.current.take().expect("current tombstone is set");
            if self.batch_mode {
                trace!(tombstone = %t, "expiring tombstone into batch");
                self.expired.lock().push(t);
            } else {
                trace!(tombstone = %t, "removing expired tombstone");
                self.inc_queue_bytes(-(t.size() as i64));
                if let Some(region) = t.region() {
                    match region.remove_tombstone(t.entry(), t.tag(), false, true) {
                        Ok(_) => {}
                        Err(RegionMapError::Cancelled) => return Flow::Exit,
                        Err(e) => {
                            warn!(tombstone = %t, error = %e, "error removing expired tombstone");
                        }
                    }
                }
            }
        }

        if sleep_ms > 0 {
            // Long sleeps are broken up so resurrected tombstones get
            // swept out on the scan cadence.
            sleep_ms = sleep_ms.min(scan_interval as i64);
            if sleep_ms > cursor.min_scan_ms as i64
                && now.saturating_sub(cursor.last_scan_ms) >= scan_interval
            {
                cursor.last_scan_ms = now;
                let scan_start = now;
                sleep_ms = self.defunct_scan(&mut state, now, sleep_ms);
                if sleep_ms > 0 {
                    let elapsed = self.runtime.cache_time_ms().saturating_sub(scan_start);
                    sleep_ms -= elapsed as i64;
                    if sleep_ms <= 0 {
                        cursor.min_scan_ms = elapsed;
                        return Flow::Sleep(0);
                    }
                }
            }
        }
        drop(state);

        // Test hook: when nothing will expire for a full period, GC a
        // pending batch rather than letting it sit.
        if self.batch_mode
            && self.config.idle_expiration
            && sleep_ms >= self.expiry_ms as i64
            && !self.expired.lock().is_empty()
        {
            self.expire_batch();
        }

        Flow::Sleep((sleep_ms.max(0) as u64).min(MAX_SLEEP_MS))
    }

    /// Remove resurrected tombstones from the slot, the queue and (in
    /// batch mode) the expired batch; age queued tombstones into the
    /// batch. Returns the adjusted sleep time.
    fn defunct_scan(&self, state: &mut SweepQueue, now: u64, mut sleep_ms: i64) -> i64 {
        let mut removed_bytes: i64 = 0;
        let mut aged: Vec<Arc<Tombstone>> = Vec::new();

        enum SlotAction {
            Keep,
            Drop,
            Age,
        }
        let slot_action = match &state.current {
            None => SlotAction::Keep,
            Some(t) => {
                let gone = match t.region() {
                    None => true,
                    Some(region) => region.is_tombstone_not_needed(t.entry(), t.entry_version()),
                };
                if gone {
                    SlotAction::Drop
                } else if self.batch_mode && t.is_expired(self.expiry_ms, now) {
                    SlotAction::Age
                } else {
                    SlotAction::Keep
                }
            }
        };
        match slot_action {
            SlotAction::Keep => {}
            SlotAction::Drop => {
                let t = state.current.take().expect("current tombstone is set");
                trace!(tombstone = %t, "removing obsolete tombstone");
                removed_bytes += t.size() as i64;
                sleep_ms = 0;
            }
            SlotAction::Age => {
                let t = state.current.take().expect("current tombstone is set");
                trace!(tombstone = %t, "expiring tombstone into batch");
                aged.push(t);
                sleep_ms = 0;
            }
        }

        state.queue.retain(|t| {
            let gone = match t.region() {
                None => true,
                Some(region) => region.is_tombstone_not_needed(t.entry(), t.entry_version()),
            };
            if gone {
                trace!(tombstone = %t, "removing obsolete tombstone");
                removed_bytes += t.size() as i64;
                false
            } else if self.batch_mode && t.is_expired(self.expiry_ms, now) {
                trace!(tombstone = %t, "expiring tombstone into batch");
                aged.push(t.clone());
                false
            } else {
                true
            }
        });
        if !aged.is_empty() {
            sleep_ms = 0;
            self.expired.lock().extend(aged);
        }

        if self.batch_mode {
            self.expired.lock().retain(|t| {
                let gone = match t.region() {
                    None => true,
                    Some(region) => region.is_tombstone_not_needed(t.entry(), t.entry_version()),
                };
                if gone {
                    trace!(tombstone = %t, "removing obsolete tombstone from batch");
                    removed_bytes += t.size() as i64;
                    false
                } else {
                    true
                }
            });
        }

        if removed_bytes != 0 {
            self.inc_queue_bytes(-removed_bytes);
        }
        sleep_ms
    }

    fn publish_stats(&self) {
        let bytes = self.queue_bytes();
        if self.batch_mode {
            self.runtime.stats.set_replicated_tombstone_bytes(bytes);
        } else {
            self.runtime.stats.set_non_replicated_tombstone_bytes(bytes);
        }
    }

    /// Kick off batch reclamation when the batch is large enough, was
    /// forced, or a test hook is armed.
    fn process_batch(&self, cursor: &mut SweepCursor) {
        let hook_armed = self.batch_expired_hook.lock().is_some();
        if cursor.force_batch
            || self.expired.lock().len() >= self.config.expired_limit
            || hook_armed
        {
            cursor.force_batch = false;
            self.expire_batch();
        }
    }

    /// When free memory is short, reclaim a partially filled batch
    /// early. Only already-expired tombstones are touched: forcing age
    /// expiration here could let resurrected writes go undetected.
    fn check_memory_pressure(&self, cursor: &mut SweepCursor) {
        let threshold = self.config.memory_threshold();
        if threshold <= 0.0 {
            return;
        }
        let memory = &self.runtime.memory;
        let total = memory.total();
        let free = memory.free() + memory.max().saturating_sub(total);
        let low = self.config.force_gc_memory_events
            || (total > 0 && (free as f64) / (total as f64) < threshold);
        if low {
            cursor.force_batch = !self.batch_in_progress.load(Ordering::SeqCst)
                && self.expired.lock().len() > self.config.expired_limit / 4;
            if cursor.force_batch {
                debug!("forcing batch expiration due to low memory conditions");
            }
        }
    }

    /// Reclaim the expired batch: advance and persist the GC RVVs,
    /// then remove the tombstones from their region maps, then notify
    /// peers from the worker pool.
    pub(crate) fn expire_batch(&self) {
        if self.batch_in_progress.load(Ordering::SeqCst) {
            return;
        }
        let block = self.block_gc.lock();
        if *block > 0 {
            debug!(count = *block, "batch reclamation skipped, gc is blocked");
            return;
        }
        self.batch_in_progress.store(true, Ordering::SeqCst);

        let expired = std::mem::take(&mut *self.expired.lock());

        // Record the GC versions first so they can be persisted before
        // any entry leaves the map.
        let mut regions: HashMap<RegionId, (Arc<Region>, HashSet<String>)> = HashMap::new();
        for t in &expired {
            if let Some(region) = t.region() {
                {
                    let mut rvv = region.version_vector().write();
                    let member = t
                        .tag()
                        .member_id
                        .clone()
                        .unwrap_or_else(|| region.version_member().clone());
                    rvv.record_gc_version(&member, t.region_version());
                }
                regions
                    .entry(region.id())
                    .or_insert_with(|| (region, HashSet::new()));
            }
        }

        let mut persist_failed = false;
        for (region, _) in regions.values() {
            region.version_vector().write().prune_old_exceptions();
            if region.is_persistent() {
                // The GC RVV must be durable before the in-memory
                // removes; recovery would otherwise surface tombstones
                // that were already collected.
                if let Err(e) = region.persist_gc_rvv() {
                    error!(
                        region = %region.full_path(),
                        error = %crate::error::ReclamationError::from(e),
                        "failed to persist GC RVV, abandoning reclamation pass"
                    );
                    persist_failed = true;
                    break;
                }
            }
        }
        if persist_failed {
            self.expired.lock().extend(expired);
            self.count_down_batch_hook();
            self.batch_in_progress.store(false, Ordering::SeqCst);
            return;
        }

        let mut removal_bytes: i64 = 0;
        for t in &expired {
            removal_bytes += t.size() as i64;
            let Some(region) = t.region() else { continue };
            match region.remove_tombstone(t.entry(), t.tag(), false, true) {
                Ok(true) if region.is_partitioned_bucket() => {
                    // Clients see all buckets as one region, so they
                    // are told which keys were reclaimed.
                    if let Some((_, keys)) = regions.get_mut(&region.id()) {
                        keys.insert(t.entry().key().to_string());
                    }
                }
                Ok(_) => {}
                Err(RegionMapError::Cancelled) => {}
                Err(e) => {
                    warn!(tombstone = %t, error = %e, "error removing batched tombstone");
                }
            }
        }
        self.inc_queue_bytes(-removal_bytes);

        // Messaging runs on the waiting pool so the sweeper is never
        // stuck talking to peers.
        let work: Vec<(Arc<Region>, HashSet<String>)> = regions.into_values().collect();
        let in_progress = Arc::clone(&self.batch_in_progress);
        self.runtime.pool.execute(Box::new(move || {
            for (region, keys) in work {
                region.distribute_tombstone_gc(&keys);
            }
            in_progress.store(false, Ordering::SeqCst);
        }));

        self.count_down_batch_hook();
    }

    fn count_down_batch_hook(&self) {
        if let Some(latch) = self.batch_expired_hook.lock().as_ref() {
            latch.count_down();
        }
    }
}
