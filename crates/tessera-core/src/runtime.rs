//! The cache runtime seam.
//!
//! Background subsystems see the cache only through `CacheRuntime`:
//! a clock, a cancellation signal, a worker pool for off-thread
//! hand-offs, performance gauges, and a view of process memory usage.
//! Every piece is a trait with a production implementation and a test
//! double, so subsystem behavior can be driven deterministically.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of cache time in milliseconds.
pub trait Clock: Send + Sync {
    fn cache_time_ms(&self) -> u64;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn cache_time_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock advanced explicitly by tests.
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn cache_time_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Reports whether the cache is shutting down.
pub trait CancelCriterion: Send + Sync {
    /// `Some(reason)` once shutdown has begun.
    fn cancel_in_progress(&self) -> Option<String>;
}

/// A criterion that never cancels.
pub struct NeverCancelled;

impl CancelCriterion for NeverCancelled {
    fn cancel_in_progress(&self) -> Option<String> {
        None
    }
}

/// Runs tasks off the caller's thread.
pub trait TaskPool: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// A pool that runs each task on a fresh named thread. Stands in for
/// the distribution manager's waiting pool.
pub struct ThreadPool {
    name: String,
}

impl ThreadPool {
    pub fn new(name: impl Into<String>) -> Self {
        ThreadPool { name: name.into() }
    }
}

impl TaskPool for ThreadPool {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        let spawned = thread::Builder::new().name(self.name.clone()).spawn(task);
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn worker thread");
        }
    }
}

/// Runs tasks inline on the caller. Test double.
pub struct InlinePool;

impl TaskPool for InlinePool {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// A view of process memory, for pressure heuristics.
pub trait RuntimeMemoryUsage: Send + Sync {
    fn free(&self) -> u64;
    fn total(&self) -> u64;
    fn max(&self) -> u64;
}

/// Reports a fully free heap; pressure heuristics never fire.
pub struct UnboundedMemory;

impl RuntimeMemoryUsage for UnboundedMemory {
    fn free(&self) -> u64 {
        u64::MAX / 2
    }

    fn total(&self) -> u64 {
        u64::MAX / 2
    }

    fn max(&self) -> u64 {
        u64::MAX / 2
    }
}

/// Fixed memory figures settable by tests.
pub struct FixedMemory {
    free: AtomicU64,
    total: AtomicU64,
    max: AtomicU64,
}

impl FixedMemory {
    pub fn new(free: u64, total: u64, max: u64) -> Self {
        FixedMemory {
            free: AtomicU64::new(free),
            total: AtomicU64::new(total),
            max: AtomicU64::new(max),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl RuntimeMemoryUsage for FixedMemory {
    fn free(&self) -> u64 {
        self.free.load(Ordering::SeqCst)
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    fn max(&self) -> u64 {
        self.max.load(Ordering::SeqCst)
    }
}

/// Performance gauges published by cache subsystems.
#[derive(Default)]
pub struct CachePerfStats {
    replicated_tombstone_bytes: AtomicU64,
    non_replicated_tombstone_bytes: AtomicU64,
}

impl CachePerfStats {
    pub fn new() -> Self {
        CachePerfStats::default()
    }

    pub fn set_replicated_tombstone_bytes(&self, bytes: u64) {
        self.replicated_tombstone_bytes
            .store(bytes, Ordering::Relaxed);
    }

    pub fn replicated_tombstone_bytes(&self) -> u64 {
        self.replicated_tombstone_bytes.load(Ordering::Relaxed)
    }

    pub fn set_non_replicated_tombstone_bytes(&self, bytes: u64) {
        self.non_replicated_tombstone_bytes
            .store(bytes, Ordering::Relaxed);
    }

    pub fn non_replicated_tombstone_bytes(&self) -> u64 {
        self.non_replicated_tombstone_bytes.load(Ordering::Relaxed)
    }
}

/// Everything a background subsystem needs from the cache.
pub struct CacheRuntime {
    pub clock: Arc<dyn Clock>,
    pub cancel: Arc<dyn CancelCriterion>,
    pub pool: Arc<dyn TaskPool>,
    pub stats: Arc<CachePerfStats>,
    pub memory: Arc<dyn RuntimeMemoryUsage>,
}

impl CacheRuntime {
    /// A production runtime: system clock, never-cancelled criterion,
    /// thread-per-task waiting pool, fresh gauges, unbounded memory.
    pub fn new() -> Self {
        CacheRuntime {
            clock: Arc::new(SystemClock),
            cancel: Arc::new(NeverCancelled),
            pool: Arc::new(ThreadPool::new("tessera-waiting-pool")),
            stats: Arc::new(CachePerfStats::new()),
            memory: Arc::new(UnboundedMemory),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<dyn CancelCriterion>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_pool(mut self, pool: Arc<dyn TaskPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn RuntimeMemoryUsage>) -> Self {
        self.memory = memory;
        self
    }

    pub fn cache_time_ms(&self) -> u64 {
        self.clock.cache_time_ms()
    }
}

impl Default for CacheRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// A countdown latch with a bounded wait.
pub struct Latch {
    remaining: Mutex<u32>,
    condvar: Condvar,
}

impl Latch {
    pub fn new(count: u32) -> Self {
        Latch {
            remaining: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.condvar.notify_all();
            }
        }
    }

    /// Wait until the latch reaches zero or `timeout` elapses. Returns
    /// true when the latch opened.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.condvar.wait_for(&mut remaining, deadline - now);
        }
        true
    }
}
