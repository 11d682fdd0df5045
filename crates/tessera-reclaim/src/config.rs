//! Reclamation configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the tombstone reclamation subsystem.
///
/// The defaults reproduce the store's shipped behavior: replicated
/// tombstones live ten minutes, non-replicated ones eight, and the
/// replicated sweeper reclaims in batches of up to 100,000.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReclamationConfig {
    /// Expiry for replicated-region tombstones (`tombstone-timeout`).
    /// This is the window during which a destroy may still conflict
    /// with a concurrent operation from a peer.
    #[serde(default = "defaults::replicated_timeout_ms")]
    pub replicated_timeout_ms: u64,

    /// Expiry for non-replicated and client tombstones
    /// (`non-replicated-tombstone-timeout`). Kept shorter than the
    /// replicated timeout: revisions issued from a non-replicated
    /// tombstone could otherwise overwrite peers that already dropped
    /// theirs.
    #[serde(default = "defaults::non_replicated_timeout_ms")]
    pub non_replicated_timeout_ms: u64,

    /// Maximum expired tombstones accumulated before a batch is
    /// reclaimed (`tombstone-gc-threshold`).
    #[serde(default = "defaults::expired_limit")]
    pub expired_limit: usize,

    /// Cadence of the defunct-tombstone scan
    /// (`tombstone-scan-interval`).
    #[serde(default = "defaults::defunct_scan_interval_ms")]
    pub defunct_scan_interval_ms: u64,

    /// Percentage of max memory that must remain free before batch
    /// reclamation is accelerated (`tombstone-gc-memory-threshold`).
    /// Zero disables the heuristic.
    #[serde(default = "defaults::gc_memory_threshold_pct")]
    pub gc_memory_threshold_pct: u32,

    /// Test hook: behave as though free memory is low.
    #[serde(default)]
    pub force_gc_memory_events: bool,

    /// Test hook: reclaim a pending batch whenever the sweeper would
    /// otherwise go fully idle.
    #[serde(default)]
    pub idle_expiration: bool,

    /// Test hook: trace queue sizes on every schedule.
    #[serde(default)]
    pub debug_tombstone_count: bool,
}

mod defaults {
    pub fn replicated_timeout_ms() -> u64 {
        600_000
    }

    pub fn non_replicated_timeout_ms() -> u64 {
        480_000
    }

    pub fn expired_limit() -> usize {
        100_000
    }

    pub fn defunct_scan_interval_ms() -> u64 {
        60_000
    }

    pub fn gc_memory_threshold_pct() -> u32 {
        30
    }
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        ReclamationConfig {
            replicated_timeout_ms: defaults::replicated_timeout_ms(),
            non_replicated_timeout_ms: defaults::non_replicated_timeout_ms(),
            expired_limit: defaults::expired_limit(),
            defunct_scan_interval_ms: defaults::defunct_scan_interval_ms(),
            gc_memory_threshold_pct: defaults::gc_memory_threshold_pct(),
            force_gc_memory_events: false,
            idle_expiration: false,
            debug_tombstone_count: false,
        }
    }
}

impl ReclamationConfig {
    pub fn builder() -> ReclamationConfigBuilder {
        ReclamationConfigBuilder::new()
    }

    /// The memory threshold as a ratio of free to total memory.
    pub fn memory_threshold(&self) -> f64 {
        self.gc_memory_threshold_pct as f64 * 0.01
    }
}

/// Builder for [`ReclamationConfig`].
pub struct ReclamationConfigBuilder {
    config: ReclamationConfig,
}

impl ReclamationConfigBuilder {
    pub fn new() -> Self {
        ReclamationConfigBuilder {
            config: ReclamationConfig::default(),
        }
    }

    pub fn replicated_timeout_ms(mut self, ms: u64) -> Self {
        self.config.replicated_timeout_ms = ms;
        self
    }

    pub fn non_replicated_timeout_ms(mut self, ms: u64) -> Self {
        self.config.non_replicated_timeout_ms = ms;
        self
    }

    pub fn expired_limit(mut self, limit: usize) -> Self {
        self.config.expired_limit = limit;
        self
    }

    pub fn defunct_scan_interval_ms(mut self, ms: u64) -> Self {
        self.config.defunct_scan_interval_ms = ms;
        self
    }

    pub fn gc_memory_threshold_pct(mut self, pct: u32) -> Self {
        self.config.gc_memory_threshold_pct = pct;
        self
    }

    pub fn force_gc_memory_events(mut self, enabled: bool) -> Self {
        self.config.force_gc_memory_events = enabled;
        self
    }

    pub fn idle_expiration(mut self, enabled: bool) -> Self {
        self.config.idle_expiration = enabled;
        self
    }

    pub fn debug_tombstone_count(mut self, enabled: bool) -> Self {
        self.config.debug_tombstone_count = enabled;
        self
    }

    pub fn build(self) -> ReclamationConfig {
        self.config
    }
}

impl Default for ReclamationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
