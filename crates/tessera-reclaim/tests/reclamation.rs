//! End-to-end tests for tombstone reclamation.
//!
//! These drive the service with its background sweepers running, against
//! recording in-memory backends, and verify:
//! - age expiry on both sweepers
//! - the persistence barrier: GC RVV writes precede in-memory removals
//! - block-GC suppression of batch reclamation and gc-by-rvv
//! - resurrection (defunct) sweeping
//! - gc by version watermark and gc by key

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tessera_core::{
    CachePerfStats, CacheRuntime, Clock, DataPolicy, DiskError, DiskRvvStore, GcDistributor,
    InlinePool, MemberId, NeverCancelled, Region, RegionAttributes, RegionEntry, RegionMap,
    RegionMapError, RegionVersionVector, Scope, SystemClock, TombstoneGcMessage, UnboundedMemory,
    VersionStamp, VersionTag,
};
use tessera_reclaim::{ReclamationConfig, TombstoneService};

/// Recording backends shared by the scenarios.
mod recording {
    use super::*;

    /// Everything observable that the subsystem did, in order.
    #[derive(Clone, Debug, PartialEq)]
    pub enum Event {
        Removed {
            region: String,
            key: String,
        },
        Persisted {
            region: String,
            gc_versions: Vec<(String, u64)>,
        },
        Distributed {
            region: String,
            keys: Vec<String>,
        },
    }

    pub type EventLog = Arc<Mutex<Vec<Event>>>;

    pub struct RecordingMap {
        pub region_path: String,
        pub events: EventLog,
        /// Keys whose entries have been recreated; their tombstones are
        /// reported as no longer needed.
        pub resurrected: Mutex<HashSet<String>>,
    }

    impl RegionMap for RecordingMap {
        fn remove_tombstone(
            &self,
            entry: &Arc<dyn RegionEntry>,
            _tag: &VersionTag,
            _cancelled: bool,
            _destroy: bool,
        ) -> Result<bool, RegionMapError> {
            self.events.lock().unwrap().push(Event::Removed {
                region: self.region_path.clone(),
                key: entry.key().to_string(),
            });
            Ok(true)
        }

        fn is_tombstone_not_needed(
            &self,
            entry: &Arc<dyn RegionEntry>,
            _entry_version: u64,
        ) -> bool {
            self.resurrected.lock().unwrap().contains(entry.key())
        }
    }

    pub struct RecordingDisk {
        pub events: EventLog,
        /// When set, the next write fails (and clears the flag).
        pub fail_next: AtomicBool,
    }

    impl DiskRvvStore for RecordingDisk {
        fn write_rvv_gc(
            &self,
            region_path: &str,
            rvv: &RegionVersionVector,
        ) -> Result<(), DiskError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(DiskError::WriteFailed("injected write failure".to_string()));
            }
            let gc_versions = rvv
                .gc_versions()
                .map(|(m, v)| (m.to_string(), v))
                .collect();
            self.events.lock().unwrap().push(Event::Persisted {
                region: region_path.to_string(),
                gc_versions,
            });
            Ok(())
        }
    }

    pub struct RecordingDistributor {
        pub events: EventLog,
    }

    impl GcDistributor for RecordingDistributor {
        fn distribute_tombstone_gc(&self, message: TombstoneGcMessage) {
            self.events.lock().unwrap().push(Event::Distributed {
                region: message.region_path,
                keys: message.keys,
            });
        }
    }
}

use recording::{Event, EventLog, RecordingDisk, RecordingDistributor, RecordingMap};

struct TestEntry {
    key: String,
}

impl RegionEntry for TestEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn version_stamp(&self) -> Option<VersionStamp> {
        Some(VersionTag::local(1, 1, 0))
    }
}

fn entry(key: &str) -> Arc<dyn RegionEntry> {
    Arc::new(TestEntry {
        key: key.to_string(),
    })
}

struct Fixture {
    events: EventLog,
    map: Arc<RecordingMap>,
}

impl Fixture {
    fn new(region_path: &str) -> Self {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let map = Arc::new(RecordingMap {
            region_path: region_path.to_string(),
            events: events.clone(),
            resurrected: Mutex::new(HashSet::new()),
        });
        Fixture { events, map }
    }

    fn region(&self, attributes: RegionAttributes, persistent_store: bool) -> Arc<Region> {
        let mut builder = Region::builder(self.map.region_path.clone(), self.map.clone())
            .attributes(attributes)
            .version_member(MemberId::new("local"))
            .distributor(Arc::new(RecordingDistributor {
                events: self.events.clone(),
            }));
        if persistent_store {
            builder = builder.disk_store(Arc::new(RecordingDisk {
                events: self.events.clone(),
                fail_next: AtomicBool::new(false),
            }));
        }
        builder.build()
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn removed_keys(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Removed { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }
}

fn replicated_attributes() -> RegionAttributes {
    RegionAttributes::builder()
        .scope(Scope::Distributed)
        .data_policy(DataPolicy {
            with_replication: true,
            with_persistence: false,
        })
        .build()
}

fn persistent_bucket_attributes() -> RegionAttributes {
    RegionAttributes::builder()
        .scope(Scope::Distributed)
        .data_policy(DataPolicy {
            with_replication: true,
            with_persistence: true,
        })
        .partitioned_bucket(true)
        .build()
}

fn runtime() -> Arc<CacheRuntime> {
    // Inline distribution keeps event ordering observable without a
    // second worker thread.
    Arc::new(CacheRuntime {
        clock: Arc::new(SystemClock),
        cancel: Arc::new(NeverCancelled),
        pool: Arc::new(InlinePool),
        stats: Arc::new(CachePerfStats::new()),
        memory: Arc::new(UnboundedMemory),
    })
}

fn now_ms() -> u64 {
    SystemClock.cache_time_ms()
}

fn tag(member: &str, region_version: u64, entry_version: u64, timestamp_ms: u64) -> VersionTag {
    VersionTag::new(MemberId::new(member), region_version, entry_version, timestamp_ms)
}

/// Poll until `condition` holds, failing the test after `timeout`.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn age_expiry_removes_non_replicated_tombstones() {
    let fixture = Fixture::new("/clients");
    let region = fixture.region(RegionAttributes::default(), false);
    let config = ReclamationConfig::builder()
        .non_replicated_timeout_ms(1000)
        .build();
    let service = TombstoneService::new(runtime(), config);

    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("m", 1, 1, start));
    service.schedule(&region, entry("k2"), tag("m", 2, 1, start));
    service.schedule(&region, entry("k3"), tag("m", 3, 1, start));
    assert!(service.non_replicated_queue_bytes() > 0);

    wait_until(Duration::from_secs(10), || fixture.removed_keys().len() == 3);

    assert_eq!(
        fixture.removed_keys().into_iter().collect::<HashSet<_>>(),
        HashSet::from(["k1".to_string(), "k2".to_string(), "k3".to_string()])
    );
    assert_eq!(service.non_replicated_queue_bytes(), 0);
    service.stop();
}

#[test]
fn batch_reclamation_persists_gc_rvv_before_removal() {
    let fixture = Fixture::new("/orders");
    let region = fixture.region(persistent_bucket_attributes(), true);
    let config = ReclamationConfig::builder()
        .replicated_timeout_ms(500)
        .expired_limit(2)
        .build();
    let service = TombstoneService::new(runtime(), config);

    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("a", 1, 1, start));
    service.schedule(&region, entry("k2"), tag("a", 2, 1, start));

    wait_until(Duration::from_secs(10), || {
        fixture
            .events()
            .iter()
            .any(|e| matches!(e, Event::Distributed { .. }))
    });

    let events = fixture.events();
    let persisted_at = events
        .iter()
        .position(|e| matches!(e, Event::Persisted { .. }))
        .expect("GC RVV was persisted");
    let first_removal = events
        .iter()
        .position(|e| matches!(e, Event::Removed { .. }))
        .expect("tombstones were removed");
    let distributed_at = events
        .iter()
        .position(|e| matches!(e, Event::Distributed { .. }))
        .expect("gc was distributed");

    // The barrier: persist strictly before any in-memory removal, and
    // distribution after everything.
    assert!(persisted_at < first_removal);
    assert!(first_removal < distributed_at);
    assert_eq!(fixture.removed_keys().len(), 2);

    // The persisted GC RVV already covered both reclaimed versions.
    match &events[persisted_at] {
        Event::Persisted { gc_versions, .. } => {
            assert_eq!(gc_versions.as_slice(), [("a".to_string(), 2)]);
        }
        _ => unreachable!(),
    }

    // Exactly one distribution, carrying the bucket's reclaimed keys.
    let distributions: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::Distributed { .. }))
        .collect();
    assert_eq!(distributions.len(), 1);
    match distributions[0] {
        Event::Distributed { keys, .. } => {
            assert_eq!(keys.as_slice(), ["k1".to_string(), "k2".to_string()]);
        }
        _ => unreachable!(),
    }

    let rvv = region.version_vector().read();
    assert_eq!(rvv.gc_version(&MemberId::new("a")), 2);
    service.stop();
}

#[test]
fn block_gc_suppresses_reclamation() {
    let fixture = Fixture::new("/blocked");
    let region = fixture.region(replicated_attributes(), false);
    let config = ReclamationConfig::builder()
        .replicated_timeout_ms(500)
        .expired_limit(1)
        .build();
    let service = TombstoneService::new(runtime(), config);

    service.increment_block_gc();

    // Schedule a tombstone that has already aged out; the sweeper will
    // batch it and try to reclaim, and must be refused.
    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("a", 1, 1, start.saturating_sub(1000)));
    std::thread::sleep(Duration::from_millis(300));
    assert!(fixture.events().is_empty());

    // gc-by-rvv is refused too, with the retry sentinel.
    let mut versions = HashMap::new();
    versions.insert(MemberId::new("a"), 5);
    assert_eq!(service.gc_by_rvv(&region, &versions, false), None);
    assert!(fixture.events().is_empty());

    service.decrement_block_gc();
    assert!(service.force_batch_expiration_for_tests(0));

    wait_until(Duration::from_secs(10), || !fixture.removed_keys().is_empty());
    assert_eq!(fixture.removed_keys().as_slice(), ["k1".to_string()]);
    service.stop();
}

#[test]
fn resurrected_tombstones_are_swept_without_destroy() {
    let fixture = Fixture::new("/sessions");
    let region = fixture.region(RegionAttributes::default(), false);
    let config = ReclamationConfig::builder()
        .non_replicated_timeout_ms(60_000)
        .defunct_scan_interval_ms(200)
        .build();
    let service = TombstoneService::new(runtime(), config);

    service.schedule(&region, entry("k1"), tag("m", 1, 1, now_ms()));
    assert!(service.non_replicated_queue_bytes() > 0);

    // Recreate the entry: the tombstone is now defunct.
    fixture
        .map
        .resurrected
        .lock()
        .unwrap()
        .insert("k1".to_string());

    wait_until(Duration::from_secs(10), || {
        service.non_replicated_queue_bytes() == 0
    });

    // Dropped from the sweeper without a destroy against the map.
    assert!(fixture.removed_keys().is_empty());
    service.stop();
}

#[test]
fn gc_by_rvv_removes_covered_versions() {
    let fixture = Fixture::new("/buckets");
    let mut attributes = persistent_bucket_attributes();
    attributes.data_policy = Some(DataPolicy {
        with_replication: true,
        with_persistence: false,
    });
    let region = fixture.region(attributes, false);
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("a", 1, 1, start));
    service.schedule(&region, entry("k2"), tag("a", 2, 1, start));
    service.schedule(&region, entry("k3"), tag("b", 3, 1, start));

    let mut versions = HashMap::new();
    versions.insert(MemberId::new("a"), 2);

    let keys = service.gc_by_rvv(&region, &versions, true).expect("not blocked");
    assert_eq!(
        keys,
        HashSet::from(["k1".to_string(), "k2".to_string()])
    );
    assert_eq!(fixture.removed_keys().len(), 2);

    // b's tombstone was not covered.
    let rvv = region.version_vector().read();
    assert_eq!(rvv.gc_version(&MemberId::new("a")), 2);
    assert_eq!(rvv.gc_version(&MemberId::new("b")), 0);
    drop(rvv);

    // Idempotence: a second identical call removes nothing more.
    let keys = service.gc_by_rvv(&region, &versions, true).expect("not blocked");
    assert!(keys.is_empty());
    assert_eq!(fixture.removed_keys().len(), 2);

    service.stop();
}

#[test]
fn gc_by_rvv_returns_empty_set_without_needs_keys() {
    let fixture = Fixture::new("/buckets");
    let region = fixture.region(replicated_attributes(), false);
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    service.schedule(&region, entry("k1"), tag("a", 1, 1, now_ms()));

    let mut versions = HashMap::new();
    versions.insert(MemberId::new("a"), 1);

    let keys = service.gc_by_rvv(&region, &versions, false).expect("not blocked");
    assert!(keys.is_empty());
    // The removal still happened; only the key reporting was skipped.
    assert_eq!(fixture.removed_keys().as_slice(), ["k1".to_string()]);

    service.stop();
}

#[test]
fn gc_by_rvv_requeues_tombstones_when_persist_fails() {
    let fixture = Fixture::new("/durable");
    let region = Region::builder(fixture.map.region_path.clone(), fixture.map.clone())
        .attributes(
            RegionAttributes::builder()
                .scope(Scope::Distributed)
                .data_policy(DataPolicy {
                    with_replication: true,
                    with_persistence: true,
                })
                .build(),
        )
        .version_member(MemberId::new("local"))
        .distributor(Arc::new(RecordingDistributor {
            events: fixture.events.clone(),
        }))
        .disk_store(Arc::new(RecordingDisk {
            events: fixture.events.clone(),
            fail_next: AtomicBool::new(true),
        }))
        .build();
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("a", 1, 1, start));
    service.schedule(&region, entry("k2"), tag("a", 2, 1, start));
    let queued = service.replicated_queue_bytes();

    let mut versions = HashMap::new();
    versions.insert(MemberId::new("a"), 2);

    // The disk write fails: the retry sentinel comes back, nothing was
    // removed from the map, and the tombstones are still accounted for.
    assert_eq!(service.gc_by_rvv(&region, &versions, true), None);
    assert!(fixture.removed_keys().is_empty());
    assert_eq!(service.replicated_queue_bytes(), queued);

    // A retry persists and still finds both tombstones.
    let keys = service.gc_by_rvv(&region, &versions, true).expect("not blocked");
    assert_eq!(keys, HashSet::from(["k1".to_string(), "k2".to_string()]));
    assert_eq!(fixture.removed_keys().len(), 2);
    assert_eq!(service.replicated_queue_bytes(), 0);
    assert!(fixture
        .events()
        .iter()
        .any(|e| matches!(e, Event::Persisted { .. })));

    service.stop();
}

#[test]
fn gc_by_rvv_substitutes_local_member() {
    let fixture = Fixture::new("/local-destroys");
    let region = fixture.region(replicated_attributes(), false);
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    // A destroy stamped without a member id belongs to the region's
    // own version member ("local" in this fixture).
    service.schedule(&region, entry("k1"), VersionTag::local(4, 1, now_ms()));

    let mut versions = HashMap::new();
    versions.insert(MemberId::new("local"), 4);

    service.gc_by_rvv(&region, &versions, false).expect("not blocked");
    assert_eq!(fixture.removed_keys().as_slice(), ["k1".to_string()]);

    service.stop();
}

#[test]
fn gc_by_keys_removes_matching_client_tombstones() {
    let fixture = Fixture::new("/client-view");
    let attributes = RegionAttributes::builder()
        .scope(Scope::Distributed)
        .server_proxy(true)
        .build();
    let region = fixture.region(attributes, false);
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("s", 1, 1, start));
    service.schedule(&region, entry("k2"), tag("s", 2, 1, start));
    service.schedule(&region, entry("k3"), tag("s", 3, 1, start));

    let keys = HashSet::from(["k1".to_string(), "k3".to_string()]);
    service.gc_by_keys(&region, &keys);

    assert_eq!(
        fixture.removed_keys().into_iter().collect::<HashSet<_>>(),
        keys
    );
    // k2 is still queued and accounted for.
    assert!(service.non_replicated_queue_bytes() > 0);

    service.stop();
}

#[test]
fn unschedule_leaves_nothing_behind() {
    let fixture = Fixture::new("/closing");
    let region = fixture.region(replicated_attributes(), false);
    let other_fixture = Fixture::new("/staying");
    let other = other_fixture.region(replicated_attributes(), false);
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    let start = now_ms();
    service.schedule(&region, entry("k1"), tag("a", 1, 1, start));
    service.schedule(&other, entry("o1"), tag("a", 1, 1, start));
    service.schedule(&region, entry("k2"), tag("a", 2, 1, start));

    service.unschedule(&region);

    // Only the other region's tombstone is still accounted for.
    let mut versions = HashMap::new();
    versions.insert(MemberId::new("a"), 100);
    let keys = service.gc_by_rvv(&region, &versions, true).expect("not blocked");
    assert!(keys.is_empty());
    assert!(fixture.removed_keys().is_empty());

    let keys = service.gc_by_rvv(&other, &versions, true).expect("not blocked");
    assert_eq!(keys, HashSet::from(["o1".to_string()]));

    service.stop();
}

#[test]
fn queue_bytes_match_scheduled_sizes() {
    let fixture = Fixture::new("/accounting");
    let region = fixture.region(replicated_attributes(), false);
    let service = TombstoneService::new(runtime(), ReclamationConfig::default());

    let start = now_ms();
    service.schedule(&region, entry("aa"), tag("a", 1, 1, start));
    service.schedule(&region, entry("bbbb"), tag("a", 2, 1, start));

    let expected = (tessera_reclaim::PER_TOMBSTONE_OVERHEAD + 2)
        + (tessera_reclaim::PER_TOMBSTONE_OVERHEAD + 4);
    assert_eq!(service.replicated_queue_bytes(), expected);

    service.unschedule(&region);
    assert_eq!(service.replicated_queue_bytes(), 0);

    service.stop();
}
