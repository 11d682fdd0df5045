//! The region model and its pluggable backends.
//!
//! A `Region` is the unit of replication and versioning: a named key
//! space with a scope, a data policy, a version vector, and backends
//! for entry storage (`RegionMap`), GC persistence (`DiskRvvStore`)
//! and peer notification (`GcDistributor`). Subsystems hold regions as
//! `Arc<Region>` and entries as `Arc<dyn RegionEntry>`; back-references
//! from long-lived records should be `Weak` so that a closed region can
//! be dropped.

use crate::member::MemberId;
use crate::version::{VersionStamp, VersionTag};
use crate::version_vector::RegionVersionVector;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use ulid::Ulid;

/// Whether a region is visible to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// Confined to this member.
    Local,
    /// Replicated or proxied across the distributed system.
    Distributed,
}

impl Scope {
    pub fn is_distributed(&self) -> bool {
        matches!(self, Scope::Distributed)
    }
}

/// How a region stores data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPolicy {
    /// The region keeps a full replica of the data set.
    pub with_replication: bool,
    /// The region is backed by disk and recovers state on restart.
    pub with_persistence: bool,
}

/// Static attributes of a region.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionAttributes {
    pub scope: Scope,
    /// Absent for regions created without an explicit policy; such
    /// regions are treated as non-replicated.
    pub data_policy: Option<DataPolicy>,
    /// True when the region is a client-side view backed by a server.
    pub server_proxy: bool,
    /// True when the region is one bucket of a partitioned region.
    pub partitioned_bucket: bool,
}

impl Default for RegionAttributes {
    fn default() -> Self {
        RegionAttributes {
            scope: Scope::Local,
            data_policy: None,
            server_proxy: false,
            partitioned_bucket: false,
        }
    }
}

impl RegionAttributes {
    pub fn builder() -> RegionAttributesBuilder {
        RegionAttributesBuilder::new()
    }
}

/// Builder for region attributes.
pub struct RegionAttributesBuilder {
    attributes: RegionAttributes,
}

impl RegionAttributesBuilder {
    pub fn new() -> Self {
        RegionAttributesBuilder {
            attributes: RegionAttributes::default(),
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.attributes.scope = scope;
        self
    }

    pub fn data_policy(mut self, policy: DataPolicy) -> Self {
        self.attributes.data_policy = Some(policy);
        self
    }

    pub fn server_proxy(mut self, server_proxy: bool) -> Self {
        self.attributes.server_proxy = server_proxy;
        self
    }

    pub fn partitioned_bucket(mut self, partitioned_bucket: bool) -> Self {
        self.attributes.partitioned_bucket = partitioned_bucket;
        self
    }

    pub fn build(self) -> RegionAttributes {
        self.attributes
    }
}

impl Default for RegionAttributesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies a region for the lifetime of the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionId(Ulid);

impl RegionId {
    fn generate() -> Self {
        RegionId(Ulid::new())
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An entry in a region map. Destroyed entries keep their slot (holding
/// the tombstone marker) until reclamation removes them.
pub trait RegionEntry: Send + Sync {
    /// The entry's key.
    fn key(&self) -> &str;

    /// The entry's version stamp; `None` for unversioned entries.
    fn version_stamp(&self) -> Option<VersionStamp>;
}

/// Failure of a region-map operation.
#[derive(Error, Debug)]
pub enum RegionMapError {
    /// The cache is shutting down; callers abandon the operation
    /// without logging.
    #[error("operation cancelled")]
    Cancelled,

    #[error("region map operation failed: {0}")]
    Failed(String),
}

/// The entry storage of a region, as seen by reclamation.
pub trait RegionMap: Send + Sync {
    /// Remove the tombstone marker for `entry` if it still carries
    /// `tag`. Returns true when the tombstone was still present.
    ///
    /// `cancelled` indicates the caller is unwinding; `destroy` marks
    /// the removal as the completion of a destroy rather than a simple
    /// unhook.
    fn remove_tombstone(
        &self,
        entry: &Arc<dyn RegionEntry>,
        tag: &VersionTag,
        cancelled: bool,
        destroy: bool,
    ) -> Result<bool, RegionMapError>;

    /// True when the entry has been resurrected or overwritten past
    /// `entry_version`, making its tombstone obsolete.
    fn is_tombstone_not_needed(&self, entry: &Arc<dyn RegionEntry>, entry_version: u64) -> bool;
}

/// Failure writing GC state to disk.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to write GC RVV: {0}")]
    WriteFailed(String),
}

/// Persists the GC portion of a region's version vector.
///
/// The write must be durable before any in-memory tombstone removal
/// for the region, so that recovery never resurrects a tombstone that
/// has been logically collected.
pub trait DiskRvvStore: Send + Sync {
    fn write_rvv_gc(&self, region_path: &str, rvv: &RegionVersionVector) -> Result<(), DiskError>;
}

/// A distributed tombstone-GC notification.
///
/// For partitioned-region buckets the reclaimed keys are included so
/// that clients, which see all buckets as one region, can drop their
/// matching tombstones by key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneGcMessage {
    pub region_path: String,
    pub keys: Vec<String>,
}

/// Sends tombstone-GC notifications to peers. Implementations are
/// invoked from a worker pool, never from the sweeper itself.
pub trait GcDistributor: Send + Sync {
    fn distribute_tombstone_gc(&self, message: TombstoneGcMessage);
}

/// A no-op distributor for local-only regions.
pub struct NoopDistributor;

impl GcDistributor for NoopDistributor {
    fn distribute_tombstone_gc(&self, _message: TombstoneGcMessage) {}
}

/// A region of the cache.
pub struct Region {
    id: RegionId,
    full_path: String,
    attributes: RegionAttributes,
    version_member: MemberId,
    rvv: RwLock<RegionVersionVector>,
    map: Arc<dyn RegionMap>,
    disk: Option<Arc<dyn DiskRvvStore>>,
    distributor: Arc<dyn GcDistributor>,
}

impl Region {
    pub fn builder(full_path: impl Into<String>, map: Arc<dyn RegionMap>) -> RegionBuilder {
        RegionBuilder::new(full_path, map)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    pub fn attributes(&self) -> &RegionAttributes {
        &self.attributes
    }

    /// The member id this region stamps its own versions with.
    pub fn version_member(&self) -> &MemberId {
        &self.version_member
    }

    /// The region's version vector.
    pub fn version_vector(&self) -> &RwLock<RegionVersionVector> {
        &self.rvv
    }

    pub fn has_server_proxy(&self) -> bool {
        self.attributes.server_proxy
    }

    pub fn is_partitioned_bucket(&self) -> bool {
        self.attributes.partitioned_bucket
    }

    /// Whether this region is serviced by replicated-region reclamation:
    /// distributed scope, no upstream server, and a replicating data
    /// policy. Regions without a data policy count as non-replicated.
    pub fn is_replicated_scope(&self) -> bool {
        self.attributes.scope.is_distributed()
            && !self.attributes.server_proxy
            && self
                .attributes
                .data_policy
                .map(|p| p.with_replication)
                .unwrap_or(false)
    }

    pub fn is_persistent(&self) -> bool {
        self.attributes
            .data_policy
            .map(|p| p.with_persistence)
            .unwrap_or(false)
    }

    /// Write the GC RVV to disk. No-op for regions without a disk store.
    pub fn persist_gc_rvv(&self) -> Result<(), DiskError> {
        if let Some(disk) = &self.disk {
            let rvv = self.rvv.read();
            disk.write_rvv_gc(&self.full_path, &rvv)?;
        }
        Ok(())
    }

    /// Remove a tombstone from the region map.
    pub fn remove_tombstone(
        &self,
        entry: &Arc<dyn RegionEntry>,
        tag: &VersionTag,
        cancelled: bool,
        destroy: bool,
    ) -> Result<bool, RegionMapError> {
        self.map.remove_tombstone(entry, tag, cancelled, destroy)
    }

    /// Resurrection check for a scheduled tombstone.
    pub fn is_tombstone_not_needed(&self, entry: &Arc<dyn RegionEntry>, entry_version: u64) -> bool {
        self.map.is_tombstone_not_needed(entry, entry_version)
    }

    /// Notify peers that this region reclaimed tombstones.
    pub fn distribute_tombstone_gc(&self, keys: &HashSet<String>) {
        let mut keys: Vec<String> = keys.iter().cloned().collect();
        keys.sort();
        self.distributor.distribute_tombstone_gc(TombstoneGcMessage {
            region_path: self.full_path.clone(),
            keys,
        });
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("full_path", &self.full_path)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// Builder for regions.
pub struct RegionBuilder {
    full_path: String,
    attributes: RegionAttributes,
    version_member: MemberId,
    map: Arc<dyn RegionMap>,
    disk: Option<Arc<dyn DiskRvvStore>>,
    distributor: Arc<dyn GcDistributor>,
}

impl RegionBuilder {
    pub fn new(full_path: impl Into<String>, map: Arc<dyn RegionMap>) -> Self {
        RegionBuilder {
            full_path: full_path.into(),
            attributes: RegionAttributes::default(),
            version_member: MemberId::generate(),
            map,
            disk: None,
            distributor: Arc::new(NoopDistributor),
        }
    }

    pub fn attributes(mut self, attributes: RegionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn version_member(mut self, member: MemberId) -> Self {
        self.version_member = member;
        self
    }

    pub fn disk_store(mut self, disk: Arc<dyn DiskRvvStore>) -> Self {
        self.disk = Some(disk);
        self
    }

    pub fn distributor(mut self, distributor: Arc<dyn GcDistributor>) -> Self {
        self.distributor = distributor;
        self
    }

    pub fn build(self) -> Arc<Region> {
        Arc::new(Region {
            id: RegionId::generate(),
            full_path: self.full_path,
            attributes: self.attributes,
            version_member: self.version_member,
            rvv: RwLock::new(RegionVersionVector::new()),
            map: self.map,
            disk: self.disk,
            distributor: self.distributor,
        })
    }
}
