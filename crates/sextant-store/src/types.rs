//! Storage capability traits.
//!
//! Two backend families implement this capability set: the Kubernetes
//! backend (pools and overlap claims as custom resources) and the local
//! backend (a redb database, used by tests and clusterless runs). The
//! family is chosen once at startup from the `datastore` config key.

use crate::error::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use sextant_core::IpReservation;
use std::net::IpAddr;
use std::sync::Arc;

/// Whether a coordinator transaction reserves or releases an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpamMode {
    Allocate,
    Deallocate,
}

/// A cluster-wide claim on one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapClaim {
    /// Normalized address the claim is named after.
    pub name: String,
    pub ip: IpAddr,
    pub container_id: String,
    pub pod_ref: Option<String>,
}

/// Top-level storage capability set.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch the pool for `range`, creating it empty on first use.
    ///
    /// A backend that cannot return a consistent version for a pool it
    /// just created reports [`crate::StoreError::Retry`] instead; the
    /// caller re-reads on its next loop iteration.
    async fn get_ip_pool(&self, name: &str, range: IpNetwork) -> Result<Box<dyn IpPool>>;

    /// All pools currently persisted (reconciler sweep input).
    async fn list_ip_pools(&self) -> Result<Vec<Box<dyn IpPool>>>;

    /// The cluster-wide overlap claim store.
    fn overlapping_store(&self) -> Arc<dyn OverlappingRangeStore>;

    /// Cheap readiness probe.
    async fn status(&self) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// One pool read at a point in time, with the write handle that
/// enforces the version observed at that read.
#[async_trait]
pub trait IpPool: Send + Sync {
    fn name(&self) -> &str;

    /// The configured range (offsets count from its literal address).
    fn range(&self) -> IpNetwork;

    /// Decoded reservations. Entries whose stored keys do not decode
    /// are skipped, not fatal.
    fn allocations(&self) -> Vec<IpReservation>;

    /// Replace the reservation set, failing with a retryable error if
    /// anything else wrote the pool since it was read.
    async fn update(&self, reservations: &[IpReservation]) -> Result<()>;
}

/// Cluster-wide uniqueness across pools with intersecting ranges.
#[async_trait]
pub trait OverlappingRangeStore: Send + Sync {
    /// Look up the claim for `ip`. Absent is `None`, not an error.
    async fn is_allocated(&self, ip: IpAddr) -> Result<Option<OverlapClaim>>;

    /// Create (Allocate) or delete (Deallocate) the claim for `ip`.
    /// Deallocating an absent claim is tolerated.
    async fn update(
        &self,
        mode: IpamMode,
        ip: IpAddr,
        container_id: &str,
        pod_ref: &str,
    ) -> Result<()>;

    /// All current claims (reconciler sweep input).
    async fn list(&self) -> Result<Vec<OverlapClaim>>;

    /// Remove a claim by its normalized name; absent is tolerated.
    async fn delete(&self, name: &str) -> Result<()>;
}
