//! The allocate/deallocate transaction.
//!
//! Single entry point for CNI ADD and DEL. The pool is authoritative
//! and is written first; the overlap claim is the best-effort secondary
//! write. If the claim write fails after the pool committed, the
//! reservation is visible locally but not cluster-wide; a retried DEL
//! or the reconciler heals it (see DESIGN.md for the ordering
//! decision and its partial-failure test below).

use crate::error::{Result, StoreError};
use crate::types::{DataStore, IpamMode};
use sextant_core::{
    allocator, normalize_pod_ref, CoreError, IpReservation, IpamConfig, ReservationMatcher,
};
use sextant_crds as crds;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry budget for optimistic writes. Far more than contention ever
/// needs, bounded so a wedged apiserver cannot spin forever.
pub const DATASTORE_RETRIES: usize = 100;

/// Wall-clock budget for an ADD.
pub const ADD_TIMEOUT: Duration = Duration::from_secs(120);

/// Wall-clock budget for a DEL.
pub const DEL_TIMEOUT: Duration = Duration::from_secs(60);

/// Marker container id for in-loop shadow reservations. Never written:
/// shadow entries are filtered out before every pool update.
const OVERLAP_MARKER: &str = "cluster-wide reservation";

/// Coordinates the allocation engine with the two stores.
pub struct IpManagement {
    store: Arc<dyn DataStore>,
    config: IpamConfig,
}

impl IpManagement {
    pub fn new(store: Arc<dyn DataStore>, config: IpamConfig) -> Self {
        Self { store, config }
    }

    fn pool_identity(&self) -> Result<(String, ipnetwork::IpNetwork)> {
        let range = self.config.range_config()?;
        let name = crds::pool_name(
            &range.cidr.to_string(),
            self.config.network_name.as_deref(),
        );
        Ok((name, range.cidr))
    }

    /// CNI ADD: pick an address and commit it, within the ADD budget.
    pub async fn assign(
        &self,
        container_id: &str,
        pod_ref: &str,
        token: &CancellationToken,
    ) -> Result<IpAddr> {
        if token.is_cancelled() {
            return Err(StoreError::cancelled("assign"));
        }
        tokio::select! {
            _ = token.cancelled() => Err(StoreError::cancelled("assign")),
            outcome = tokio::time::timeout(ADD_TIMEOUT, self.assign_inner(container_id, pod_ref)) => {
                outcome.unwrap_or(Err(StoreError::deadline_exceeded("assign", ADD_TIMEOUT)))
            }
        }
    }

    /// CNI DEL or reconciler release, within the DEL budget.
    ///
    /// Returns `Ok(None)` when nothing matched: a concurrent delete is
    /// benign and the caller decides how loudly to log it.
    pub async fn release(
        &self,
        matcher: ReservationMatcher,
        token: &CancellationToken,
    ) -> Result<Option<IpAddr>> {
        if token.is_cancelled() {
            return Err(StoreError::cancelled("release"));
        }
        tokio::select! {
            _ = token.cancelled() => Err(StoreError::cancelled("release")),
            outcome = tokio::time::timeout(DEL_TIMEOUT, self.release_inner(matcher)) => {
                outcome.unwrap_or(Err(StoreError::deadline_exceeded("release", DEL_TIMEOUT)))
            }
        }
    }

    async fn assign_inner(&self, container_id: &str, pod_ref: &str) -> Result<IpAddr> {
        let range = self.config.range_config()?;
        let (pool_name, cidr) = self.pool_identity()?;
        let overlapping = self.config.enable_overlapping_ranges;
        let overlap_store = self.store.overlapping_store();

        // Addresses observed as claimed cluster-wide during this call.
        // They shadow the pool's reservation set so the walk moves past
        // them, and are filtered out before every write.
        let mut shadow: Vec<IpReservation> = Vec::new();

        for attempt in 1..=DATASTORE_RETRIES {
            let pool = match self.store.get_ip_pool(&pool_name, cidr).await {
                Ok(pool) => pool,
                Err(err) if err.is_retryable() => {
                    debug!(pool = %pool_name, attempt, %err, "re-reading pool");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut candidates = pool.allocations();
            candidates.extend(shadow.iter().cloned());

            let (ip, updated) =
                allocator::assign_ip(&range, &candidates, container_id, pod_ref)?;

            if overlapping {
                if let Some(claim) = overlap_store.is_allocated(ip).await? {
                    let foreign = match claim.pod_ref.as_deref() {
                        Some(owner) => normalize_pod_ref(owner) != normalize_pod_ref(pod_ref),
                        None => claim.container_id != container_id,
                    };
                    if foreign {
                        debug!(%ip, attempt, "address claimed by another pool; moving past it");
                        shadow.push(IpReservation::new(
                            ip,
                            OVERLAP_MARKER,
                            claim.pod_ref.unwrap_or_else(|| OVERLAP_MARKER.to_string()),
                        ));
                        continue;
                    }
                }
            }

            let to_write: Vec<IpReservation> = updated
                .into_iter()
                .filter(|r| r.container_id != OVERLAP_MARKER)
                .collect();

            match pool.update(&to_write).await {
                Ok(()) => {
                    if overlapping {
                        match overlap_store
                            .update(IpamMode::Allocate, ip, container_id, pod_ref)
                            .await
                        {
                            Ok(()) => {}
                            Err(err) if err.is_retryable() => {
                                // Lost the cross-pool race after our pool
                                // committed: roll the pool entry back and
                                // look for another address.
                                debug!(%ip, attempt, "lost overlap race; rolling back pool entry");
                                self.rollback_pool_entry(&pool_name, cidr, container_id)
                                    .await?;
                                shadow.push(IpReservation::new(
                                    ip,
                                    OVERLAP_MARKER,
                                    OVERLAP_MARKER.to_string(),
                                ));
                                continue;
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    return Ok(ip);
                }
                Err(err) if err.is_retryable() => {
                    debug!(pool = %pool_name, attempt, %err, "pool moved under us; retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::retries_exhausted("assign", DATASTORE_RETRIES))
    }

    /// Remove this call's own pool entry after a failed secondary
    /// write, retrying through version conflicts.
    async fn rollback_pool_entry(
        &self,
        pool_name: &str,
        cidr: ipnetwork::IpNetwork,
        container_id: &str,
    ) -> Result<()> {
        let matcher = ReservationMatcher::ContainerId(container_id.to_string());
        for _ in 1..=DATASTORE_RETRIES {
            let pool = match self.store.get_ip_pool(pool_name, cidr).await {
                Ok(pool) => pool,
                Err(err) if err.is_retryable() => continue,
                Err(err) => return Err(err),
            };
            let (remaining, _) = match allocator::deallocate_ip(&pool.allocations(), &matcher) {
                Ok(outcome) => outcome,
                Err(CoreError::ReservationNotFound { .. }) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            match pool.update(&remaining).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::retries_exhausted("rollback", DATASTORE_RETRIES))
    }

    async fn release_inner(&self, matcher: ReservationMatcher) -> Result<Option<IpAddr>> {
        let (pool_name, cidr) = self.pool_identity()?;
        let overlapping = self.config.enable_overlapping_ranges;

        for attempt in 1..=DATASTORE_RETRIES {
            let pool = match self.store.get_ip_pool(&pool_name, cidr).await {
                Ok(pool) => pool,
                Err(err) if err.is_retryable() => {
                    debug!(pool = %pool_name, attempt, %err, "re-reading pool");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let (remaining, removed) =
                match allocator::deallocate_ip(&pool.allocations(), &matcher) {
                    Ok(outcome) => outcome,
                    Err(CoreError::ReservationNotFound { .. }) => {
                        debug!(pool = %pool_name, %matcher, "nothing to release");
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                };

            match pool.update(&remaining).await {
                Ok(()) => {
                    if overlapping {
                        let container_id = match &matcher {
                            ReservationMatcher::ContainerId(id) => id.clone(),
                            ReservationMatcher::PodRef(_) => String::new(),
                        };
                        if let Err(err) = self
                            .store
                            .overlapping_store()
                            .update(IpamMode::Deallocate, removed, &container_id, "")
                            .await
                        {
                            // The pool no longer holds the address; a
                            // dangling claim is swept by the reconciler.
                            warn!(%removed, %err, "failed to drop overlap claim");
                        }
                    }
                    return Ok(Some(removed));
                }
                Err(err) if err.is_retryable() => {
                    debug!(pool = %pool_name, attempt, %err, "pool moved under us; retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(StoreError::retries_exhausted("release", DATASTORE_RETRIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalDataStore;
    use crate::types::{IpPool, OverlapClaim, OverlappingRangeStore};
    use async_trait::async_trait;
    use ipnetwork::IpNetwork;
    use tempfile::tempdir;

    fn config(range: &str) -> IpamConfig {
        IpamConfig {
            range: range.to_string(),
            ..Default::default()
        }
    }

    fn shared_store() -> (Arc<LocalDataStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalDataStore::open(dir.path().join("ipam.redb")).unwrap());
        (store, dir)
    }

    #[tokio::test]
    async fn test_assign_and_release_round_trip() {
        let (store, _dir) = shared_store();
        let mgmt = IpManagement::new(store.clone(), config("10.0.0.0/24"));
        let token = CancellationToken::new();

        let ip = mgmt.assign("ctr-1", "default/p1", &token).await.unwrap();
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());

        let released = mgmt
            .release(ReservationMatcher::ContainerId("ctr-1".into()), &token)
            .await
            .unwrap();
        assert_eq!(released, Some(ip));

        // Pool is back to empty; the claim is gone too.
        let pool = store
            .get_ip_pool("10.0.0.0-24", "10.0.0.0/24".parse().unwrap())
            .await
            .unwrap();
        assert!(pool.allocations().is_empty());
        assert!(store
            .overlapping_store()
            .is_allocated(ip)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_assign_is_idempotent_for_same_pod() {
        let (store, _dir) = shared_store();
        let mgmt = IpManagement::new(store, config("10.0.0.0/24"));
        let token = CancellationToken::new();

        let first = mgmt.assign("ctr-1", "default/p1", &token).await.unwrap();
        let second = mgmt.assign("ctr-1b", "default/p1", &token).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_assigns_get_distinct_addresses() {
        let (store, _dir) = shared_store();
        let mgmt = Arc::new(IpManagement::new(store, config("10.0.0.0/24")));
        let token = CancellationToken::new();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let mgmt = Arc::clone(&mgmt);
                let token = token.clone();
                tokio::spawn(async move {
                    mgmt.assign(&format!("ctr-{}", i), &format!("ns/p{}", i), &token)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut assigned = Vec::new();
        for task in tasks {
            assigned.push(task.await.unwrap());
        }
        let mut unique = assigned.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), assigned.len(), "no address may be handed out twice");
    }

    #[tokio::test]
    async fn test_overlapping_pools_never_share_an_address() {
        let (store, _dir) = shared_store();
        let token = CancellationToken::new();

        // Two distinct pools over the same range: the pool documents
        // cannot see each other, only the claim store keeps them apart.
        let mut blue_cfg = config("10.10.10.0/24");
        blue_cfg.network_name = Some("blue".to_string());
        let plain = IpManagement::new(store.clone(), config("10.10.10.0/24"));
        let blue = IpManagement::new(store.clone(), blue_cfg);

        let a = plain.assign("ctr-1", "default/p1", &token).await.unwrap();
        let b = blue.assign("ctr-2", "default/p2", &token).await.unwrap();

        assert_eq!(a, "10.10.10.1".parse::<IpAddr>().unwrap());
        // The second pool walks the same addresses but must skip the claim.
        assert_eq!(b, "10.10.10.2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_overlap_check_disabled_allows_duplicates() {
        let (store, _dir) = shared_store();
        let token = CancellationToken::new();

        let mut plain_cfg = config("10.10.10.0/24");
        plain_cfg.enable_overlapping_ranges = false;
        let mut blue_cfg = config("10.10.10.0/24");
        blue_cfg.network_name = Some("blue".to_string());
        blue_cfg.enable_overlapping_ranges = false;

        let plain = IpManagement::new(store.clone(), plain_cfg);
        let blue = IpManagement::new(store, blue_cfg);

        let a = plain.assign("ctr-1", "default/p1", &token).await.unwrap();
        let b = blue.assign("ctr-2", "default/p2", &token).await.unwrap();
        assert_eq!(a, b, "with the claim store off, pools act independently");
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal_not_retried() {
        let (store, _dir) = shared_store();
        let token = CancellationToken::new();

        let mut cfg = config("10.0.0.0/30");
        cfg.enable_overlapping_ranges = false;
        let mgmt = IpManagement::new(store, cfg);

        // /30 has exactly two usable addresses.
        mgmt.assign("c1", "ns/p1", &token).await.unwrap();
        mgmt.assign("c2", "ns/p2", &token).await.unwrap();
        let err = mgmt.assign("c3", "ns/p3", &token).await.unwrap_err();
        assert!(err.to_string().contains("could not allocate IP in range"));
    }

    #[tokio::test]
    async fn test_release_of_unknown_reservation_is_none() {
        let (store, _dir) = shared_store();
        let mgmt = IpManagement::new(store, config("10.0.0.0/24"));
        let token = CancellationToken::new();

        let released = mgmt
            .release(ReservationMatcher::ContainerId("ghost".into()), &token)
            .await
            .unwrap();
        assert_eq!(released, None);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_the_call() {
        let (store, _dir) = shared_store();
        let mgmt = IpManagement::new(store, config("10.0.0.0/24"));
        let token = CancellationToken::new();
        token.cancel();

        let err = mgmt.assign("ctr-1", "default/p1", &token).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
    }

    /// Overlap store that accepts reads but fails every claim write.
    struct BrokenOverlapStore;

    #[async_trait]
    impl OverlappingRangeStore for BrokenOverlapStore {
        async fn is_allocated(&self, _ip: IpAddr) -> crate::error::Result<Option<OverlapClaim>> {
            Ok(None)
        }

        async fn update(
            &self,
            _mode: IpamMode,
            _ip: IpAddr,
            _container_id: &str,
            _pod_ref: &str,
        ) -> crate::error::Result<()> {
            Err(StoreError::api_error("overlap create", "injected outage", None))
        }

        async fn list(&self) -> crate::error::Result<Vec<OverlapClaim>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _name: &str) -> crate::error::Result<()> {
            Err(StoreError::api_error("overlap delete", "injected outage", None))
        }
    }

    /// Pools from the local store, claims from [`BrokenOverlapStore`].
    struct PartialFailureStore {
        inner: Arc<LocalDataStore>,
        overlap: Arc<BrokenOverlapStore>,
    }

    #[async_trait]
    impl DataStore for PartialFailureStore {
        async fn get_ip_pool(
            &self,
            name: &str,
            range: IpNetwork,
        ) -> crate::error::Result<Box<dyn IpPool>> {
            self.inner.get_ip_pool(name, range).await
        }

        async fn list_ip_pools(&self) -> crate::error::Result<Vec<Box<dyn IpPool>>> {
            self.inner.list_ip_pools().await
        }

        fn overlapping_store(&self) -> Arc<dyn OverlappingRangeStore> {
            Arc::clone(&self.overlap) as Arc<dyn OverlappingRangeStore>
        }

        async fn status(&self) -> crate::error::Result<()> {
            self.inner.status().await
        }

        async fn close(&self) -> crate::error::Result<()> {
            self.inner.close().await
        }
    }

    /// Pins the documented write order: the pool commits before the
    /// overlap claim, so a failed claim write surfaces as an error
    /// while the pool entry remains, and a retried DEL cleans it up.
    #[tokio::test]
    async fn test_partial_failure_pool_written_before_overlap() {
        let dir = tempdir().unwrap();
        let inner = Arc::new(LocalDataStore::open(dir.path().join("ipam.redb")).unwrap());
        let store = Arc::new(PartialFailureStore {
            inner: Arc::clone(&inner),
            overlap: Arc::new(BrokenOverlapStore),
        });
        let mgmt = IpManagement::new(store, config("10.0.0.0/24"));
        let token = CancellationToken::new();

        let err = mgmt.assign("ctr-1", "default/p1", &token).await.unwrap_err();
        assert!(matches!(err, StoreError::ApiError { .. }));

        // Pool side committed: the reservation is visible locally.
        let pool = inner
            .get_ip_pool("10.0.0.0-24", "10.0.0.0/24".parse().unwrap())
            .await
            .unwrap();
        let allocations = pool.allocations();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].container_id, "ctr-1");

        // A retried DEL against the real store heals the pool.
        let heal = IpManagement::new(
            inner.clone() as Arc<dyn DataStore>,
            {
                let mut cfg = config("10.0.0.0/24");
                cfg.enable_overlapping_ranges = false;
                cfg
            },
        );
        let released = heal
            .release(ReservationMatcher::ContainerId("ctr-1".into()), &token)
            .await
            .unwrap();
        assert_eq!(released, Some("10.0.0.1".parse::<IpAddr>().unwrap()));
    }
}
