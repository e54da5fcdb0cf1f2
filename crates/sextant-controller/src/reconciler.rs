//! Orphan sweep over pools and overlap claims.
//!
//! The fast path for cleanup is the pod-deletion watcher; this loop is
//! the safety net that catches anything the watcher missed (node
//! crashes, watcher downtime, taint-manager deletions). It must be
//! idempotent: a pass over an unchanged cluster performs zero writes.

use crate::error::Result;
use crate::pods::PodSource;
use sextant_core::{allocator, normalize_pod_ref, CoreError, ReservationMatcher};
use sextant_store::DataStore;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ReconcileLooper {
    store: Arc<dyn DataStore>,
    pods: Arc<dyn PodSource>,
}

impl ReconcileLooper {
    pub fn new(store: Arc<dyn DataStore>, pods: Arc<dyn PodSource>) -> Self {
        Self { store, pods }
    }

    /// One full pass: stale pool reservations first, then dangling
    /// overlap claims. Returns every address released from a pool.
    pub async fn reconcile(&self) -> Result<Vec<IpAddr>> {
        let pools = self.store.list_ip_pools().await?;
        let overlap = self.store.overlapping_store();
        let claims = overlap.list().await?;

        // Only pods that hold sextant reservations are interesting.
        let mut referenced: HashSet<String> = HashSet::new();
        for pool in &pools {
            for reservation in pool.allocations() {
                referenced.insert(normalize_pod_ref(&reservation.pod_ref).to_string());
            }
        }
        for claim in &claims {
            if let Some(pod_ref) = &claim.pod_ref {
                referenced.insert(normalize_pod_ref(pod_ref).to_string());
            }
        }

        // Live index: normalized pod ref -> addresses it actually holds.
        // Taint-manager-deleted pods and terminal phases are dead here
        // even though the pod object still exists.
        let live: HashMap<String, HashSet<IpAddr>> = self
            .pods
            .live_pods()
            .await?
            .into_iter()
            .filter(|pod| referenced.contains(normalize_pod_ref(&pod.pod_ref)))
            .filter(|pod| pod.holds_reservations())
            .map(|pod| (normalize_pod_ref(&pod.pod_ref).to_string(), pod.ips))
            .collect();

        let mut cleaned = Vec::new();

        for pool in &pools {
            let allocations = pool.allocations();
            let mut remaining = allocations.clone();
            let mut released: Vec<IpAddr> = Vec::new();

            // Pods that are gone entirely: release through the
            // by-pod-ref matcher until it finds nothing more.
            let dead_refs: HashSet<String> = allocations
                .iter()
                .map(|r| normalize_pod_ref(&r.pod_ref).to_string())
                .filter(|r| !live.contains_key(r))
                .collect();
            for dead in &dead_refs {
                loop {
                    match allocator::deallocate_ip(
                        &remaining,
                        &ReservationMatcher::PodRef(dead.clone()),
                    ) {
                        Ok((rest, ip)) => {
                            remaining = rest;
                            released.push(ip);
                        }
                        Err(CoreError::ReservationNotFound { .. }) => break,
                        Err(err) => return Err(err.into()),
                    }
                }
            }

            // Pods that are alive but no longer hold the address: the
            // allocation was rotated underneath the pool.
            remaining.retain(|r| {
                let keep = live
                    .get(normalize_pod_ref(&r.pod_ref))
                    .is_some_and(|ips| ips.contains(&r.ip));
                if !keep {
                    released.push(r.ip);
                }
                keep
            });

            if released.is_empty() {
                continue;
            }

            match pool.update(&remaining).await {
                Ok(()) => {
                    info!(
                        pool = pool.name(),
                        count = released.len(),
                        "released stale reservations"
                    );
                    cleaned.extend(released);
                }
                Err(err) => {
                    // Report and move on; the next pass retries.
                    warn!(pool = pool.name(), %err, "pool cleanup failed");
                }
            }
        }

        for claim in &claims {
            let Some(pod_ref) = &claim.pod_ref else {
                debug!(claim = %claim.name, "claim has no pod ref; leaving it alone");
                continue;
            };
            let orphaned = match live.get(normalize_pod_ref(pod_ref)) {
                None => true,
                Some(ips) => !ips.contains(&claim.ip),
            };
            if orphaned {
                if let Err(err) = overlap.delete(&claim.name).await {
                    warn!(claim = %claim.name, %err, "claim cleanup failed");
                } else {
                    debug!(claim = %claim.name, "deleted dangling claim");
                }
            }
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pods::LivePod;
    use async_trait::async_trait;
    use ipnetwork::IpNetwork;
    use sextant_core::IpReservation;
    use sextant_store::{IpamMode, LocalDataStore};
    use tempfile::tempdir;

    struct MockPodSource {
        pods: Vec<LivePod>,
    }

    #[async_trait]
    impl PodSource for MockPodSource {
        async fn live_pods(&self) -> Result<Vec<LivePod>> {
            Ok(self.pods.clone())
        }
    }

    fn live(pod_ref: &str, ips: &[&str]) -> LivePod {
        LivePod {
            pod_ref: pod_ref.to_string(),
            phase: "Running".to_string(),
            deleted_by_taint: false,
            ips: ips.iter().map(|s| s.parse().unwrap()).collect(),
        }
    }

    fn store() -> (Arc<LocalDataStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalDataStore::open(dir.path().join("r.redb")).unwrap());
        (store, dir)
    }

    async fn seed_pool(
        store: &Arc<LocalDataStore>,
        name: &str,
        range: &str,
        entries: &[(&str, &str, &str)],
    ) {
        let range: IpNetwork = range.parse().unwrap();
        let pool = store.get_ip_pool(name, range).await.unwrap();
        let reservations: Vec<IpReservation> = entries
            .iter()
            .map(|(ip, id, pod_ref)| IpReservation::new(ip.parse().unwrap(), *id, *pod_ref))
            .collect();
        pool.update(&reservations).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_pod_empties_the_pool() {
        let (store, _dir) = store();
        seed_pool(
            &store,
            "10.10.10.0-16",
            "10.10.10.0/16",
            &[("10.10.10.1", "c1", "default/p1")],
        )
        .await;

        let looper = ReconcileLooper::new(
            store.clone(),
            Arc::new(MockPodSource { pods: vec![] }),
        );
        let cleaned = looper.reconcile().await.unwrap();
        assert_eq!(cleaned, vec!["10.10.10.1".parse::<IpAddr>().unwrap()]);

        let pool = store
            .get_ip_pool("10.10.10.0-16", "10.10.10.0/16".parse().unwrap())
            .await
            .unwrap();
        assert!(pool.allocations().is_empty());
    }

    #[tokio::test]
    async fn test_live_pod_reservations_survive() {
        let (store, _dir) = store();
        seed_pool(
            &store,
            "10.0.0.0-24",
            "10.0.0.0/24",
            &[
                ("10.0.0.1", "c1", "default/alive"),
                ("10.0.0.2", "c2", "default/gone"),
            ],
        )
        .await;

        let looper = ReconcileLooper::new(
            store.clone(),
            Arc::new(MockPodSource {
                pods: vec![live("default/alive", &["10.0.0.1"])],
            }),
        );
        let cleaned = looper.reconcile().await.unwrap();
        assert_eq!(cleaned, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);

        let pool = store
            .get_ip_pool("10.0.0.0-24", "10.0.0.0/24".parse().unwrap())
            .await
            .unwrap();
        let allocations = pool.allocations();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].pod_ref, "default/alive");
    }

    #[tokio::test]
    async fn test_rotated_allocation_is_released() {
        let (store, _dir) = store();
        seed_pool(
            &store,
            "10.0.0.0-24",
            "10.0.0.0/24",
            &[("10.0.0.9", "c1", "default/p1")],
        )
        .await;

        // The pod is alive but its interface now carries a different
        // address; the stale reservation must go.
        let looper = ReconcileLooper::new(
            store.clone(),
            Arc::new(MockPodSource {
                pods: vec![live("default/p1", &["10.0.0.5"])],
            }),
        );
        let cleaned = looper.reconcile().await.unwrap();
        assert_eq!(cleaned, vec!["10.0.0.9".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_overlap_claims_follow_their_pods() {
        let (store, _dir) = store();
        // Two pools over intersecting ranges, three claims.
        seed_pool(
            &store,
            "10.10.10.0-16",
            "10.10.10.0/16",
            &[
                ("10.10.10.1", "c1", "default/p1"),
                ("10.10.10.3", "c3", "default/p3"),
            ],
        )
        .await;
        seed_pool(
            &store,
            "10.10.10.0-24",
            "10.10.10.0/24",
            &[("10.10.10.2", "c2", "default/p2")],
        )
        .await;
        let overlap = store.overlapping_store();
        for (ip, id, pod) in [
            ("10.10.10.1", "c1", "default/p1"),
            ("10.10.10.2", "c2", "default/p2"),
            ("10.10.10.3", "c3", "default/p3"),
        ] {
            overlap
                .update(IpamMode::Allocate, ip.parse().unwrap(), id, pod)
                .await
                .unwrap();
        }

        // p1 is gone; p2 and p3 are alive and hold their addresses.
        let looper = ReconcileLooper::new(
            store.clone(),
            Arc::new(MockPodSource {
                pods: vec![
                    live("default/p2", &["10.10.10.2"]),
                    live("default/p3", &["10.10.10.3"]),
                ],
            }),
        );
        let cleaned = looper.reconcile().await.unwrap();
        assert_eq!(cleaned, vec!["10.10.10.1".parse::<IpAddr>().unwrap()]);

        let remaining = overlap.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        let refs: HashSet<_> = remaining
            .iter()
            .filter_map(|c| c.pod_ref.clone())
            .collect();
        assert!(refs.contains("default/p2"));
        assert!(refs.contains("default/p3"));
    }

    #[tokio::test]
    async fn test_second_pass_performs_zero_writes() {
        let (store, _dir) = store();
        seed_pool(
            &store,
            "10.0.0.0-24",
            "10.0.0.0/24",
            &[
                ("10.0.0.1", "c1", "default/alive"),
                ("10.0.0.2", "c2", "default/gone"),
            ],
        )
        .await;

        let pods = Arc::new(MockPodSource {
            pods: vec![live("default/alive", &["10.0.0.1"])],
        });
        let looper = ReconcileLooper::new(store.clone(), pods);

        let first = looper.reconcile().await.unwrap();
        assert_eq!(first.len(), 1);

        let second = looper.reconcile().await.unwrap();
        assert!(second.is_empty(), "an unchanged cluster must not be written");
    }

    #[tokio::test]
    async fn test_taint_deleted_pod_is_treated_as_dead() {
        let (store, _dir) = store();
        seed_pool(
            &store,
            "10.0.0.0-24",
            "10.0.0.0/24",
            &[("10.0.0.1", "c1", "default/p1")],
        )
        .await;

        let mut pod = live("default/p1", &["10.0.0.1"]);
        pod.deleted_by_taint = true;
        let looper =
            ReconcileLooper::new(store.clone(), Arc::new(MockPodSource { pods: vec![pod] }));
        let cleaned = looper.reconcile().await.unwrap();
        assert_eq!(cleaned, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_legacy_pod_ref_suffix_still_matches() {
        let (store, _dir) = store();
        seed_pool(
            &store,
            "10.0.0.0-24",
            "10.0.0.0/24",
            &[("10.0.0.1", "c1", "default/p1:c1")],
        )
        .await;

        // The pod is alive under the modern ref form; its legacy-form
        // reservation must be recognized, not reclaimed.
        let looper = ReconcileLooper::new(
            store.clone(),
            Arc::new(MockPodSource {
                pods: vec![live("default/p1", &["10.0.0.1"])],
            }),
        );
        let cleaned = looper.reconcile().await.unwrap();
        assert!(cleaned.is_empty());
    }
}
