//! Kubernetes backend: pools and overlap claims as custom resources.
//!
//! There is no local locking anywhere on this path. Concurrency across
//! nodes is handled entirely by optimistic writes: every pool update is
//! a JSON-patch whose first operation tests the `resourceVersion`
//! observed at read time, so of two racing writers exactly one lands
//! and the other gets a retryable rejection.

use crate::encoding::{decode_allocations, encode_allocations};
use crate::error::{classify_kube_error, Result, StoreError};
use crate::types::{DataStore, IpPool, IpamMode, OverlapClaim, OverlappingRangeStore};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::{json, Value};
use sextant_core::{normalize_pod_ref, IpReservation, IpamConfig};
use sextant_crds as crds;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Build a client honoring the config's kubeconfig path, falling back
/// to in-cluster config / `KUBECONFIG`.
pub async fn build_client(cfg: &IpamConfig) -> Result<Client> {
    match cfg.kubernetes.kubeconfig.as_deref() {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                StoreError::api_error(
                    "kubeconfig load",
                    format!("{}: {}", path, e),
                    Some(Box::new(e)),
                )
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    StoreError::api_error("kubeconfig load", e.to_string(), Some(Box::new(e)))
                })?;
            Client::try_from(config).map_err(|e| classify_kube_error("client build", e))
        }
        None => Client::try_default()
            .await
            .map_err(|e| classify_kube_error("client build", e)),
    }
}

/// Cluster-backed [`DataStore`].
pub struct KubeDataStore {
    client: Client,
    namespace: String,
    overlapping: Arc<KubeOverlappingStore>,
}

impl KubeDataStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let overlapping = Arc::new(KubeOverlappingStore {
            api: Api::namespaced(client.clone(), &namespace),
        });
        Self {
            client,
            namespace,
            overlapping,
        }
    }

    /// Build a store from the IPAM config: the configured kubeconfig
    /// path when present, otherwise in-cluster config / `KUBECONFIG`.
    pub async fn from_config(cfg: &IpamConfig) -> Result<Self> {
        let client = build_client(cfg).await?;
        Ok(Self::new(client, crds::storage_namespace()))
    }

    fn pools(&self) -> Api<crds::IPPool> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl DataStore for KubeDataStore {
    async fn get_ip_pool(&self, name: &str, range: IpNetwork) -> Result<Box<dyn IpPool>> {
        let api = self.pools();
        match api
            .get_opt(name)
            .await
            .map_err(|e| classify_kube_error("pool get", e))?
        {
            Some(resource) => Ok(Box::new(KubePool::from_resource(api, resource)?)),
            None => {
                let fresh = crds::IPPool::new(
                    name,
                    crds::IPPoolSpec {
                        range: range.to_string(),
                        allocations: BTreeMap::new(),
                    },
                );
                match api.create(&PostParams::default(), &fresh).await {
                    Ok(_) => {
                        debug!(pool = name, %range, "created empty pool");
                        // Re-read on the caller's next attempt so the
                        // pool carries a server-issued resourceVersion.
                        Err(StoreError::retry(format!("pool {} just created", name)))
                    }
                    Err(e) => Err(classify_kube_error("pool create", e)),
                }
            }
        }
    }

    async fn list_ip_pools(&self) -> Result<Vec<Box<dyn IpPool>>> {
        let api = self.pools();
        let resources = api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify_kube_error("pool list", e))?;
        let mut pools: Vec<Box<dyn IpPool>> = Vec::with_capacity(resources.items.len());
        for resource in resources {
            match KubePool::from_resource(api.clone(), resource) {
                Ok(pool) => pools.push(Box::new(pool)),
                Err(err) => warn!(%err, "skipping pool with unparseable range"),
            }
        }
        Ok(pools)
    }

    fn overlapping_store(&self) -> Arc<dyn OverlappingRangeStore> {
        Arc::clone(&self.overlapping) as Arc<dyn OverlappingRangeStore>
    }

    async fn status(&self) -> Result<()> {
        self.pools()
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| classify_kube_error("status probe", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One pool as read from the cluster, pinned to its `resourceVersion`.
pub struct KubePool {
    api: Api<crds::IPPool>,
    name: String,
    range: IpNetwork,
    resource_version: String,
    observed: BTreeMap<String, crds::PoolAllocation>,
}

impl KubePool {
    fn from_resource(api: Api<crds::IPPool>, resource: crds::IPPool) -> Result<Self> {
        let name = resource.metadata.name.clone().unwrap_or_default();
        let range: IpNetwork = resource
            .spec
            .range
            .parse()
            .map_err(|_| sextant_core::CoreError::invalid_cidr(&resource.spec.range))?;
        Ok(Self {
            api,
            name,
            range,
            resource_version: resource.metadata.resource_version.clone().unwrap_or_default(),
            observed: resource.spec.allocations,
        })
    }
}

#[async_trait]
impl IpPool for KubePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn range(&self) -> IpNetwork {
        self.range
    }

    fn allocations(&self) -> Vec<IpReservation> {
        decode_allocations(&self.name, self.range, &self.observed)
    }

    async fn update(&self, reservations: &[IpReservation]) -> Result<()> {
        let desired = encode_allocations(self.range, reservations)?;

        let mut ops = vec![json!({
            "op": "test",
            "path": "/metadata/resourceVersion",
            "value": self.resource_version,
        })];

        for (key, current) in &self.observed {
            // Entries with undecodable keys were skipped on read; leave
            // them untouched on the server rather than dropping them.
            if key.parse::<u64>().is_err() {
                continue;
            }
            if desired.get(key) != Some(current) {
                ops.push(json!({
                    "op": "test",
                    "path": format!("/spec/allocations/{}", key),
                    "value": current,
                }));
                ops.push(json!({
                    "op": "remove",
                    "path": format!("/spec/allocations/{}", key),
                }));
            }
        }

        for (key, next) in &desired {
            if self.observed.get(key) != Some(next) {
                ops.push(json!({
                    "op": "add",
                    "path": format!("/spec/allocations/{}", key),
                    "value": next,
                }));
            }
        }

        if ops.len() == 1 {
            // Nothing changed; skip the write entirely.
            return Ok(());
        }

        let patch: Patch<()> = Patch::Json(serde_json::from_value(Value::Array(ops))?);
        self.api
            .patch(&self.name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| classify_kube_error("pool update", e))?;
        Ok(())
    }
}

/// Cluster-backed [`OverlappingRangeStore`].
pub struct KubeOverlappingStore {
    api: Api<crds::OverlappingRangeIPReservation>,
}

fn claim_from_resource(resource: crds::OverlappingRangeIPReservation) -> Option<OverlapClaim> {
    let name = resource.metadata.name.clone().unwrap_or_default();
    let ip = crds::reservation_ip(&name)?;
    Some(OverlapClaim {
        name,
        ip,
        container_id: resource.spec.containerid,
        pod_ref: resource.spec.podref,
    })
}

#[async_trait]
impl OverlappingRangeStore for KubeOverlappingStore {
    async fn is_allocated(&self, ip: std::net::IpAddr) -> Result<Option<OverlapClaim>> {
        let name = crds::reservation_name(ip);
        let resource = self
            .api
            .get_opt(&name)
            .await
            .map_err(|e| classify_kube_error("overlap get", e))?;
        Ok(resource.and_then(claim_from_resource))
    }

    async fn update(
        &self,
        mode: IpamMode,
        ip: std::net::IpAddr,
        container_id: &str,
        pod_ref: &str,
    ) -> Result<()> {
        let name = crds::reservation_name(ip);
        match mode {
            IpamMode::Allocate => {
                let spec = crds::OverlappingRangeIPReservationSpec {
                    containerid: container_id.to_string(),
                    podref: Some(pod_ref.to_string()),
                };
                // A retried ADD from the same pod carries a fresh
                // sandbox id; its existing claim is replaced rather
                // than treated as a lost race.
                if let Some(mut existing) = self
                    .api
                    .get_opt(&name)
                    .await
                    .map_err(|e| classify_kube_error("overlap get", e))?
                {
                    let same_owner = existing.spec.podref.as_deref().map(normalize_pod_ref)
                        == Some(normalize_pod_ref(pod_ref));
                    if !same_owner {
                        return Err(StoreError::retry(format!(
                            "address {} already claimed",
                            name
                        )));
                    }
                    existing.spec = spec;
                    self.api
                        .replace(&name, &PostParams::default(), &existing)
                        .await
                        .map_err(|e| classify_kube_error("overlap replace", e))?;
                    return Ok(());
                }
                let claim = crds::OverlappingRangeIPReservation::new(&name, spec);
                self.api
                    .create(&PostParams::default(), &claim)
                    .await
                    .map_err(|e| classify_kube_error("overlap create", e))?;
                Ok(())
            }
            IpamMode::Deallocate => self.delete(&name).await,
        }
    }

    async fn list(&self) -> Result<Vec<OverlapClaim>> {
        let resources = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| classify_kube_error("overlap list", e))?;
        Ok(resources.into_iter().filter_map(claim_from_resource).collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(claim = name, "overlap claim already gone");
                Ok(())
            }
            Err(e) => Err(classify_kube_error("overlap delete", e)),
        }
    }
}
