//! Fast-path cleanup on pod deletion.
//!
//! An informer-style watch over all pods. Delete events carry the
//! pod's final state (the watcher machinery resolves resync tombstones
//! to the last-known object before they reach us); from it we read the
//! network-status annotation, resolve each secondary attachment to its
//! NetworkAttachmentDefinition through a reflector cache, and release
//! that pod's reservations through the coordinator.

use crate::error::{ControllerError, Result};
use crate::pods::{network_statuses, NETWORK_STATUS_ANNOTATION};
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::events::{Event as ClusterEvent, EventType, Recorder, Reporter};
use kube::runtime::reflector::{ObjectRef, Store as NadCache};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Client;
use serde_json::Value;
use sextant_core::{
    compose_pod_ref, normalize_pod_ref, IpamConfig, ReservationMatcher, PLUGIN_TYPE,
};
use sextant_crds::{self as crds, NetworkAttachmentDefinition};
use sextant_store::{DataStore, IpManagement, KubeDataStore};
use std::net::IpAddr;
use std::pin::pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event reason attached to released addresses.
pub const GC_EVENT_REASON: &str = "IPAddressGarbageCollected";

/// Extract the sextant IPAM section from a NAD's embedded CNI config.
/// Handles both single-plugin conf and conflist documents. A config
/// whose IPAM is a different plugin type is `Ok(None)`.
pub fn ipam_config_from_cni(config: &str) -> Result<Option<IpamConfig>> {
    let document: Value = serde_json::from_str(config).map_err(|err| {
        ControllerError::IoError {
            message: format!("unparseable CNI config: {}", err),
            source: Some(Box::new(err)),
        }
    })?;

    let ipam = match document.get("plugins").and_then(Value::as_array) {
        Some(plugins) => plugins.iter().find_map(|p| p.get("ipam")).cloned(),
        None => document.get("ipam").cloned(),
    };

    let Some(ipam) = ipam.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    if ipam.get("type").and_then(Value::as_str) != Some(PLUGIN_TYPE) {
        return Ok(None);
    }
    let config: IpamConfig = serde_json::from_value(ipam).map_err(|err| {
        ControllerError::IoError {
            message: format!("invalid ipam section: {}", err),
            source: Some(Box::new(err)),
        }
    })?;
    Ok(Some(config))
}

pub struct PodWatcher {
    client: Client,
    namespace: String,
    nad_cache: NadCache<NetworkAttachmentDefinition>,
    recorder: Recorder,
}

impl PodWatcher {
    /// Set up the watcher and its NAD reflector. The reflector stream
    /// is spawned immediately and lives as long as `token`.
    pub fn new(client: Client, token: &CancellationToken) -> Self {
        let (reader, writer) = reflector::store::<NetworkAttachmentDefinition>();
        let nads: Api<NetworkAttachmentDefinition> = Api::all(client.clone());
        let cache_token = token.clone();
        let mut cache_stream = watcher(nads, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects()
            .boxed();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cache_token.cancelled() => break,
                    next = cache_stream.try_next() => match next {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(err) => warn!(%err, "attachment cache watch error"),
                    }
                }
            }
        });

        let reporter = Reporter {
            controller: "sextant".into(),
            instance: None,
        };
        let recorder = Recorder::new(client.clone(), reporter);

        Self {
            client,
            namespace: crds::storage_namespace(),
            nad_cache: reader,
            recorder,
        }
    }

    /// Watch pod deletions until the token fires.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let mut stream = pin!(watcher(pods, watcher::Config::default()).default_backoff());
        info!("watching pod deletions");

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = stream.try_next() => match next {
                    Ok(Some(watcher::Event::Delete(pod))) => {
                        self.handle_deleted_pod(&pod, &token).await;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        info!("pod watch stream ended");
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(%err, "pod watch error");
                    }
                }
            }
        }
    }

    async fn handle_deleted_pod(&self, pod: &Pod, token: &CancellationToken) {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let pod_ref = compose_pod_ref(namespace, name);

        let statuses = network_statuses(pod);
        if statuses.is_empty() {
            debug!(pod = %pod_ref, "deleted pod carries no {}", NETWORK_STATUS_ANNOTATION);
            return;
        }

        let mut released: Vec<IpAddr> = Vec::new();
        for status in statuses.iter().filter(|s| !s.default) {
            let Some((nad_namespace, nad_name)) = status.name.split_once('/') else {
                continue;
            };
            let key = ObjectRef::new(nad_name).within(nad_namespace);
            let Some(nad) = self.nad_cache.get(&key) else {
                warn!(pod = %pod_ref, attachment = %status.name, "attachment not in cache");
                continue;
            };
            let Some(raw_config) = nad.spec.config.as_deref() else {
                continue;
            };
            let ipam = match ipam_config_from_cni(raw_config) {
                Ok(Some(ipam)) => ipam,
                Ok(None) => continue,
                Err(err) => {
                    warn!(attachment = %status.name, %err, "skipping attachment");
                    continue;
                }
            };
            match self.release_pod_addresses(&ipam, &pod_ref, token).await {
                Ok(ips) => released.extend(ips),
                Err(err) => {
                    warn!(pod = %pod_ref, attachment = %status.name, %err, "cleanup failed");
                }
            }
        }

        if !released.is_empty() {
            info!(pod = %pod_ref, ips = ?released, "garbage-collected addresses");
            self.publish_gc_event(pod, &released).await;
        }
    }

    async fn release_pod_addresses(
        &self,
        ipam: &IpamConfig,
        pod_ref: &str,
        token: &CancellationToken,
    ) -> Result<Vec<IpAddr>> {
        let range = ipam.range_config()?;
        let pool_name = crds::pool_name(&range.cidr.to_string(), ipam.network_name.as_deref());

        let store: Arc<dyn DataStore> = Arc::new(KubeDataStore::new(
            self.client.clone(),
            self.namespace.clone(),
        ));
        let pool = store.get_ip_pool(&pool_name, range.cidr).await?;
        let owned: Vec<String> = pool
            .allocations()
            .into_iter()
            .filter(|r| normalize_pod_ref(&r.pod_ref) == normalize_pod_ref(pod_ref))
            .map(|r| r.container_id)
            .collect();

        let mgmt = IpManagement::new(store, ipam.clone());
        let mut released = Vec::new();
        for container_id in owned {
            match mgmt
                .release(ReservationMatcher::ContainerId(container_id), token)
                .await?
            {
                Some(ip) => released.push(ip),
                None => {}
            }
        }
        Ok(released)
    }

    async fn publish_gc_event(&self, pod: &Pod, released: &[IpAddr]) {
        let note = released
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let event = ClusterEvent {
            type_: EventType::Normal,
            reason: GC_EVENT_REASON.into(),
            note: Some(format!("released {}", note)),
            action: "Deallocate".into(),
            secondary: None,
        };
        let reference = ObjectRef::from_obj(pod).into();
        if let Err(err) = self.recorder.publish(&event, &reference).await {
            warn!(%err, "failed to publish garbage-collection event");
        }
    }
}
