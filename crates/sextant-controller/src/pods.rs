//! Pod state as the reconciler and the deletion watcher consume it.
//!
//! The multus network-status annotation is the source of truth for
//! which addresses a pod actually holds on its secondary interfaces.

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::Deserialize;
use sextant_core::compose_pod_ref;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

/// Annotation carrying the per-interface status JSON.
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

/// One entry of the network-status annotation.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkStatus {
    /// `<namespace>/<netAttachDefName>` for secondary attachments.
    pub name: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub default: bool,
}

/// The attributes of a pod the IPAM control plane cares about.
#[derive(Debug, Clone)]
pub struct LivePod {
    pub pod_ref: String,
    pub phase: String,
    /// `DisruptionTarget == True` with reason `DeletionByTaintManager`.
    pub deleted_by_taint: bool,
    /// Addresses on secondary attachments, per network-status.
    pub ips: HashSet<IpAddr>,
}

impl LivePod {
    /// Whether reservations owned by this pod should be kept. Pods in
    /// terminal phases, and pods the taint manager is deleting, are
    /// dead for IPAM purposes even while the object still exists.
    pub fn holds_reservations(&self) -> bool {
        !self.deleted_by_taint && self.phase != "Failed" && self.phase != "Succeeded"
    }
}

/// Parse the network-status annotation; a missing or malformed
/// annotation is an empty list, never an error.
pub fn network_statuses(pod: &Pod) -> Vec<NetworkStatus> {
    let Some(raw) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(NETWORK_STATUS_ANNOTATION))
    else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(statuses) => statuses,
        Err(err) => {
            warn!(
                pod = %pod.metadata.name.as_deref().unwrap_or("<unknown>"),
                %err,
                "unparseable network-status annotation"
            );
            Vec::new()
        }
    }
}

/// Addresses held on secondary attachments. Only entries naming a
/// namespaced attachment (`name` contains `/`) count; the default
/// interface is the cluster network's business, not ours.
pub fn secondary_ips(statuses: &[NetworkStatus]) -> HashSet<IpAddr> {
    statuses
        .iter()
        .filter(|s| !s.default && s.name.contains('/'))
        .flat_map(|s| s.ips.iter())
        .filter_map(|raw| {
            // Some runtimes report `ip/prefix` rather than a bare address.
            let bare = raw.split('/').next().unwrap_or(raw);
            bare.parse().ok()
        })
        .collect()
}

pub fn live_pod_from(pod: &Pod) -> LivePod {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    let deleted_by_taint = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "DisruptionTarget"
                    && c.status == "True"
                    && c.reason.as_deref() == Some("DeletionByTaintManager")
            })
        });
    LivePod {
        pod_ref: compose_pod_ref(namespace, name),
        phase,
        deleted_by_taint,
        ips: secondary_ips(&network_statuses(pod)),
    }
}

/// Where the reconciler gets its view of live pods.
#[async_trait]
pub trait PodSource: Send + Sync {
    async fn live_pods(&self) -> Result<Vec<LivePod>>;
}

/// Lists pods across all namespaces through the API.
pub struct KubePodSource {
    client: Client,
}

impl KubePodSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodSource for KubePodSource {
    async fn live_pods(&self) -> Result<Vec<LivePod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ControllerError::api_error("pod list", e))?;
        Ok(pods.iter().map(live_pod_from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use std::collections::BTreeMap;

    fn pod_with_annotation(ns: &str, name: &str, status_json: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(ns.to_string());
        pod.metadata.name = Some(name.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(NETWORK_STATUS_ANNOTATION.to_string(), status_json.to_string());
        pod.metadata.annotations = Some(annotations);
        pod
    }

    #[test]
    fn test_secondary_ips_skip_default_interface() {
        let pod = pod_with_annotation(
            "default",
            "p1",
            r#"[
                {"name": "cluster", "interface": "eth0", "ips": ["10.128.0.5"], "default": true},
                {"name": "default/macvlan-net", "interface": "net1", "ips": ["10.40.0.3/16"]}
            ]"#,
        );
        let live = live_pod_from(&pod);
        assert_eq!(live.pod_ref, "default/p1");
        assert_eq!(live.ips.len(), 1);
        assert!(live.ips.contains(&"10.40.0.3".parse().unwrap()));
    }

    #[test]
    fn test_statuses_without_namespace_separator_are_ignored() {
        let pod = pod_with_annotation(
            "default",
            "p1",
            r#"[{"name": "not-namespaced", "ips": ["10.40.0.3"]}]"#,
        );
        assert!(live_pod_from(&pod).ips.is_empty());
    }

    #[test]
    fn test_malformed_annotation_is_empty_not_fatal() {
        let pod = pod_with_annotation("default", "p1", "{nonsense");
        assert!(live_pod_from(&pod).ips.is_empty());
    }

    #[test]
    fn test_taint_deleted_pod_drops_reservations() {
        let mut pod = pod_with_annotation("default", "p1", "[]");
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "DisruptionTarget".to_string(),
                status: "True".to_string(),
                reason: Some("DeletionByTaintManager".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let live = live_pod_from(&pod);
        assert!(live.deleted_by_taint);
        assert!(!live.holds_reservations());
    }

    #[test]
    fn test_terminal_phases_drop_reservations() {
        for phase in ["Failed", "Succeeded"] {
            let mut pod = pod_with_annotation("default", "p1", "[]");
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
            assert!(!live_pod_from(&pod).holds_reservations(), "{}", phase);
        }

        let mut pod = pod_with_annotation("default", "p1", "[]");
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert!(live_pod_from(&pod).holds_reservations());
    }
}
