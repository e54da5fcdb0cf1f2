use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A single address reservation inside a pool.
///
/// `pod_ref` is the stable `<namespace>/<podName>` identity used by the
/// reconciler; `container_id` identifies the sandbox instance and is
/// the deallocation key for CNI DEL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpReservation {
    pub ip: IpAddr,
    pub container_id: String,
    pub pod_ref: String,
}

impl IpReservation {
    pub fn new(ip: IpAddr, container_id: impl Into<String>, pod_ref: impl Into<String>) -> Self {
        Self {
            ip,
            container_id: container_id.into(),
            pod_ref: pod_ref.into(),
        }
    }
}

/// Which reservation field a deallocation matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationMatcher {
    /// CNI DEL: the runtime hands back the sandbox id it got on ADD.
    ContainerId(String),
    /// Reconciler: the owning pod is gone, release everything it held.
    PodRef(String),
}

impl ReservationMatcher {
    pub fn matches(&self, reservation: &IpReservation) -> bool {
        match self {
            Self::ContainerId(id) => reservation.container_id == *id,
            Self::PodRef(pod_ref) => {
                normalize_pod_ref(&reservation.pod_ref) == normalize_pod_ref(pod_ref)
            }
        }
    }
}

impl fmt::Display for ReservationMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerId(id) => write!(f, "container id '{}'", id),
            Self::PodRef(pod_ref) => write!(f, "pod '{}'", pod_ref),
        }
    }
}

/// Compose the `<namespace>/<podName>` identity.
pub fn compose_pod_ref(namespace: &str, pod_name: &str) -> String {
    format!("{}/{}", namespace, pod_name)
}

/// Normalize a stored pod reference for comparison.
///
/// Early releases suffixed pod references with the sandbox id
/// (`ns/name:containerid`); records written that way keep matching
/// without a migration pass.
pub fn normalize_pod_ref(pod_ref: &str) -> &str {
    match pod_ref.split_once(':') {
        Some((prefix, _)) => prefix,
        None => pod_ref,
    }
}
