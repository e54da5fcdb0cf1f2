//! OverlappingRangeIPReservation custom resource
//!
//! Cluster-wide address claims. When two pools have intersecting
//! CIDRs, the pool document alone cannot prevent the same address being
//! handed out twice; a per-IP object whose name is the normalized
//! address makes the second writer fail on create.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sextant.cni.cncf.io",
    version = "v1alpha1",
    kind = "OverlappingRangeIPReservation",
    namespaced
)]
pub struct OverlappingRangeIPReservationSpec {
    /// Sandbox id that created the claim.
    pub containerid: String,

    /// `<namespace>/<podName>` of the owning pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podref: Option<String>,
}

/// Object names cannot carry `:`, so IPv6 addresses are stored with
/// dashes. IPv4 addresses pass through unchanged.
pub fn reservation_name(ip: IpAddr) -> String {
    ip.to_string().replace(':', "-")
}

/// Recover the address from a reservation name.
pub fn reservation_ip(name: &str) -> Option<IpAddr> {
    name.parse()
        .ok()
        .or_else(|| name.replace('-', ":").parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_name() {
        assert_eq!(
            reservation_name("10.10.10.1".parse().unwrap()),
            "10.10.10.1"
        );
        assert_eq!(reservation_name("100::2:2".parse().unwrap()), "100--2-2");
    }

    #[test]
    fn test_reservation_name_round_trip() {
        for addr in ["10.10.10.1", "100::2:2", "fd00:1:2:3::10"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert_eq!(reservation_ip(&reservation_name(ip)), Some(ip));
        }
    }
}
