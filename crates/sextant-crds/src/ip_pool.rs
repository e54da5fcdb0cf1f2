//! IPPool custom resource
//!
//! One pool per allocation range, living in the sextant namespace and
//! named after the normalized range. Reservations are keyed by the
//! decimal offset from the range's configured address, so a pool can be
//! renamed or renumbered without rewriting every entry.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sextant.cni.cncf.io",
    version = "v1alpha1",
    kind = "IPPool",
    namespaced
)]
pub struct IPPoolSpec {
    /// The allocation range in CIDR form, exactly as configured
    /// (host bits in the address are preserved: offsets count from it).
    pub range: String,

    /// Reservations keyed by decimal offset from the range address.
    #[serde(default)]
    pub allocations: BTreeMap<String, PoolAllocation>,
}

/// One reserved address inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolAllocation {
    /// Sandbox id handed over by the runtime on CNI ADD.
    pub id: String,

    /// `<namespace>/<podName>` of the owning pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podref: Option<String>,
}

/// Derive the pool resource name from a range string: `:` and `/` are
/// not legal in object names and become `-`. An optional network name
/// prefixes the result so identical ranges on different networks get
/// distinct pools.
pub fn pool_name(range: &str, network_name: Option<&str>) -> String {
    let normalized = range.replace([':', '/'], "-");
    match network_name {
        Some(network) => format!("{}-{}", network, normalized),
        None => normalized,
    }
}
