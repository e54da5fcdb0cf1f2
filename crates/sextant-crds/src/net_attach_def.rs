//! NetworkAttachmentDefinition (k8s.cni.cncf.io/v1)
//!
//! External standard resource carrying a named CNI configuration. The
//! pod-deletion handler resolves a pod's secondary interface to its
//! attachment definition to recover the IPAM settings for cleanup.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    namespaced
)]
pub struct NetworkAttachmentDefinitionSpec {
    /// The embedded CNI conf or conflist JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}
