//! Sextant CRDs - custom resource types persisted in the cluster
//!
//! This crate provides:
//! - The IPPool and OverlappingRangeIPReservation resources
//! - The external NetworkAttachmentDefinition resource
//! - Resource-name normalization helpers

pub mod ip_pool;
pub mod net_attach_def;
pub mod overlapping;

pub use ip_pool::{pool_name, IPPool, IPPoolSpec, PoolAllocation};
pub use net_attach_def::{NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec};
pub use overlapping::{
    reservation_ip, reservation_name, OverlappingRangeIPReservation,
    OverlappingRangeIPReservationSpec,
};

/// Environment variable selecting the namespace all sextant state lives
/// in.
pub const NAMESPACE_ENV: &str = "SEXTANT_NAMESPACE";

/// Fallback namespace when [`NAMESPACE_ENV`] is unset.
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Resolve the storage namespace.
pub fn storage_namespace() -> String {
    std::env::var(NAMESPACE_ENV).unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string())
}
