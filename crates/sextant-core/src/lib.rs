//! Sextant Core - IP arithmetic, allocation, and configuration
//!
//! This crate provides:
//! - Dual-family IP arithmetic on a 16-byte canonical form
//! - The first-fit allocation engine
//! - The IPAM configuration model
//! - Error types with miette diagnostics

pub mod allocator;
pub mod config;
pub mod error;
pub mod ip;
pub mod types;

// Re-export commonly used types
pub use allocator::{assign_ip, deallocate_ip};
pub use config::{
    DatastoreKind, DnsConfig, IpamConfig, RangeConfig, RouteConfig, StaticAddress, PLUGIN_TYPE,
};
pub use error::{CoreError, Result};
pub use types::{compose_pod_ref, normalize_pod_ref, IpReservation, ReservationMatcher};

// Re-export the CIDR type used across the workspace
pub use ipnetwork;
pub use ipnetwork::IpNetwork;
