//! Sextant CNI - configuration loading and the plugin façade
//!
//! This crate provides:
//! - Netconf + global-file configuration loading with shallow merge
//! - The ADD / DEL / CHECK command handlers
//! - File-sink logging setup for the plugin process

pub mod config;
pub mod facade;

// Re-export commonly used items
pub use config::{
    load_daemon_config, load_global_config, load_ipam_config, shallow_merge, GLOBAL_CONFIG_PATHS,
};
pub use facade::{
    build_add_reply, cmd_add, cmd_check, cmd_del, init_logging, parse_cni_args, pod_ref_from_args,
};
