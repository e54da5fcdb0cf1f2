//! Sextant Controller - reconciliation and cluster watches
//!
//! This crate provides:
//! - The reconcile looper (orphaned reservation sweep)
//! - The pod-deletion watcher (fast-path cleanup)
//! - Lease-based leader election
//! - The cron schedule, its job runner, and the schedule-file watcher

pub mod config_watch;
pub mod cron;
pub mod error;
pub mod leader;
pub mod pod_watch;
pub mod pods;
pub mod reconciler;

// Re-export commonly used types
pub use config_watch::{
    configmap_update_predicate, read_schedule_expression, watch_schedule_file,
    DEFAULT_SCHEDULE_PATH,
};
pub use cron::{JobTask, Schedule, ScheduledJob};
pub use error::{ControllerError, Result};
pub use leader::{election_identity, LeaderConfig, LeaderElector, LEASE_NAME};
pub use pod_watch::{ipam_config_from_cni, PodWatcher, GC_EVENT_REASON};
pub use pods::{KubePodSource, LivePod, NetworkStatus, PodSource, NETWORK_STATUS_ANNOTATION};
pub use reconciler::ReconcileLooper;
