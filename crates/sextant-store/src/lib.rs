//! Sextant Store - coordinated persistence for IP reservations
//!
//! This crate provides:
//! - The storage capability traits (pools, overlap claims)
//! - The Kubernetes backend (custom resources, optimistic JSON-patch)
//! - The local redb backend (tests and clusterless runs)
//! - The allocate/deallocate coordinator

pub mod coordinator;
pub mod encoding;
pub mod error;
pub mod kubernetes;
pub mod local;
pub mod types;

// Re-export commonly used types
pub use coordinator::{IpManagement, ADD_TIMEOUT, DATASTORE_RETRIES, DEL_TIMEOUT};
pub use error::{classify_kube_error, Result, StoreError};
pub use kubernetes::{build_client, KubeDataStore, KubeOverlappingStore, KubePool};
pub use local::{LocalDataStore, LocalOverlappingStore, LocalPool};
pub use types::{DataStore, IpPool, IpamMode, OverlapClaim, OverlappingRangeStore};

use sextant_core::{DatastoreKind, IpamConfig};
use std::sync::Arc;

/// Open the backend selected by the configuration. The choice is made
/// once at startup; everything downstream sees only the trait objects.
pub async fn open_datastore(config: &IpamConfig) -> Result<Arc<dyn DataStore>> {
    match config.datastore {
        DatastoreKind::Kubernetes => {
            let store = KubeDataStore::from_config(config).await?;
            Ok(Arc::new(store))
        }
        DatastoreKind::Local => {
            let path = config
                .local_datastore_path
                .clone()
                .unwrap_or_else(|| "/var/lib/sextant/state.redb".to_string());
            let store = LocalDataStore::open(path)?;
            Ok(Arc::new(store))
        }
    }
}
