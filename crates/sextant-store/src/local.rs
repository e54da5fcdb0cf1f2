//! Local backend: pools and overlap claims in a redb database.
//!
//! Serves tests and clusterless runs. Documents carry a monotonically
//! increasing version; updates re-read inside the write transaction and
//! compare against the version observed at read time, which gives this
//! backend the same compare-and-swap contract the Kubernetes backend
//! gets from `resourceVersion`.

use crate::encoding::{decode_allocations, encode_allocations};
use crate::error::{Result, StoreError};
use crate::types::{DataStore, IpPool, IpamMode, OverlapClaim, OverlappingRangeStore};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sextant_core::{normalize_pod_ref, IpReservation};
use sextant_crds as crds;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const POOLS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("pools");
const OVERLAPS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("overlaps");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolDocument {
    version: u64,
    range: String,
    allocations: BTreeMap<String, crds::PoolAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverlapDocument {
    containerid: String,
    podref: Option<String>,
}

/// File-backed [`DataStore`].
pub struct LocalDataStore {
    db: Arc<Database>,
    overlapping: Arc<LocalOverlappingStore>,
}

impl LocalDataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening local datastore at: {}", path.as_ref().display());
        let db = Database::create(path.as_ref())?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(POOLS_TABLE)?;
            let _ = write_txn.open_table(OVERLAPS_TABLE)?;
        }
        write_txn.commit()?;

        let db = Arc::new(db);
        let overlapping = Arc::new(LocalOverlappingStore {
            db: Arc::clone(&db),
        });
        Ok(Self { db, overlapping })
    }

    fn read_pool(&self, name: &str) -> Result<Option<PoolDocument>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(POOLS_TABLE)?;
        match table.get(name)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    fn pool_handle(&self, name: &str, doc: PoolDocument) -> Result<LocalPool> {
        let range: IpNetwork = doc
            .range
            .parse()
            .map_err(|_| sextant_core::CoreError::invalid_cidr(&doc.range))?;
        Ok(LocalPool {
            db: Arc::clone(&self.db),
            name: name.to_string(),
            range,
            version: doc.version,
            observed: doc.allocations,
        })
    }
}

#[async_trait]
impl DataStore for LocalDataStore {
    async fn get_ip_pool(&self, name: &str, range: IpNetwork) -> Result<Box<dyn IpPool>> {
        if let Some(doc) = self.read_pool(name)? {
            return Ok(Box::new(self.pool_handle(name, doc)?));
        }

        // First use: create the pool empty. Unlike the cluster backend
        // there is no version gap to re-read across, so the fresh
        // handle is returned directly.
        let doc = PoolDocument {
            version: 1,
            range: range.to_string(),
            allocations: BTreeMap::new(),
        };
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(POOLS_TABLE)?;
            if table.get(name)?.is_none() {
                table.insert(name, serde_json::to_string(&doc)?.as_str())?;
            }
        }
        write_txn.commit()?;
        debug!(pool = name, %range, "created empty pool");

        let doc = self
            .read_pool(name)?
            .ok_or_else(|| StoreError::pool_not_found(name))?;
        Ok(Box::new(self.pool_handle(name, doc)?))
    }

    async fn list_ip_pools(&self) -> Result<Vec<Box<dyn IpPool>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(POOLS_TABLE)?;
        let mut pools: Vec<Box<dyn IpPool>> = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let doc: PoolDocument = serde_json::from_str(value.value())?;
            pools.push(Box::new(self.pool_handle(key.value(), doc)?));
        }
        Ok(pools)
    }

    fn overlapping_store(&self) -> Arc<dyn OverlappingRangeStore> {
        Arc::clone(&self.overlapping) as Arc<dyn OverlappingRangeStore>
    }

    async fn status(&self) -> Result<()> {
        let _ = self.db.begin_read()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One pool as read from the database, pinned to its version.
pub struct LocalPool {
    db: Arc<Database>,
    name: String,
    range: IpNetwork,
    version: u64,
    observed: BTreeMap<String, crds::PoolAllocation>,
}

#[async_trait]
impl IpPool for LocalPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn range(&self) -> IpNetwork {
        self.range
    }

    fn allocations(&self) -> Vec<IpReservation> {
        decode_allocations(&self.name, self.range, &self.observed)
    }

    async fn update(&self, reservations: &[IpReservation]) -> Result<()> {
        let allocations = encode_allocations(self.range, reservations)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(POOLS_TABLE)?;
            let current: PoolDocument = match table.get(self.name.as_str())? {
                Some(value) => serde_json::from_str(value.value())?,
                None => return Err(StoreError::pool_not_found(&self.name)),
            };
            if current.version != self.version {
                return Err(StoreError::retry(format!(
                    "pool {} moved from version {} to {}",
                    self.name, self.version, current.version
                )));
            }
            let next = PoolDocument {
                version: current.version + 1,
                range: current.range,
                allocations,
            };
            table.insert(self.name.as_str(), serde_json::to_string(&next)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// File-backed [`OverlappingRangeStore`].
pub struct LocalOverlappingStore {
    db: Arc<Database>,
}

#[async_trait]
impl OverlappingRangeStore for LocalOverlappingStore {
    async fn is_allocated(&self, ip: std::net::IpAddr) -> Result<Option<OverlapClaim>> {
        let name = crds::reservation_name(ip);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OVERLAPS_TABLE)?;
        match table.get(name.as_str())? {
            Some(value) => {
                let doc: OverlapDocument = serde_json::from_str(value.value())?;
                Ok(Some(OverlapClaim {
                    name,
                    ip,
                    container_id: doc.containerid,
                    pod_ref: doc.podref,
                }))
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        mode: IpamMode,
        ip: std::net::IpAddr,
        container_id: &str,
        pod_ref: &str,
    ) -> Result<()> {
        let name = crds::reservation_name(ip);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OVERLAPS_TABLE)?;
            match mode {
                IpamMode::Allocate => {
                    if let Some(value) = table.get(name.as_str())? {
                        let doc: OverlapDocument = serde_json::from_str(value.value())?;
                        let same_owner = doc.podref.as_deref().map(normalize_pod_ref)
                            == Some(normalize_pod_ref(pod_ref));
                        if !same_owner {
                            // Second writer loses, same as a duplicate
                            // create against the apiserver. The same
                            // pod re-claiming (retried ADD with a new
                            // sandbox) falls through to the overwrite.
                            return Err(StoreError::retry(format!(
                                "address {} already claimed",
                                name
                            )));
                        }
                    }
                    let doc = OverlapDocument {
                        containerid: container_id.to_string(),
                        podref: Some(pod_ref.to_string()),
                    };
                    table.insert(name.as_str(), serde_json::to_string(&doc)?.as_str())?;
                }
                IpamMode::Deallocate => {
                    let _ = table.remove(name.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<OverlapClaim>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OVERLAPS_TABLE)?;
        let mut claims = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let name = key.value().to_string();
            let doc: OverlapDocument = serde_json::from_str(value.value())?;
            if let Some(ip) = crds::reservation_ip(&name) {
                claims.push(OverlapClaim {
                    name,
                    ip,
                    container_id: doc.containerid,
                    pod_ref: doc.podref,
                });
            }
        }
        Ok(claims)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OVERLAPS_TABLE)?;
            let _ = table.remove(name)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
