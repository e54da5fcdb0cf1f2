//! Offset-keyed wire encoding for pool reservations.
//!
//! Pools persist reservations under decimal offsets from the range's
//! configured address rather than under IP strings, so renaming or
//! renumbering a pool never needs a second pass over its entries.

use crate::error::Result;
use ipnetwork::IpNetwork;
use sextant_core::{ip, IpReservation};
use sextant_crds::PoolAllocation;
use std::collections::BTreeMap;
use tracing::warn;

/// Decode an offset-keyed allocation map into reservations.
///
/// Keys that do not parse, or that decode to an address outside the
/// family's space, are logged and skipped: one corrupt entry must not
/// take the whole pool offline.
pub fn decode_allocations(
    pool_name: &str,
    range: IpNetwork,
    allocations: &BTreeMap<String, PoolAllocation>,
) -> Vec<IpReservation> {
    let base = range.ip();
    let mut reservations = Vec::with_capacity(allocations.len());
    for (key, allocation) in allocations {
        let offset: u64 = match key.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!(pool = pool_name, key = %key, "skipping undecodable allocation key");
                continue;
            }
        };
        let ip = match ip::ip_add_offset(base, offset) {
            Ok(ip) => ip,
            Err(err) => {
                warn!(pool = pool_name, key = %key, %err, "skipping out-of-space allocation key");
                continue;
            }
        };
        reservations.push(IpReservation {
            ip,
            container_id: allocation.id.clone(),
            pod_ref: allocation.podref.clone().unwrap_or_default(),
        });
    }
    reservations
}

/// Encode reservations back into the offset-keyed wire form.
pub fn encode_allocations(
    range: IpNetwork,
    reservations: &[IpReservation],
) -> Result<BTreeMap<String, PoolAllocation>> {
    let base = range.ip();
    let mut allocations = BTreeMap::new();
    for reservation in reservations {
        let offset = ip::ip_get_offset(reservation.ip, base)?;
        allocations.insert(
            offset.to_string(),
            PoolAllocation {
                id: reservation.container_id.clone(),
                podref: if reservation.pod_ref.is_empty() {
                    None
                } else {
                    Some(reservation.pod_ref.clone())
                },
            },
        );
    }
    Ok(allocations)
}
