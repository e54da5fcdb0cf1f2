//! First-fit address assignment and release.

use crate::config::RangeConfig;
use crate::error::{CoreError, Result};
use crate::ip;
use crate::types::{IpReservation, ReservationMatcher};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

/// Pick the first free address in the range and return it together with
/// the updated reservation list.
///
/// The walk starts at the effective range start and steps one address
/// at a time. An address reserved by a different pod is stepped over;
/// an address already reserved by `pod_ref` is returned as-is, which
/// makes a retried ADD after a crashed sandbox setup idempotent.
/// Excluded subnets are jumped in one move to their broadcast address,
/// so the walk is linear in the usable range rather than in the holes.
pub fn assign_ip(
    range: &RangeConfig,
    reservations: &[IpReservation],
    container_id: &str,
    pod_ref: &str,
) -> Result<(IpAddr, Vec<IpReservation>)> {
    let (start, end) = ip::get_ip_range(&range.cidr, range.range_start, range.range_end)?;

    let reserved_by: HashMap<IpAddr, &IpReservation> =
        reservations.iter().map(|r| (r.ip, r)).collect();

    let mut candidate = start;
    loop {
        if ip::compare(candidate, end) == Ordering::Greater
            || !ip::contained_in(candidate, &range.cidr)
        {
            break;
        }

        if let Some(existing) = reserved_by.get(&candidate) {
            if crate::types::normalize_pod_ref(&existing.pod_ref)
                == crate::types::normalize_pod_ref(pod_ref)
            {
                debug!(ip = %candidate, pod_ref, "returning existing reservation");
                return Ok((candidate, reservations.to_vec()));
            }
            candidate = ip::inc(candidate);
            continue;
        }

        if let Some(excluded) = range
            .exclude
            .iter()
            .find(|subnet| ip::contained_in(candidate, subnet))
        {
            candidate = ip::inc(ip::broadcast_ip(excluded));
            continue;
        }

        debug!(ip = %candidate, pod_ref, "assigned");
        let mut updated = reservations.to_vec();
        updated.push(IpReservation::new(candidate, container_id, pod_ref));
        return Ok((candidate, updated));
    }

    Err(CoreError::RangeExhausted {
        range_start: start.to_string(),
        range_end: end.to_string(),
        cidr: range.cidr.to_string(),
        excluded: range.exclude.iter().map(|n| n.to_string()).collect(),
    })
}

/// Remove the reservation selected by `matcher` and return the updated
/// list plus the released address. Ordering in the list is not
/// semantic, so removal swaps with the last element.
pub fn deallocate_ip(
    reservations: &[IpReservation],
    matcher: &ReservationMatcher,
) -> Result<(Vec<IpReservation>, IpAddr)> {
    let position = reservations
        .iter()
        .position(|r| matcher.matches(r))
        .ok_or_else(|| CoreError::reservation_not_found(matcher))?;

    let mut updated = reservations.to_vec();
    let removed = updated.swap_remove(position);
    debug!(ip = %removed.ip, %matcher, "released");
    Ok((updated, removed.ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnetwork::IpNetwork;

    fn range(cidr: &str, exclude: &[&str]) -> RangeConfig {
        RangeConfig {
            cidr: cidr.parse().unwrap(),
            range_start: None,
            range_end: None,
            exclude: exclude
                .iter()
                .map(|e| e.parse::<IpNetwork>().unwrap())
                .collect(),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_fit_skips_unrelated_exclusion() {
        let rc = range("192.168.1.0/24", &["192.168.0.0/30"]);
        let (got, list) = assign_ip(&rc, &[], "ctr", "default/p").unwrap();
        assert_eq!(got, ip("192.168.1.1"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_exclusion_jumps_whole_subnet() {
        let rc = range("192.168.0.0/29", &["192.168.0.0/30"]);
        let (got, _) = assign_ip(&rc, &[], "ctr", "default/p").unwrap();
        assert_eq!(got, ip("192.168.0.4"));
    }

    #[test]
    fn test_exclusion_at_end_of_range() {
        let rc = range("192.168.0.0/29", &["192.168.0.4/30"]);
        let reservations = vec![
            IpReservation::new(ip("192.168.0.1"), "c1", "ns/p1"),
            IpReservation::new(ip("192.168.0.2"), "c2", "ns/p2"),
            IpReservation::new(ip("192.168.0.3"), "c3", "ns/p3"),
        ];
        let err = assign_ip(&rc, &reservations, "c4", "ns/p4").unwrap_err();
        assert!(err.to_string().contains("could not allocate IP in range"));
    }

    #[test]
    fn test_ipv6_excluded_first_usable() {
        let rc = range("100::2:1/125", &["100::2:1/128"]);
        let (got, _) = assign_ip(&rc, &[], "ctr", "default/p").unwrap();
        assert_eq!(got, ip("100::2:2"));
    }

    #[test]
    fn test_foreign_reservations_are_stepped_over() {
        let rc = range("192.168.0.0/29", &[]);
        let reservations = vec![
            IpReservation::new(ip("192.168.0.1"), "c1", "ns/p1"),
            IpReservation::new(ip("192.168.0.2"), "c2", "ns/p2"),
        ];
        let (got, list) = assign_ip(&rc, &reservations, "c3", "ns/p3").unwrap();
        assert_eq!(got, ip("192.168.0.3"));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_same_pod_reallocation_is_idempotent() {
        let rc = range("192.168.0.0/29", &[]);
        let reservations = vec![IpReservation::new(ip("192.168.0.1"), "c1", "ns/p1")];
        let (got, list) = assign_ip(&rc, &reservations, "c1-retry", "ns/p1").unwrap();
        assert_eq!(got, ip("192.168.0.1"));
        assert_eq!(list, reservations, "no duplicate entry may appear");
    }

    #[test]
    fn test_single_address_range_yields_once_then_fails() {
        let mut rc = range("192.168.1.0/24", &[]);
        rc.range_start = Some(ip("192.168.1.5"));
        rc.range_end = Some(ip("192.168.1.5"));

        let (got, list) = assign_ip(&rc, &[], "c1", "ns/p1").unwrap();
        assert_eq!(got, ip("192.168.1.5"));

        let err = assign_ip(&rc, &list, "c2", "ns/p2").unwrap_err();
        assert!(matches!(err, CoreError::RangeExhausted { .. }));
    }

    #[test]
    fn test_two_sequential_assignments_are_distinct() {
        let rc = range("10.0.0.0/24", &[]);
        let (first, list) = assign_ip(&rc, &[], "c1", "ns/p1").unwrap();
        let (second, _) = assign_ip(&rc, &list, "c2", "ns/p2").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_assignment_respects_user_bounds() {
        let mut rc = range("10.0.0.0/24", &[]);
        rc.range_start = Some(ip("10.0.0.100"));
        rc.range_end = Some(ip("10.0.0.101"));
        let (got, _) = assign_ip(&rc, &[], "c1", "ns/p1").unwrap();
        assert_eq!(got, ip("10.0.0.100"));
    }

    #[test]
    fn test_round_trip_restores_prior_state() {
        let rc = range("10.0.0.0/24", &[]);
        let before = vec![IpReservation::new(ip("10.0.0.9"), "c0", "ns/p0")];
        let (got, after_assign) = assign_ip(&rc, &before, "c1", "ns/p1").unwrap();
        let (after_release, removed) = deallocate_ip(
            &after_assign,
            &ReservationMatcher::ContainerId("c1".into()),
        )
        .unwrap();
        assert_eq!(removed, got);
        let mut sorted = after_release.clone();
        sorted.sort_by_key(|r| r.ip);
        assert_eq!(sorted, before);
    }

    #[test]
    fn test_deallocate_by_pod_ref() {
        let list = vec![
            IpReservation::new(ip("10.0.0.1"), "c1", "ns/p1"),
            IpReservation::new(ip("10.0.0.2"), "c2", "ns/p2"),
        ];
        let (rest, removed) =
            deallocate_ip(&list, &ReservationMatcher::PodRef("ns/p2".into())).unwrap();
        assert_eq!(removed, ip("10.0.0.2"));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].pod_ref, "ns/p1");
    }

    #[test]
    fn test_deallocate_missing_reservation() {
        let err = deallocate_ip(&[], &ReservationMatcher::ContainerId("nope".into()))
            .unwrap_err();
        assert!(err.to_string().contains("did not find reserved IP"));
    }
}
