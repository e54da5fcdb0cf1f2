//! Address arithmetic on a 16-byte canonical form.
//!
//! IPv4 addresses are mapped into the last four bytes of the canonical
//! form for comparison purposes; increment, decrement, and offset math
//! stay inside the address family, so `255.255.255.255` wraps to
//! `0.0.0.0` and the IPv6 all-ones address wraps to `::`. Every
//! operation is a total function returning [`CoreError`] on misuse;
//! none of them panic.

use crate::error::{CoreError, Result};
use ipnetwork::IpNetwork;
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Canonical 16-byte representation (IPv4-mapped for v4 addresses).
pub fn canonical(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Byte-wise unsigned comparison of the canonical forms.
pub fn compare(a: IpAddr, b: IpAddr) -> Ordering {
    canonical(a).cmp(&canonical(b))
}

/// Increment by one, wrapping at the family boundary.
pub fn inc(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(1))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(1))),
    }
}

/// Decrement by one, wrapping at the family boundary.
pub fn dec(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_sub(1))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_sub(1))),
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

/// Lowest address in the network.
pub fn network_ip(cidr: &IpNetwork) -> IpAddr {
    match cidr {
        IpNetwork::V4(n) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(n.ip()) & v4_mask(n.prefix())))
        }
        IpNetwork::V6(n) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(n.ip()) & v6_mask(n.prefix())))
        }
    }
}

/// Highest address in the network. IPv6 has no broadcast semantics but
/// the last address is still treated as unusable for symmetry.
pub fn broadcast_ip(cidr: &IpNetwork) -> IpAddr {
    match cidr {
        IpNetwork::V4(n) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(n.ip()) | !v4_mask(n.prefix())))
        }
        IpNetwork::V6(n) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(n.ip()) | !v6_mask(n.prefix())))
        }
    }
}

fn require_usable_hosts(cidr: &IpNetwork) -> Result<()> {
    let (prefix, bits) = match cidr {
        IpNetwork::V4(n) => (n.prefix(), 32),
        IpNetwork::V6(n) => (n.prefix(), 128),
    };
    // Fewer than two host bits leaves no usable addresses between the
    // network and the last address.
    if bits - prefix < 2 {
        return Err(CoreError::mask_too_short(cidr));
    }
    Ok(())
}

/// First usable address: network + 1.
pub fn first_usable(cidr: &IpNetwork) -> Result<IpAddr> {
    require_usable_hosts(cidr)?;
    Ok(inc(network_ip(cidr)))
}

/// Last usable address: broadcast − 1.
pub fn last_usable(cidr: &IpNetwork) -> Result<IpAddr> {
    require_usable_hosts(cidr)?;
    Ok(dec(broadcast_ip(cidr)))
}

/// Resolve the effective `(start, end)` interval for a range.
///
/// User-supplied bounds are honored only when they fall inside the
/// usable subset of the network; an out-of-bounds bound silently keeps
/// the usable default. When the surviving bounds invert, the start is
/// kept and only the end collapses back to the last usable address.
/// A single-address range (`start == end`) is legal.
pub fn get_ip_range(
    cidr: &IpNetwork,
    start: Option<IpAddr>,
    end: Option<IpAddr>,
) -> Result<(IpAddr, IpAddr)> {
    let first = first_usable(cidr)?;
    let last = last_usable(cidr)?;

    let in_usable = |ip: IpAddr| {
        compare(ip, first) != Ordering::Less && compare(ip, last) != Ordering::Greater
    };

    let effective_start = match start {
        Some(s) if in_usable(s) => s,
        _ => first,
    };
    let mut effective_end = match end {
        Some(e) if in_usable(e) => e,
        _ => last,
    };

    if compare(effective_start, effective_end) == Ordering::Greater {
        effective_end = last;
    }

    Ok((effective_start, effective_end))
}

/// Unsigned distance `|a − b|` as a 64-bit integer. Both addresses must
/// be in the same family, and the distance must fit in 64 bits.
pub fn ip_get_offset(a: IpAddr, b: IpAddr) -> Result<u64> {
    let distance: u128 = match (a, b) {
        (IpAddr::V4(x), IpAddr::V4(y)) => {
            u128::from(u32::from(x).abs_diff(u32::from(y)))
        }
        (IpAddr::V6(x), IpAddr::V6(y)) => u128::from(x).abs_diff(u128::from(y)),
        _ => return Err(CoreError::mixed_address_families(a, b)),
    };
    u64::try_from(distance).map_err(|_| CoreError::offset_overflow(a, u64::MAX))
}

/// `ip + n`. IPv4 fails when the sum leaves the 32-bit space.
pub fn ip_add_offset(ip: IpAddr, offset: u64) -> Result<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let sum = u64::from(u32::from(v4)) + offset;
            let v = u32::try_from(sum).map_err(|_| CoreError::offset_overflow(ip, offset))?;
            Ok(IpAddr::V4(Ipv4Addr::from(v)))
        }
        IpAddr::V6(v6) => {
            let v = u128::from(v6)
                .checked_add(u128::from(offset))
                .ok_or_else(|| CoreError::offset_overflow(ip, offset))?;
            Ok(IpAddr::V6(Ipv6Addr::from(v)))
        }
    }
}

/// Containment test in canonical space.
pub fn contained_in(ip: IpAddr, cidr: &IpNetwork) -> bool {
    match (ip, cidr) {
        (IpAddr::V4(v4), IpNetwork::V4(n)) => {
            u32::from(v4) & v4_mask(n.prefix()) == u32::from(n.ip()) & v4_mask(n.prefix())
        }
        (IpAddr::V6(v6), IpNetwork::V6(n)) => {
            u128::from(v6) & v6_mask(n.prefix()) == u128::from(n.ip()) & v6_mask(n.prefix())
        }
        _ => false,
    }
}

/// Enumerate the non-overlapping sub-networks of `cidr` with prefix
/// length `size`. Fails when `size` is shorter than the input prefix or
/// longer than the address family allows.
pub fn divide_range_by_size(cidr: &IpNetwork, size: u8) -> Result<Vec<IpNetwork>> {
    let (prefix, bits) = match cidr {
        IpNetwork::V4(n) => (n.prefix(), 32u8),
        IpNetwork::V6(n) => (n.prefix(), 128u8),
    };
    if size < prefix {
        return Err(CoreError::invalid_config(
            format!("cannot divide {} into /{} subnets", cidr, size),
            "The requested prefix must be at least as long as the network's own prefix",
        ));
    }
    if size > bits {
        return Err(CoreError::invalid_config(
            format!("/{} is not a valid prefix length for {}", size, cidr),
            "IPv4 prefixes go up to /32, IPv6 prefixes up to /128",
        ));
    }

    let count: u128 = 1u128 << u32::from(size - prefix);
    let mut subnets = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    let mut current = network_ip(cidr);
    for i in 0..count {
        let net = IpNetwork::new(current, size)
            .map_err(|_| CoreError::invalid_cidr(format!("{}/{}", current, size)))?;
        subnets.push(net);
        if i + 1 < count {
            current = inc(broadcast_ip(&net));
        }
    }
    Ok(subnets)
}
