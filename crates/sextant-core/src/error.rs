use miette::Diagnostic;
use thiserror::Error;

/// Core error type for IP arithmetic, allocation, and configuration
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// CIDR failed to parse
    #[error("Invalid CIDR: '{cidr}'")]
    #[diagnostic(
        code(sextant::core::invalid_cidr),
        help("Use a network in CIDR notation like '192.168.2.0/24' or 'fd00:1::/64'")
    )]
    InvalidCidr {
        #[allow(unused)]
        cidr: String,
    },

    /// IP address failed to parse
    #[error("Invalid IP address: '{value}'")]
    #[diagnostic(
        code(sextant::core::invalid_ip),
        help("Use a plain IPv4 or IPv6 address like '192.168.2.10' or 'fd00:1::10'")
    )]
    InvalidIp {
        #[allow(unused)]
        value: String,
    },

    /// The subnet leaves fewer than two host addresses
    #[error("net mask is too short: {cidr}")]
    #[diagnostic(
        code(sextant::core::mask_too_short),
        help("IPv4 needs a /30 or wider, IPv6 a /126 or wider, to have usable addresses")
    )]
    MaskTooShort {
        #[allow(unused)]
        cidr: String,
    },

    /// Arithmetic across address families
    #[error("Addresses {a} and {b} are not in the same family")]
    #[diagnostic(
        code(sextant::core::mixed_families),
        help("Offset math is only defined between two IPv4 or two IPv6 addresses")
    )]
    MixedAddressFamilies {
        #[allow(unused)]
        a: String,
        #[allow(unused)]
        b: String,
    },

    /// Offset arithmetic left the address space
    #[error("Offset {offset} from {ip} overflows the address space")]
    #[diagnostic(
        code(sextant::core::offset_overflow),
        help("IPv4 offsets must stay below 2^32; check the stored allocation keys")
    )]
    OffsetOverflow {
        #[allow(unused)]
        ip: String,
        #[allow(unused)]
        offset: u64,
    },

    /// Every candidate address in the effective range was taken or excluded
    #[error("could not allocate IP in range: ip: {range_start} / - {range_end} / range: {cidr} / excluded: {excluded:?}")]
    #[diagnostic(
        code(sextant::core::range_exhausted),
        help("Widen the range, trim the exclusions, or reclaim stale reservations with the reconciler")
    )]
    RangeExhausted {
        #[allow(unused)]
        range_start: String,
        #[allow(unused)]
        range_end: String,
        #[allow(unused)]
        cidr: String,
        #[allow(unused)]
        excluded: Vec<String>,
    },

    /// Deallocation found nothing to remove
    #[error("did not find reserved IP for {matcher}")]
    #[diagnostic(
        code(sextant::core::reservation_not_found),
        help("The reservation may already have been released by a concurrent DEL or the reconciler")
    )]
    ReservationNotFound {
        #[allow(unused)]
        matcher: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(sextant::core::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid_cidr(cidr: impl Into<String>) -> Self {
        Self::InvalidCidr { cidr: cidr.into() }
    }

    pub fn invalid_ip(value: impl Into<String>) -> Self {
        Self::InvalidIp {
            value: value.into(),
        }
    }

    pub fn mask_too_short(cidr: impl std::fmt::Display) -> Self {
        Self::MaskTooShort {
            cidr: cidr.to_string(),
        }
    }

    pub fn mixed_address_families(
        a: impl std::fmt::Display,
        b: impl std::fmt::Display,
    ) -> Self {
        Self::MixedAddressFamilies {
            a: a.to_string(),
            b: b.to_string(),
        }
    }

    pub fn offset_overflow(ip: impl std::fmt::Display, offset: u64) -> Self {
        Self::OffsetOverflow {
            ip: ip.to_string(),
            offset,
        }
    }

    pub fn reservation_not_found(matcher: impl std::fmt::Display) -> Self {
        Self::ReservationNotFound {
            matcher: matcher.to_string(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}
