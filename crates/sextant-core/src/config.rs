//! IPAM configuration model.
//!
//! This is the `ipam` section of the CNI network configuration, merged
//! by the loader in `sextant-cni` from stdin and the optional global
//! configuration file. Everything the allocator, stores, and reconciler
//! need flows through [`IpamConfig`].

use crate::error::{CoreError, Result};
use crate::ip;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// The CNI plugin type this IPAM registers as.
pub const PLUGIN_TYPE: &str = "sextant";

/// Which backing store family holds pools and overlap records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    #[default]
    Kubernetes,
    Local,
}

/// A route passed through to the CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// DNS settings passed through to the CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DnsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// A statically configured address included in every ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KubernetesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_cron_expression() -> String {
    "30 4 * * *".to_string()
}

fn default_lease_duration() -> u64 {
    15
}

fn default_renew_deadline() -> u64 {
    10
}

fn default_retry_period() -> u64 {
    2
}

/// The merged IPAM configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpamConfig {
    /// Plugin type; expected to be "sextant" when present.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub plugin_type: Option<String>,

    /// CIDR to allocate from. Also accepts `startIP-CIDR`, which pins
    /// the range start and leaves the end at the CIDR's last address.
    #[serde(default)]
    pub range: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<IpAddr>,

    /// CIDRs or bare IPs (treated as host networks) never to allocate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<StaticAddress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_cron_expression")]
    pub reconciler_cron_expression: String,

    #[serde(default = "default_true")]
    pub enable_overlapping_ranges: bool,

    /// Leader-election timings, in seconds.
    #[serde(default = "default_lease_duration")]
    pub leader_lease_duration: u64,
    #[serde(default = "default_renew_deadline")]
    pub leader_renew_deadline: u64,
    #[serde(default = "default_retry_period")]
    pub leader_retry_period: u64,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Extra global configuration file, preferred over the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_path: Option<String>,

    /// Prefixes the pool name, separating pools of identically-ranged
    /// networks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,

    #[serde(default)]
    pub datastore: DatastoreKind,

    /// Database path for [`DatastoreKind::Local`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_datastore_path: Option<String>,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            plugin_type: None,
            range: String::new(),
            range_start: None,
            range_end: None,
            exclude: Vec::new(),
            gateway: None,
            routes: Vec::new(),
            dns: None,
            addresses: Vec::new(),
            log_file: None,
            log_level: default_log_level(),
            reconciler_cron_expression: default_cron_expression(),
            enable_overlapping_ranges: true,
            leader_lease_duration: default_lease_duration(),
            leader_renew_deadline: default_renew_deadline(),
            leader_retry_period: default_retry_period(),
            kubernetes: KubernetesConfig::default(),
            configuration_path: None,
            network_name: None,
            datastore: DatastoreKind::default(),
            local_datastore_path: None,
        }
    }
}

/// A fully parsed allocation range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeConfig {
    pub cidr: IpNetwork,
    pub range_start: Option<IpAddr>,
    pub range_end: Option<IpAddr>,
    pub exclude: Vec<IpNetwork>,
}

/// Parse one exclusion entry; bare addresses become host networks.
pub fn parse_exclude_entry(entry: &str) -> Result<IpNetwork> {
    if entry.contains('/') {
        entry
            .parse::<IpNetwork>()
            .map_err(|_| CoreError::invalid_cidr(entry))
    } else {
        let addr: IpAddr = entry
            .parse()
            .map_err(|_| CoreError::invalid_ip(entry))?;
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpNetwork::new(addr, prefix).map_err(|_| CoreError::invalid_cidr(entry))
    }
}

impl IpamConfig {
    /// Resolve the configured range into a [`RangeConfig`].
    pub fn range_config(&self) -> Result<RangeConfig> {
        if self.range.is_empty() {
            return Err(CoreError::invalid_config(
                "no range configured",
                "Set 'range' in the ipam section, e.g. \"range\": \"192.168.2.0/24\"",
            ));
        }

        let (embedded_start, cidr_str) = match self.range.split_once('-') {
            Some((start, rest)) => match start.trim().parse::<IpAddr>() {
                Ok(addr) => (Some(addr), rest.trim()),
                Err(_) => (None, self.range.as_str()),
            },
            None => (None, self.range.as_str()),
        };

        let cidr: IpNetwork = cidr_str
            .parse()
            .map_err(|_| CoreError::invalid_cidr(cidr_str))?;

        // An explicit range_start key wins over the embedded form; the
        // embedded form pins the start and runs to the CIDR's last
        // address (which get_ip_range clamps to the last usable one).
        // The range's literal address is the offset base for persisted
        // allocations, so it also floors the start: nothing below it
        // is ever handed out.
        let base = cidr.ip();
        let range_start = match self.range_start.or(embedded_start) {
            Some(start) if ip::compare(start, base) == std::cmp::Ordering::Greater => {
                Some(start)
            }
            _ => Some(base),
        };
        let range_end = self.range_end.or(if embedded_start.is_some() {
            Some(ip::broadcast_ip(&cidr))
        } else {
            None
        });

        let exclude = self
            .exclude
            .iter()
            .map(|e| parse_exclude_entry(e))
            .collect::<Result<Vec<_>>>()?;

        Ok(RangeConfig {
            cidr,
            range_start,
            range_end,
            exclude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg: IpamConfig =
            serde_json::from_str(r#"{"type": "sextant", "range": "192.168.2.0/24"}"#).unwrap();
        assert!(cfg.enable_overlapping_ranges);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.reconciler_cron_expression, "30 4 * * *");
        assert_eq!(cfg.leader_lease_duration, 15);
        assert_eq!(cfg.leader_renew_deadline, 10);
        assert_eq!(cfg.leader_retry_period, 2);
        assert_eq!(cfg.datastore, DatastoreKind::Kubernetes);

        let rc = cfg.range_config().unwrap();
        assert_eq!(rc.cidr, "192.168.2.0/24".parse().unwrap());
        // The literal range address floors the start; for a clean
        // network address this sits below the usable interval and the
        // walk begins at the first usable address anyway.
        assert_eq!(rc.range_start, Some("192.168.2.0".parse().unwrap()));
        assert!(rc.exclude.is_empty());
    }

    #[test]
    fn test_host_bits_in_range_pin_the_start() {
        let cfg = IpamConfig {
            range: "192.168.1.44/28".to_string(),
            ..Default::default()
        };
        let rc = cfg.range_config().unwrap();
        assert_eq!(rc.range_start, Some("192.168.1.44".parse().unwrap()));
    }

    #[test]
    fn test_range_start_below_base_is_floored() {
        let cfg = IpamConfig {
            range: "10.10.10.0/16".to_string(),
            range_start: Some("10.10.0.5".parse().unwrap()),
            ..Default::default()
        };
        let rc = cfg.range_config().unwrap();
        assert_eq!(rc.range_start, Some("10.10.10.0".parse().unwrap()));
    }

    #[test]
    fn test_start_cidr_range_syntax() {
        let cfg = IpamConfig {
            range: "192.168.2.40-192.168.2.0/24".to_string(),
            ..Default::default()
        };
        let rc = cfg.range_config().unwrap();
        assert_eq!(rc.cidr, "192.168.2.0/24".parse().unwrap());
        assert_eq!(rc.range_start, Some("192.168.2.40".parse().unwrap()));
        assert_eq!(rc.range_end, Some("192.168.2.255".parse().unwrap()));
    }

    #[test]
    fn test_explicit_range_start_wins_over_embedded() {
        let cfg = IpamConfig {
            range: "192.168.2.40-192.168.2.0/24".to_string(),
            range_start: Some("192.168.2.50".parse().unwrap()),
            ..Default::default()
        };
        let rc = cfg.range_config().unwrap();
        assert_eq!(rc.range_start, Some("192.168.2.50".parse().unwrap()));
    }

    #[test]
    fn test_exclude_entries() {
        let cfg = IpamConfig {
            range: "100::2:0/125".to_string(),
            exclude: vec!["100::2:1".to_string(), "192.168.0.0/30".to_string()],
            ..Default::default()
        };
        let rc = cfg.range_config().unwrap();
        assert_eq!(rc.exclude[0], "100::2:1/128".parse().unwrap());
        assert_eq!(rc.exclude[1], "192.168.0.0/30".parse().unwrap());
    }

    #[test]
    fn test_invalid_exclude_is_config_error() {
        let cfg = IpamConfig {
            range: "10.0.0.0/24".to_string(),
            exclude: vec!["not-an-ip".to_string()],
            ..Default::default()
        };
        assert!(cfg.range_config().is_err());
    }

    #[test]
    fn test_missing_range_is_config_error() {
        let cfg = IpamConfig::default();
        let err = cfg.range_config().unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig { .. }));
    }

    #[test]
    fn test_full_config_round_trip() {
        let json = r#"{
            "type": "sextant",
            "range": "10.40.0.0/16",
            "range_start": "10.40.0.10",
            "exclude": ["10.40.0.0/28"],
            "gateway": "10.40.0.1",
            "routes": [{"dst": "0.0.0.0/0", "gw": "10.40.0.1"}],
            "dns": {"nameservers": ["10.0.0.53"], "search": ["cluster.local"]},
            "addresses": [{"address": "10.40.255.1/16"}],
            "log_file": "/var/log/sextant.log",
            "log_level": "info",
            "enable_overlapping_ranges": false,
            "network_name": "blue",
            "datastore": "local",
            "local_datastore_path": "/var/lib/sextant/state.redb"
        }"#;
        let cfg: IpamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.network_name.as_deref(), Some("blue"));
        assert_eq!(cfg.datastore, DatastoreKind::Local);
        assert!(!cfg.enable_overlapping_ranges);
        assert_eq!(cfg.routes[0].dst, "0.0.0.0/0");
        assert_eq!(cfg.dns.as_ref().unwrap().nameservers, vec!["10.0.0.53"]);
    }
}
