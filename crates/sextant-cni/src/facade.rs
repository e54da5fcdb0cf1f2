//! ADD / DEL / CHECK translation onto the coordinator.
//!
//! stdout belongs to the CNI result, so all diagnostics go to the
//! configured log file (or stderr before the config is parsed). DEL is
//! deliberately forgiving: a missing reservation is logged and treated
//! as success, because the sandbox may be torn down before plugin
//! state converges and the reconciler sweeps up whatever is left.

use crate::config::load_ipam_config;
use cni_plugin::error::CniError;
use cni_plugin::reply::{Dns, Ip, IpamSuccessReply, Route};
use cni_plugin::Inputs;
use ipnetwork::IpNetwork;
use sextant_core::{compose_pod_ref, IpamConfig, ReservationMatcher};
use sextant_store::{open_datastore, IpManagement};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Parse the `CNI_ARGS` environment variable (`K=V;K=V`).
pub fn parse_cni_args(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Compose the pod reference from `K8S_POD_NAMESPACE` / `K8S_POD_NAME`.
pub fn pod_ref_from_args(args: &HashMap<String, String>) -> Option<String> {
    let namespace = args.get("K8S_POD_NAMESPACE")?;
    let name = args.get("K8S_POD_NAME")?;
    Some(compose_pod_ref(namespace, name))
}

fn pod_ref_from_env() -> Result<String, CniError> {
    let raw = std::env::var("CNI_ARGS").unwrap_or_default();
    pod_ref_from_args(&parse_cni_args(&raw)).ok_or(CniError::MissingField(
        "CNI_ARGS: K8S_POD_NAMESPACE and K8S_POD_NAME",
    ))
}

/// Route diagnostics to the configured file sink; stdout must stay
/// clean for the result. Double initialization is ignored.
pub fn init_logging(config: &IpamConfig) {
    let filter = || {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("debug"))
    };
    if let Some(path) = &config.log_file {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .try_init();
            return;
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn generic(err: impl std::fmt::Display) -> CniError {
    CniError::Generic(err.to_string())
}

/// Assemble the ADD result: the freshly assigned address plus the
/// configured gateway, routes, DNS, and static addresses.
pub fn build_add_reply(
    cni_version: semver::Version,
    config: &IpamConfig,
    assigned: IpAddr,
) -> Result<IpamSuccessReply, CniError> {
    let range = config.range_config().map_err(generic)?;
    let address = IpNetwork::new(assigned, range.cidr.prefix())
        .map_err(|err| generic(format!("assigned address out of form: {}", err)))?;

    let mut ips = vec![Ip {
        address,
        gateway: config.gateway,
        interface: None,
    }];
    for entry in &config.addresses {
        let address: IpNetwork = entry
            .address
            .parse()
            .map_err(|_| generic(format!("invalid static address '{}'", entry.address)))?;
        ips.push(Ip {
            address,
            gateway: entry.gateway,
            interface: None,
        });
    }

    let mut routes = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        let dst: IpNetwork = route
            .dst
            .parse()
            .map_err(|_| generic(format!("invalid route destination '{}'", route.dst)))?;
        routes.push(Route {
            dst,
            gw: route.gw,
        });
    }

    let dns = match &config.dns {
        Some(dns) => {
            let nameservers = dns
                .nameservers
                .iter()
                .map(|ns| {
                    ns.parse::<IpAddr>()
                        .map_err(|_| generic(format!("invalid nameserver '{}'", ns)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Dns {
                nameservers,
                domain: dns.domain.clone(),
                search: dns.search.clone(),
                options: dns.options.clone(),
            }
        }
        None => Dns::default(),
    };

    Ok(IpamSuccessReply {
        cni_version,
        ips,
        routes,
        dns,
        specific: Default::default(),
    })
}

pub async fn cmd_add(inputs: Inputs) -> Result<IpamSuccessReply, CniError> {
    let config = load_ipam_config(&inputs.config).map_err(generic)?;
    init_logging(&config);
    let pod_ref = pod_ref_from_env()?;
    info!(
        container_id = %inputs.container_id,
        %pod_ref,
        range = %config.range,
        "ADD"
    );

    let store = open_datastore(&config).await.map_err(generic)?;
    let mgmt = IpManagement::new(store, config.clone());
    let token = CancellationToken::new();

    let assigned = mgmt
        .assign(&inputs.container_id, &pod_ref, &token)
        .await
        .map_err(generic)?;
    info!(ip = %assigned, %pod_ref, "assigned");

    build_add_reply(inputs.config.cni_version, &config, assigned)
}

pub async fn cmd_del(inputs: Inputs) -> Result<IpamSuccessReply, CniError> {
    let config = load_ipam_config(&inputs.config).map_err(generic)?;
    init_logging(&config);
    info!(container_id = %inputs.container_id, range = %config.range, "DEL");

    let store = open_datastore(&config).await.map_err(generic)?;
    let mgmt = IpManagement::new(store, config.clone());
    let token = CancellationToken::new();

    match mgmt
        .release(
            ReservationMatcher::ContainerId(inputs.container_id.clone()),
            &token,
        )
        .await
    {
        Ok(Some(ip)) => info!(%ip, "released"),
        Ok(None) => {
            debug!(
                container_id = %inputs.container_id,
                "no reservation found on DEL; treating as already released"
            );
        }
        Err(err) => {
            // Cleanup is best-effort: the reconciler picks up whatever
            // a failed DEL leaves behind.
            warn!(%err, "DEL could not release cleanly");
        }
    }

    Ok(IpamSuccessReply {
        cni_version: inputs.config.cni_version,
        ips: Vec::new(),
        routes: Vec::new(),
        dns: Dns::default(),
        specific: Default::default(),
    })
}

pub fn cmd_check() -> CniError {
    CniError::Generic("CHECK is not implemented".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cni_args() {
        let args = parse_cni_args(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-1;K8S_POD_INFRA_CONTAINER_ID=abc",
        );
        assert_eq!(args.get("K8S_POD_NAMESPACE").unwrap(), "default");
        assert_eq!(args.get("K8S_POD_NAME").unwrap(), "web-1");
        assert_eq!(
            pod_ref_from_args(&args).as_deref(),
            Some("default/web-1")
        );
    }

    #[test]
    fn test_pod_ref_requires_both_args() {
        let args = parse_cni_args("K8S_POD_NAMESPACE=default");
        assert!(pod_ref_from_args(&args).is_none());
        assert!(pod_ref_from_args(&parse_cni_args("")).is_none());
    }

    #[test]
    fn test_add_reply_carries_config_passthrough() {
        let config: IpamConfig = serde_json::from_str(
            r#"{
                "type": "sextant",
                "range": "10.40.0.0/16",
                "gateway": "10.40.0.1",
                "routes": [{"dst": "0.0.0.0/0", "gw": "10.40.0.1"}],
                "dns": {"nameservers": ["10.0.0.53"]},
                "addresses": [{"address": "10.40.255.1/16", "gateway": "10.40.0.1"}]
            }"#,
        )
        .unwrap();

        let reply = build_add_reply(
            semver::Version::parse("0.4.0").unwrap(),
            &config,
            "10.40.0.7".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(reply.ips.len(), 2);
        assert_eq!(reply.ips[0].address.to_string(), "10.40.0.7/16");
        assert_eq!(
            reply.ips[0].gateway,
            Some("10.40.0.1".parse::<IpAddr>().unwrap())
        );
        assert_eq!(reply.ips[1].address.to_string(), "10.40.255.1/16");
        assert_eq!(reply.routes.len(), 1);
        assert_eq!(reply.routes[0].dst.to_string(), "0.0.0.0/0");
        assert_eq!(
            reply.dns.nameservers,
            vec!["10.0.0.53".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_add_reply_rejects_bad_static_address() {
        let config: IpamConfig = serde_json::from_str(
            r#"{"type": "sextant", "range": "10.40.0.0/16", "addresses": [{"address": "junk"}]}"#,
        )
        .unwrap();
        assert!(build_add_reply(
            semver::Version::parse("0.4.0").unwrap(),
            &config,
            "10.40.0.7".parse().unwrap(),
        )
        .is_err());
    }
}
