//! IPAM configuration loading.
//!
//! The runtime hands us the network configuration on stdin; operators
//! may additionally mount a global configuration file with
//! cluster-wide settings (datastore, logging, reconciler schedule).
//! The two are shallow-merged key by key, stdin winning, and the
//! result deserializes into [`IpamConfig`].

use cni_plugin::config::NetworkConfig;
use sextant_core::{CoreError, IpamConfig, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Global configuration search path, tried in order after
/// `configuration_path`.
pub const GLOBAL_CONFIG_PATHS: [&str; 2] = [
    "/etc/kubernetes/cni/net.d/sextant.d/sextant.conf",
    "/etc/cni/net.d/sextant.d/sextant.conf",
];

fn as_object(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::invalid_config(
            format!("{} is not a JSON object: {}", what, other),
            "The IPAM configuration must be a JSON object",
        )),
    }
}

/// Shallow merge: every key present in `winner` replaces the same key
/// in `base` wholesale; nested objects are not merged further.
pub fn shallow_merge(base: Map<String, Value>, winner: Map<String, Value>) -> Map<String, Value> {
    let mut merged = base;
    for (key, value) in winner {
        merged.insert(key, value);
    }
    merged
}

/// Read the first readable global config file: the explicit override
/// first, then the fixed search path.
pub fn load_global_config(
    override_path: Option<&str>,
    search_paths: &[PathBuf],
) -> Result<Option<Map<String, Value>>> {
    let candidates = override_path
        .map(PathBuf::from)
        .into_iter()
        .chain(search_paths.iter().cloned());

    for candidate in candidates {
        match std::fs::read_to_string(&candidate) {
            Ok(contents) => {
                debug!(path = %candidate.display(), "loaded global IPAM configuration");
                let value: Value = serde_json::from_str(&contents).map_err(|err| {
                    CoreError::invalid_config(
                        format!("{}: {}", candidate.display(), err),
                        "The global configuration file must contain a JSON object",
                    )
                })?;
                return as_object(value, "global configuration").map(Some);
            }
            Err(_) => continue,
        }
    }
    Ok(None)
}

fn default_search_paths() -> Vec<PathBuf> {
    GLOBAL_CONFIG_PATHS.iter().map(PathBuf::from).collect()
}

/// Resolve the effective IPAM configuration from the stdin netconf.
pub fn load_ipam_config(net: &NetworkConfig) -> Result<IpamConfig> {
    let netconf = serde_json::to_value(net).map_err(|err| {
        CoreError::invalid_config(
            format!("cannot re-serialize network config: {}", err),
            "This is a bug in the plugin shell",
        )
    })?;
    let stdin_ipam = netconf
        .get("ipam")
        .cloned()
        .ok_or_else(|| CoreError::invalid_config(
            "network config has no ipam section",
            "Add an \"ipam\" object with \"type\": \"sextant\" to the network config",
        ))?;
    load_ipam_config_from_value(stdin_ipam, &default_search_paths())
}

/// Testable core of [`load_ipam_config`].
pub fn load_ipam_config_from_value(
    stdin_ipam: Value,
    search_paths: &[PathBuf],
) -> Result<IpamConfig> {
    let stdin_map = as_object(stdin_ipam, "ipam section")?;

    let override_path = stdin_map
        .get("configuration_path")
        .and_then(Value::as_str)
        .map(str::to_string);
    let global = load_global_config(override_path.as_deref(), search_paths)?;

    let merged = match global {
        Some(base) => shallow_merge(base, stdin_map),
        None => stdin_map,
    };

    serde_json::from_value(Value::Object(merged)).map_err(|err| {
        CoreError::invalid_config(
            format!("invalid ipam configuration: {}", err),
            "Check the ipam section against the documented keys",
        )
    })
}

/// Load the daemon's configuration without a stdin netconf: the global
/// file alone, with an optional explicit path.
pub fn load_daemon_config(config_path: Option<&Path>) -> Result<IpamConfig> {
    let override_path = config_path.map(|p| p.to_string_lossy().into_owned());
    let global = load_global_config(override_path.as_deref(), &default_search_paths())?;
    match global {
        Some(map) => serde_json::from_value(Value::Object(map)).map_err(|err| {
            CoreError::invalid_config(
                format!("invalid configuration file: {}", err),
                "Check the file against the documented keys",
            )
        }),
        None => Ok(IpamConfig::default()),
    }
}
