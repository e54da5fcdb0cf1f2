//! The `sextant` CNI IPAM plugin binary.
//!
//! Invoked by the container runtime with the verb in `CNI_COMMAND`,
//! positional context in the other `CNI_*` variables, and the network
//! configuration on stdin. The reply (success or error) goes to stdout
//! as JSON; everything else is logged to the configured file.

use cni_plugin::error::CniError;
use cni_plugin::reply::{reply, IpamSuccessReply};
use cni_plugin::{Cni, Command};
use sextant_cni::{cmd_add, cmd_check, cmd_del};
use tracing::{debug, error};

fn main() {
    // kube's rustls path needs a process-level crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let Some(inputs) = Cni::load().into_inputs() else {
        // VERSION is answered by the loader itself.
        return;
    };
    let cni_version = inputs.config.cni_version.clone();
    debug!(
        "{} (CNI IPAM plugin) version {} serving spec v{} for command={:?}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        cni_version,
        inputs.command
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            reply(
                CniError::Generic(format!("failed to start async runtime: {}", err))
                    .into_reply(cni_version),
            );
        }
    };

    let result: Result<IpamSuccessReply, CniError> = runtime.block_on(async {
        match inputs.command {
            Command::Add => cmd_add(inputs).await,
            Command::Del => cmd_del(inputs).await,
            Command::Check => Err(cmd_check()),
            Command::Version => unreachable!(),
        }
    });

    match result {
        Ok(success) => {
            debug!("success: {:?}", success);
            reply(success)
        }
        Err(err) => {
            error!("error: {}", err);
            reply(err.into_reply(cni_version))
        }
    }
}
