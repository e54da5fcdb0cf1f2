//! Lease-based leader election for the reconciler.
//!
//! At most one reconciler runs per cluster. The election state machine
//! is a task plus a cancellation token: winning the lease spawns the
//! job with a child token, losing the lease or shutting down cancels
//! it, and the loop then re-contends or exits.

use crate::error::{ControllerError, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::Client;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed name of the reconciler's leader lease.
pub const LEASE_NAME: &str = "sextant-reconciler-lock";

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub namespace: String,
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderConfig {
    pub fn new(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            lease_name: LEASE_NAME.to_string(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Identity precedence: `POD_NAME`, then the hostname, then
/// `<NODENAME>-<pid>`.
pub fn election_identity() -> String {
    election_identity_from(
        std::env::var("POD_NAME").ok(),
        sys_info::hostname().ok(),
        std::env::var("NODENAME").ok(),
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

pub fn election_identity_from(
    pod_name: Option<String>,
    hostname: Option<String>,
    node_name: Option<String>,
) -> String {
    if let Some(name) = non_empty(pod_name) {
        return name;
    }
    if let Some(host) = non_empty(hostname) {
        return host;
    }
    let node = non_empty(node_name).unwrap_or_else(|| "sextant".to_string());
    format!("{}-{}", node, std::process::id())
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderConfig,
}

impl LeaderElector {
    pub fn new(client: Client, config: LeaderConfig) -> Self {
        let api = Api::namespaced(client, &config.namespace);
        Self { api, config }
    }

    /// Contend for the lease until the token fires. Each time this
    /// process becomes leader, `on_lead` is spawned with a child token
    /// that is cancelled when leadership ends for any reason.
    pub async fn run<F, Fut>(&self, token: CancellationToken, on_lead: F) -> Result<()>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "acquired reconciler leadership");
                    let child = token.child_token();
                    let work = tokio::spawn(on_lead(child.clone()));
                    let deposed = self.lead_until_lost(&token).await;
                    child.cancel();
                    let _ = work.await;
                    if token.is_cancelled() {
                        self.release().await;
                        return Ok(());
                    }
                    if deposed {
                        info!(identity = %self.config.identity, "lost leadership; re-contending");
                    }
                }
                Ok(false) => {
                    debug!("lease held elsewhere; waiting");
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.retry_period) => {}
                    }
                }
                Err(err) => {
                    warn!(%err, "leader election attempt failed");
                    tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.retry_period) => {}
                    }
                }
            }
        }
    }

    fn fresh_spec(&self, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    fn lease_expired(&self, spec: &LeaseSpec) -> bool {
        let last = spec
            .renew_time
            .as_ref()
            .or(spec.acquire_time.as_ref())
            .map(|t| t.0);
        match last {
            Some(last) => {
                let ttl = chrono::Duration::from_std(self.config.lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::seconds(15));
                last + ttl < Utc::now()
            }
            None => true,
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        let existing = self
            .api
            .get_opt(&self.config.lease_name)
            .await
            .map_err(|e| ControllerError::api_error("lease get", e))?;

        match existing {
            None => {
                let mut lease = Lease::default();
                lease.metadata.name = Some(self.config.lease_name.clone());
                lease.spec = Some(self.fresh_spec(0));
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(e) => Err(ControllerError::api_error("lease create", e)),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();

                if holder == self.config.identity {
                    return self.write_renewal(lease).await;
                }
                if holder.is_empty() || self.lease_expired(&spec) {
                    let transitions = spec.lease_transitions.unwrap_or(0) + 1;
                    lease.spec = Some(self.fresh_spec(transitions));
                    return self.write_lease(lease, "lease takeover").await;
                }
                Ok(false)
            }
        }
    }

    /// Refresh `renewTime` on a lease we hold. `Ok(false)` means we no
    /// longer hold it.
    async fn renew(&self) -> Result<bool> {
        let Some(mut lease) = self
            .api
            .get_opt(&self.config.lease_name)
            .await
            .map_err(|e| ControllerError::api_error("lease get", e))?
        else {
            return Ok(false);
        };
        let mut spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return Ok(false);
        }
        spec.renew_time = Some(MicroTime(Utc::now()));
        lease.spec = Some(spec);
        self.write_lease(lease, "lease renew").await
    }

    async fn write_renewal(&self, mut lease: Lease) -> Result<bool> {
        let mut spec = lease.spec.clone().unwrap_or_default();
        spec.renew_time = Some(MicroTime(Utc::now()));
        lease.spec = Some(spec);
        self.write_lease(lease, "lease renew").await
    }

    /// Replace carries the read resourceVersion, so a racing writer
    /// turns into a conflict instead of a silent overwrite.
    async fn write_lease(&self, lease: Lease, operation: &str) -> Result<bool> {
        match self
            .api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
            Err(e) => Err(ControllerError::api_error(operation, e)),
        }
    }

    async fn lead_until_lost(&self, token: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {
                    match self.renew().await {
                        Ok(true) => last_renewal = Instant::now(),
                        Ok(false) => return true,
                        Err(err) => {
                            warn!(%err, "lease renewal failed");
                            if last_renewal.elapsed() >= self.config.renew_deadline {
                                return true;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Graceful handover: clear the holder so the next contender does
    /// not have to wait out the lease duration.
    async fn release(&self) {
        let Ok(Some(mut lease)) = self.api.get_opt(&self.config.lease_name).await else {
            return;
        };
        let mut spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }
        spec.holder_identity = Some(String::new());
        lease.spec = Some(spec);
        if let Err(err) = self
            .api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            warn!(%err, "failed to release lease on shutdown");
        }
    }
}
