//! The `sextantd` reconciler daemon.
//!
//! Runs the pod-deletion watcher on every replica and, under leader
//! election, the cron-driven orphan sweep. The cron expression comes
//! from a mounted schedule file when present (reloaded on change) and
//! falls back to the IPAM configuration.

use clap::Parser;
use sextant_controller::{
    configmap_update_predicate, election_identity, read_schedule_expression,
    watch_schedule_file, KubePodSource, LeaderConfig, LeaderElector, PodWatcher,
    ReconcileLooper, Schedule, ScheduledJob,
};
use sextant_store::{build_client, open_datastore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sextantd", about = "Sextant IPAM reconciler daemon")]
struct Cli {
    /// Path to the global IPAM configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the mounted cron schedule file
    #[arg(long, default_value = sextant_controller::DEFAULT_SCHEDULE_PATH)]
    schedule_file: PathBuf,

    /// Kubeconfig path when running outside the cluster
    #[arg(long)]
    kubeconfig: Option<String>,

    /// Run a single reconcile pass and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    // kube's rustls path needs a process-level crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = sextant_cni::load_daemon_config(cli.config.as_deref())?;
    if cli.kubeconfig.is_some() {
        config.kubernetes.kubeconfig = cli.kubeconfig.clone();
    }

    let store = open_datastore(&config).await?;
    let client = build_client(&config).await?;
    let pods = Arc::new(KubePodSource::new(client.clone()));
    let looper = Arc::new(ReconcileLooper::new(store, pods));

    if cli.once {
        let cleaned = looper.reconcile().await?;
        info!(count = cleaned.len(), ips = ?cleaned, "reconcile pass complete");
        return Ok(());
    }

    let token = CancellationToken::new();
    {
        let shutdown = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    // Fast path on every replica; the periodic sweep only on the leader.
    let watcher = PodWatcher::new(client.clone(), &token);
    let watcher_handle = {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.run(token).await {
                error!(%err, "pod watcher stopped");
            }
        })
    };

    let expression = match read_schedule_expression(&cli.schedule_file).await {
        Some(expression) => expression,
        None => {
            info!(
                file = %cli.schedule_file.display(),
                fallback = %config.reconciler_cron_expression,
                "no schedule file; using configured expression"
            );
            config.reconciler_cron_expression.clone()
        }
    };
    let schedule: Schedule = expression.parse()?;
    info!(expression = schedule.expression(), "reconciler schedule");

    let job = {
        let looper = Arc::clone(&looper);
        ScheduledJob::new(
            schedule,
            Arc::new(move || {
                let looper = Arc::clone(&looper);
                Box::pin(async move {
                    match looper.reconcile().await {
                        Ok(cleaned) if cleaned.is_empty() => {
                            info!("reconcile pass: nothing to clean")
                        }
                        Ok(cleaned) => {
                            info!(count = cleaned.len(), ips = ?cleaned, "reconcile pass complete")
                        }
                        Err(err) => warn!(%err, "reconcile pass failed"),
                    }
                })
            }),
        )
    };

    let leader_config = LeaderConfig {
        lease_duration: Duration::from_secs(config.leader_lease_duration),
        renew_deadline: Duration::from_secs(config.leader_renew_deadline),
        retry_period: Duration::from_secs(config.leader_retry_period),
        ..LeaderConfig::new(sextant_crds::storage_namespace(), election_identity())
    };
    info!(identity = %leader_config.identity, "contending for leadership");
    let elector = LeaderElector::new(client, leader_config);

    let schedule_file = cli.schedule_file.clone();
    let on_lead = {
        let job = Arc::clone(&job);
        move |child: CancellationToken| {
            let job = Arc::clone(&job);
            let schedule_file = schedule_file.clone();
            async move {
                let watch = {
                    let job = Arc::clone(&job);
                    let child = child.clone();
                    tokio::spawn(async move {
                        if let Err(err) = watch_schedule_file(
                            schedule_file,
                            job,
                            configmap_update_predicate,
                            child,
                        )
                        .await
                        {
                            warn!(%err, "schedule watcher stopped");
                        }
                    })
                };
                job.run(child).await;
                let _ = watch.await;
            }
        }
    };

    elector.run(token.clone(), on_lead).await?;
    token.cancel();
    let _ = watcher_handle.await;
    info!("sextantd stopped");
    Ok(())
}
