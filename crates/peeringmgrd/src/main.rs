//! Peering Manager Daemon Entry Point

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use overlay_peeringmgrd::{
    Args, DaemonConfig, IpRoute2, Iptables, Manifest, PeeringReconciler, VxlanMgr,
};
use overlaymgr_common::shell::ShellRunner;
use overlaymgr_orch::{Notification, ShardedDispatcher};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting peeringmgrd");

    match run(args).await {
        Ok(()) => {
            info!("peeringmgrd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("peeringmgrd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = DaemonConfig::from_args(&args).context("invalid configuration")?;
    info!(
        node = %config.node_name,
        node_ip = %config.node_ip,
        overlay_prefix = %config.overlay_prefix,
        workers = config.workers,
        "Configuration loaded"
    );

    let manifest = match &config.manifest {
        Some(path) => Manifest::load(path).context("failed to load manifest")?,
        None => {
            warn!("No manifest given, starting with no declared peerings");
            Manifest::default()
        }
    };
    let (store, inventory) = manifest.into_parts()?;
    let store = Arc::new(store);

    let kernel = Arc::new(IpRoute2::new(ShellRunner));

    // Runs once, before any per-peering reconciliation
    let vxlan = VxlanMgr::new(kernel.clone(), Arc::new(inventory));
    let report = vxlan
        .init(&config.vxlan())
        .await
        .context("VXLAN fabric initialization failed")?;
    info!(vtep = %report.vtep, peers = report.peers.len(), "VXLAN fabric ready");

    let reconciler = Arc::new(PeeringReconciler::new(
        store.clone(),
        kernel,
        Arc::new(Iptables::new(ShellRunner)),
        config.local_endpoint(),
    ));
    let dispatcher = ShardedDispatcher::start(reconciler, config.dispatcher());

    for key in store.keys() {
        dispatcher.submit(Notification::changed(key.to_string())).await?;
    }

    match config.resync {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        for key in store.keys() {
                            dispatcher.submit(Notification::changed(key.to_string())).await?;
                        }
                    }
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutdown requested");
    dispatcher.shutdown().await;
    Ok(())
}
