#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

use anyhow::Context;
use clap::Parser;
use netpold::cli::{Args, LogFormat};
use netpold::kernel_shell::ShellKernel;
use netpold::{bootstrap, cleanup};
use netpold_core::{ClusterInfo, FlannelConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    init_tracing(&args.log_level, args.log_format);

    if args.cleanup_config {
        let kernel = ShellKernel::default();
        cleanup::run(&kernel).await?;
        return Ok(());
    }

    let client = build_client(&args).await?;
    let hostname = bootstrap::resolve_hostname(args.hostname_override.as_deref())?;
    let ip_range = bootstrap::resolve_ip_range(&client, &hostname, args.ip_range).await?;

    if args.accept_flannel_ip && args.flannel_network.is_none() {
        anyhow::bail!("--accept-flannel-ip requires --flannel-network");
    }
    let flannel_network = args.accept_flannel_ip.then(|| FlannelConfig {
        network: args.flannel_network.expect("checked above"),
        subnet_len_bits: args.flannel_len_bit,
    });

    let cluster_info = ClusterInfo { ip_range, flannel_network };
    tracing::info!(?ip_range, hostname, "starting");

    let kernel = Arc::new(ShellKernel::default());
    let reconciler = netpold_core::reconcile::Reconciler::new(kernel, cluster_info, args.min_sync_period());
    let sync_handle = Arc::clone(&reconciler).spawn_periodic_sync(args.sync_period());

    let (ready_tx, ready_rx) = watch::channel(false);
    let readiness_reconciler = Arc::clone(&reconciler);
    let readiness_handle = tokio::spawn(async move {
        loop {
            if readiness_reconciler.is_initialized().await {
                let _ = ready_tx.send(true);
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });

    let admin_handle = tokio::spawn(netpold::admin::serve(args.admin_listen_addr, ready_rx));

    let index_config_sync_period = args.config_sync_period();
    let index_handle = tokio::spawn(netpold_k8s_index::run(client, reconciler, index_config_sync_period));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt; shutting down");
        }
        error = index_handle => {
            match error {
                Ok(error) => tracing::error!(%error, "event index terminated"),
                Err(error) => tracing::error!(%error, "event index task panicked"),
            }
        }
    }

    sync_handle.abort();
    readiness_handle.abort();
    admin_handle.abort();
    Ok(())
}

async fn build_client(args: &Args) -> anyhow::Result<netpold_k8s_api::Client> {
    let mut config = if let Some(path) = &args.kubeconfig {
        let kubeconfig = kube::config::Kubeconfig::read_from(std::path::Path::new(path))
            .with_context(|| format!("failed to read kubeconfig at {path}"))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
            .await
            .context("failed to build client config from kubeconfig")?
    } else {
        kube::Config::infer()
            .await
            .context("failed to infer client config from environment or in-cluster config")?
    };

    if let Some(master) = &args.master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("invalid --master url {master:?}"))?;
    }

    netpold_k8s_api::Client::try_from(config).context("failed to build Kubernetes client")
}

fn init_tracing(log_level: &str, log_format: LogFormat) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }
}

fn print_version() {
    let sha = option_env!("NETPOLD_GIT_SHA").unwrap_or("unknown");
    println!("netpold {} ({})", env!("CARGO_PKG_VERSION"), sha);
}
