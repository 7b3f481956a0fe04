use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use podwatch_informer::{Informer, InformerConfig};
use podwatch_kubehub::KubePodSource;
use podwatch_store::StoreReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod printer;

use printer::{Output, PrintHandler};

#[derive(Parser, Debug)]
#[command(name = "podwatch", version, about = "Print pod add/update/delete events from a synced local cache")]
struct Cli {
    /// Kubeconfig file; without it the config is inferred (KUBECONFIG or ~/.kube/config, then in-cluster)
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use
    #[arg(long = "context")]
    context: Option<String>,
    /// Namespace to watch; empty watches all namespaces
    #[arg(short = 'n', long = "namespace", env = "PODWATCH_NAMESPACE", default_value = "")]
    namespace: String,
    /// Periodic resync of the cached state in seconds (0 disables)
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,
    /// Give up if the initial listing has not been delivered by then
    #[arg(long = "sync-timeout-secs", env = "PODWATCH_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,
    /// Objects per list page
    #[arg(long = "page-size", env = "PODWATCH_LIST_PAGE_SIZE", default_value_t = 500)]
    page_size: u32,
    #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
    output: Output,
    /// Print the synced cache once before streaming events (JSON output only)
    #[arg(long = "dump-on-sync")]
    dump_on_sync: bool,
}

fn init_tracing() {
    let env = std::env::var("PODWATCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODWATCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PODWATCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}

fn dump(reader: &StoreReader) -> Result<()> {
    let snap = reader.current();
    let items = snap.items();
    println!("{}", serde_json::to_string_pretty(&items)?);
    info!(epoch = snap.epoch, objects = items.len(), "cache dumped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    init_metrics();

    let mut config = InformerConfig::from_env();
    if let Some(secs) = cli.resync_secs {
        config = config.with_resync_period(Some(Duration::from_secs(secs)));
    }
    let client = podwatch_kubehub::client(cli.kubeconfig.as_deref(), cli.context.as_deref()).await?;
    let source = KubePodSource::new(client, Some(cli.namespace.as_str())).with_page_size(cli.page_size);
    info!(source = ?source, resync = ?config.resync_period, "starting pod informer");

    let handler = Arc::new(PrintHandler::new(cli.output));
    let mut informer = Informer::new(source, handler, config);
    let shutdown = CancellationToken::new();
    informer.start(&shutdown)?;

    let timeout = Duration::from_secs(cli.sync_timeout_secs);
    let synced = tokio::select! {
        ok = informer.wait_for_cache_sync(timeout) => Some(ok),
        _ = shutdown_signal() => None,
    };
    let Some(synced) = synced else {
        info!("signal received before cache sync");
        informer.stop();
        informer.join().await.context("pod informer failed")?;
        println!("pod monitor exiting");
        return Ok(());
    };
    if !synced {
        informer.stop();
        informer.join().await.context("pod informer failed before cache sync")?;
        error!(timeout_secs = cli.sync_timeout_secs, "timed out waiting for cache sync");
        anyhow::bail!("timed out waiting for cache sync after {}s", cli.sync_timeout_secs);
    }

    if cli.dump_on_sync {
        if cli.output == Output::Json {
            dump(&informer.store())?;
        } else {
            warn!("--dump-on-sync requires --output json; ignoring");
        }
    }
    println!("pod monitor running; watching pod events. (Ctrl+C to stop)");

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        _ = informer.stopped() => warn!("pod informer stopped on its own"),
    }
    informer.stop();
    let res = informer.join().await;
    println!("pod monitor exiting");
    res.context("pod informer failed")?;
    Ok(())
}
