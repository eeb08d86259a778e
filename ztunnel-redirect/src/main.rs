use anyhow::{bail, Context};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod bpffs;
mod config;
mod error;
mod loader;
mod netlink;
mod netns;
mod redirect;
mod server;
mod tables;
mod tc;
#[cfg(test)]
mod testing;

use config::{CliArgs, Config};
use netlink::LinuxKernel;
use netns::NetnsDir;
use redirect::{RedirectArgs, Redirector};
use server::{Command, RedirectServer, WorkerMetrics};
use tables::LogLevel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    bpffs::raise_memlock_limit().context("removing limit on locked memory")?;
    bpffs::ensure_pin_path(&config.pin_path)
        .with_context(|| format!("preparing pin path {}", config.pin_path.display()))?;
    let loaded = loader::load(&config.bpf_object, &config.pin_path)
        .with_context(|| format!("loading {}", config.bpf_object.display()))?;
    let kernel = LinuxKernel::new(NetnsDir::new(&config.netns_dir));
    let mut redirector = Redirector::from_loaded(kernel, loaded);

    if let Some(ref path) = cli.add_pod {
        return add_pod_to_mesh(&mut redirector, path);
    }

    // ── Redirect worker ───────────────────────────────────────────────
    let worker_metrics = WorkerMetrics::default();
    let server = RedirectServer::start(redirector, worker_metrics.clone())
        .context("starting redirect worker")?;
    let handle = server.handle();

    if let Some(ref level) = config.ebpf_log_level {
        let level: LogLevel = level.parse()?;
        handle.call(Command::SetLogLevel(level)).await?;
    }
    if !config.host_ips.is_empty() {
        handle
            .call(Command::UpdateHostIps(config.host_ips.clone()))
            .await?;
    }

    // ── Shutdown signal ───────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .context("installing signal handler")?;

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        redirect: handle,
        worker: worker_metrics,
        start_time: std::time::Instant::now(),
    });

    let allowed_ips = config.allowed_ips.clone();
    let app = api::router(app_state, &allowed_ips);

    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    tokio::task::spawn_blocking(move || server.stop()).await?;
    Ok(())
}

/// Applies one workload add from a JSON request file, without serving.
fn add_pod_to_mesh(redirector: &mut Redirector<LinuxKernel>, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let args: RedirectArgs = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    if args.is_ztunnel || args.remove {
        bail!("--add-pod only adds workloads");
    }
    redirector.handle_request(&args)?;
    tracing::info!(ifindex = args.ifindex, "pod added to mesh");
    Ok(())
}
