//! Debug Probe Hub daemon.

use anyhow::Context;
use clap::Parser;
use probe_hub::api::{self, AppState};
use probe_hub::config::HubConfig;
use probe_hub::container::ContainerManager;
use probe_hub::dispatch::Dispatcher;
use probe_hub::session::SessionTable;
use probe_hub::staging::StagingArea;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Shared-hardware dispatcher for USB debug probes
#[derive(Parser, Debug)]
#[command(name = "probe-hub", version)]
struct Args {
    /// Path to the hardware/target catalog
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured HTTP port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("probe_hub=info,tower_http=warn")),
        )
        .init();

    let args = Args::parse();

    let config = HubConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.server.staging_dir).with_context(|| {
        format!(
            "creating staging directory {}",
            config.server.staging_dir.display()
        )
    })?;

    let staging = StagingArea::new(&config.server);
    let manager = ContainerManager::new(config.server.compose_file.clone());
    let table = SessionTable::new();
    let dispatcher = Dispatcher::new(config.clone(), manager, table.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        dispatcher,
        staging,
    });
    let app = api::router(state);

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let port = args.port.unwrap_or(config.server.port);
    let addr = format!("{bind}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        addr = %addr,
        probes = config.probes.len(),
        targets = config.targets.len(),
        "probe hub listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop every live session so locks release and servers die before the
    // process exits.
    info!("shutting down, stopping live sessions");
    for session in table.list() {
        let _ = table
            .stop(session.probe_id, probe_hub::session::StopKind::All)
            .await;
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
