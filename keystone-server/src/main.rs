// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Keystone Gateway — multi-tenant reverse proxy with embedded
//  Lua scripting
//
//  Data plane: tokio + axum, one preemptive worker per request
//  Scripting:  pooled LuaJIT VMs, compile-once bytecode
//  Config:     YAML + KEYSTONE_ environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use keystone_server::gateway::{self, Gateway};
use keystone_core::KeystoneConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "keystone",
    version,
    about = "Keystone Gateway — multi-tenant reverse proxy with embedded Lua scripting"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Config ──
    let config = KeystoneConfig::load(cli.config.as_deref())?;

    // ── Tracing ──
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    keystone_observability::logger::init(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Keystone Gateway starting"
    );

    // ── Assembly: compiler → pool → engine → proxy → router ──
    let gateway = Gateway::build(&config)?;
    let app = gateway::app(Arc::clone(&gateway), &config);

    // ── Listener: a taken port is a startup failure, not a retry loop ──
    let listener = tokio::net::TcpListener::bind(config.server.addr).await?;
    info!(addr = %config.server.addr, "Serving traffic");

    // ── Graceful shutdown with a bounded drain ──
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    use std::future::IntoFuture;
    let mut server = pin!(server.into_future());
    tokio::select! {
        result = &mut server => result?,
        _ = async {
            let _ = signal_rx.await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = config.server.shutdown_grace_secs, "Drain deadline exceeded; aborting in-flight requests");
        }
    }

    let stats = gateway.pool_stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        wait_micros = stats.total_wait_micros,
        "Interpreter pool totals"
    );
    info!("Keystone Gateway stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, draining requests"),
        _ = terminate => info!("Received SIGTERM, draining requests"),
    }
}
