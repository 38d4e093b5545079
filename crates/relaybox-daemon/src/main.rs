//! relaybox control-plane daemon: opens the store, wires the scheduler
//! and apply pipeline, and serves the external HTTP surface until a
//! shutdown signal arrives.

use clap::{Parser, Subcommand};
use relaybox_apply::{ApplyOptions, ApplyPipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "relaybox-daemon")]
#[command(about = "Control-plane daemon for the relaybox proxy orchestrator")]
struct Cli {
    /// Path to a TOML config file. Environment variables documented on
    /// `relaybox_core::Config` always take precedence over values read
    /// from this file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `log_level` from the config file.
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the HTTP surface and background scheduler (the default).
    Serve,
    /// Runs pending database migrations and exits.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = relaybox_core::Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => run_migrate(&config).await,
        Commands::Serve => run_serve(&config).await,
    }
}

fn init_tracing(config: &relaybox_core::Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry();
    if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_filter(env_filter))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
            .init();
    }
}

async fn run_migrate(config: &relaybox_core::Config) -> anyhow::Result<()> {
    let pool = relaybox_store::open(&config.database_url).await?;
    info!("migrations applied");
    pool.close().await;
    Ok(())
}

async fn run_serve(config: &relaybox_core::Config) -> anyhow::Result<()> {
    let pool = relaybox_store::open(&config.database_url).await?;
    let pipeline = Arc::new(ApplyPipeline::new());
    let apply_options = ApplyOptions::from_config(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_pool = pool.clone();
    let scheduler_tick = std::time::Duration::from_secs(config.scheduler_tick_seconds);
    let scheduler_handle = tokio::spawn(async move {
        relaybox_scheduler::run(scheduler_pool, scheduler_tick, shutdown_rx).await;
    });

    let state = relaybox_api::AppState::new(pool, pipeline, apply_options);
    let app = relaybox_api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "relaybox-daemon: listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "relaybox-daemon: server error");
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "relaybox-daemon: scheduler task panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["relaybox-daemon"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn cli_accepts_migrate_subcommand() {
        let cli = Cli::parse_from(["relaybox-daemon", "migrate"]);
        assert!(matches!(cli.command, Some(Commands::Migrate)));
    }

    #[test]
    fn cli_verifies_clap_invariants() {
        Cli::command().debug_assert();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("relaybox-daemon: shutdown signal received");
}
