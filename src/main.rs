mod auth;
mod config;
mod event;
mod filter;
mod limiter;
mod metrics;
mod pow;
mod repository;
mod security;
mod server;
mod session;
mod spam;
mod subscriptions;
mod validation;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use config::Settings;
use repository::Repository;
use session::RelayState;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "nostrum", author, version, about = "Nostr relay")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and exit.
    InitDb,
    /// Launch the WebSocket relay and the HTTP side endpoints.
    Serve,
    /// Re-verify a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
    /// Delete every stored event. Administrative.
    Wipe,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    run_with(cfg, cli.command).await
}

async fn run_with(cfg: Settings, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::InitDb => {
            let repo = Repository::connect(&cfg.database_url, cfg.max_limit).await?;
            repo.init().await?;
        }
        Commands::Verify { sample } => {
            let repo = Repository::connect(&cfg.database_url, cfg.max_limit).await?;
            repo.init().await?;
            let verified = repo.verify_sample(sample).await?;
            println!("verified {verified} events");
        }
        Commands::Wipe => {
            let repo = Repository::connect(&cfg.database_url, cfg.max_limit).await?;
            repo.init().await?;
            repo.delete_all().await?;
        }
        Commands::Serve => {
            metrics::register_all();
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let state = Arc::new(RelayState::new(cfg).await?);
            spawn_maintenance(state.clone());
            tokio::try_join!(
                ws::serve_ws(ws_addr, state.clone(), shutdown_signal()),
                server::serve_http(http_addr, state.clone(), shutdown_signal())
            )?;
        }
    }
    Ok(())
}

/// Periodic housekeeping for the stateful components.
fn spawn_maintenance(state: Arc<RelayState>) {
    let limiter_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        tick.tick().await;
        loop {
            tick.tick().await;
            limiter_state.limiter.lock().await.cleanup();
        }
    });
    let spam_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        tick.tick().await;
        loop {
            tick.tick().await;
            spam_state.spam.lock().await.cleanup();
        }
    });
    let security_state = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        tick.tick().await;
        loop {
            tick.tick().await;
            security_state.security.lock().await.decay();
        }
    });
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.tick().await;
        loop {
            tick.tick().await;
            state.auth.lock().await.sweep();
        }
    });
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nostrum=info,warn".into()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
