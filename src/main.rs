#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # putarr
//!
//! Proxy that lets put.io act as a download client for Sonarr, Radarr and
//! Whisparr. The Arrs speak the Transmission RPC protocol to putarr; putarr
//! translates to the put.io API and runs the download/import/cleanup
//! lifecycle in the background.
//!
//! ## Subcommands
//!
//! - `putarr run` — run the proxy
//! - `putarr get-token` — generate a put.io API token (OOB flow)
//! - `putarr generate-config` — write a starter config file
//! - `putarr version` — print the version

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use putarr::arr::{ArrClient, ArrServiceClient};
use putarr::config::{self, Config};
use putarr::download::Manager;
use putarr::putio::PutioClient;
use putarr::{routes, setup, AppState};

/// How long in-flight RPC connections get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// put.io to Sonarr/Radarr/Whisparr proxy.
#[derive(Parser)]
#[command(name = "putarr", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy.
    Run {
        /// Path to the config file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate a put.io API token.
    GetToken,
    /// Generate a config file (runs the token flow).
    GenerateConfig {
        /// Path to write the config file to.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the version number.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => {
            let path = config.unwrap_or_else(config::default_config_path);
            run_proxy(&path).await
        }
        Commands::GetToken => setup::get_token().await.map(|_| ()).map_err(Into::into),
        Commands::GenerateConfig { config } => {
            let path = config.unwrap_or_else(config::default_config_path);
            setup::generate_config(&path).await
        }
        Commands::Version => {
            println!("putarr version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run_proxy(config_path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    config.validate()?;
    let config = Arc::new(config);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.loglevel.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("putarr v{} starting", env!("CARGO_PKG_VERSION"));

    // One root token; everything that sleeps, polls, or streams observes it.
    let cancel = CancellationToken::new();

    let putio = Arc::new(PutioClient::new(&config.putio.api_key, cancel.clone()));

    // Fail fast on a bad API token before accepting any RPC traffic.
    let account = putio
        .account_info()
        .await
        .map_err(|e| format!("failed to verify put.io API key: {e}"))?;
    info!("authenticated against put.io as {}", account.username);

    let arr_clients: Vec<ArrServiceClient> = config
        .arr_services()
        .into_iter()
        .map(|(name, arr)| ArrServiceClient {
            name: name.to_string(),
            client: ArrClient::new(&arr.url, &arr.api_key, cancel.clone()),
        })
        .collect();
    for svc in &arr_clients {
        info!("configured arr service: {}", svc.name);
    }

    let mut manager = Manager::new(
        config.clone(),
        putio.clone(),
        arr_clients,
        cancel.clone(),
    );
    manager.start();

    let state = AppState {
        config: config.clone(),
        putio,
    };
    let app = routes::rpc::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}/transmission/rpc");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    shutdown_signal().await;
    info!("shutting down...");
    cancel.cancel();

    // Give in-flight RPC requests a bounded window to finish.
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("server error during shutdown: {e}"),
        Ok(Err(e)) => warn!("server task failed: {e}"),
        Err(_) => warn!("server did not drain within {SHUTDOWN_GRACE:?}"),
    }

    manager.stop().await;
    info!("goodbye");
    Ok(())
}

/// Resolve when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
