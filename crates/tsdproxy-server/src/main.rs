//! tsdproxy server binary.
//!
//! Publishes services running behind a local orchestrator onto a tailnet:
//! one node, hostname and certificate per service, discovered from
//! container labels or a static list.

mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tsdproxy_config::AppConfig;
use tsdproxy_manager::ProxyManager;
use tsdproxy_proxyproviders::tailscale::{TailscaleProvider, TailscaleProviderConfig};
use tsdproxy_targetproviders::{DockerTargetProvider, ListTargetProvider};

/// tsdproxy - publish orchestrator services on your tailnet
#[derive(Parser, Debug)]
#[command(name = "tsdproxy")]
#[command(about = "Publish orchestrator services on your tailnet")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy server (the default)
    Server,
    /// Probe the local readiness endpoint; exits non-zero when the server
    /// is not ready. Meant for container HEALTHCHECK lines.
    Healthcheck {
        /// Port of the local admin endpoint
        #[arg(long, env = "TSDPROXY_HTTP_PORT", default_value = "8080")]
        port: u16,
    },
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Server) {
        Commands::Server => run_server().await,
        Commands::Healthcheck { port } => healthcheck(port).await,
    }
}

async fn run_server() -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting server");

    // A broken configuration is fatal at startup (exit code 1).
    let config = AppConfig::from_env().context("invalid configuration")?;

    let manager = ProxyManager::new(config.default_proxy_provider.clone());
    register_providers(&manager, &config).await;
    manager.start();

    let cancel = CancellationToken::new();
    manager.watch_events(cancel.clone());

    // Admin endpoint: readiness, SSE status stream, proxy snapshot.
    let state = api::AppState::new(manager.clone());
    let app = api::router(state.clone());
    let bind_addr = format!("{}:{}", config.http.hostname, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding admin endpoint on {bind_addr}"))?;
    info!(addr = %bind_addr, "admin endpoint listening");

    state.set_ready(true);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %err, "admin endpoint failed");
        }
    });

    wait_for_shutdown_signal().await;
    info!("received shutdown signal");

    state.set_ready(false);
    cancel.cancel();
    manager.stop_all_proxies().await;
    let _ = server.await;

    info!("server was shutdown successfully");
    Ok(())
}

async fn register_providers(manager: &ProxyManager, config: &AppConfig) {
    for (name, ts) in &config.tailscale.providers {
        let provider = TailscaleProvider::new(
            name.clone(),
            TailscaleProviderConfig {
                auth_key: ts.auth_key.clone(),
                control_url: ts.control_url.clone(),
                data_dir: config.tailscale.data_dir.clone(),
            },
        );
        info!(provider = %name, "created tailscale proxy provider");
        manager.add_proxy_provider(name.clone(), Arc::new(provider));
    }

    for (name, docker) in &config.docker {
        match DockerTargetProvider::new(name, docker).await {
            Ok(provider) => {
                info!(provider = %name, host = %docker.host, "created docker target provider");
                manager.add_target_provider(name.clone(), Arc::new(provider));
            }
            Err(err) => error!(provider = %name, error = %err, "error creating docker provider"),
        }
    }

    for (name, list) in &config.lists {
        match ListTargetProvider::new(name, list) {
            Ok(provider) => {
                info!(provider = %name, "created list target provider");
                manager.add_target_provider(name.clone(), Arc::new(provider));
            }
            Err(err) => error!(provider = %name, error = %err, "error creating list provider"),
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "could not install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// One-shot readiness probe against the local admin endpoint.
async fn healthcheck(port: u16) -> Result<()> {
    use bytes::Bytes;
    use http_body_util::Empty;
    use hyper_util::rt::TokioIo;

    let addr = format!("127.0.0.1:{port}");
    let stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("handshake with admin endpoint")?;
    tokio::spawn(connection);

    let request = hyper::Request::builder()
        .uri("/health/ready/")
        .header(hyper::header::HOST, addr)
        .body(Empty::<Bytes>::new())
        .context("building healthcheck request")?;

    let response = sender
        .send_request(request)
        .await
        .context("sending healthcheck request")?;

    anyhow::ensure!(
        response.status().is_success(),
        "server not ready: {}",
        response.status()
    );
    Ok(())
}
