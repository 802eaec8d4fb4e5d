#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # relaylink
//!
//! Outbound relay tunnel for devices whose local HTTP server is bound to
//! loopback. relaylink dials a public relay over a WebSocket, replays the
//! requests the relay pushes against the local server, and streams the
//! replies back.
//!
//! ## Subcommands
//!
//! - `relaylink serve` (default): run the tunnel and the control API
//! - `relaylink check`: print the resolved relay target and forwarding policy
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, runtimes, graceful shutdown
//! config.rs       : TOML + env-var configuration
//! auth.rs         : Bearer token middleware, constant-time comparison
//! routes/
//!   health.rs     : GET /api/health
//!   relay.rs      : /api/v1/relay/{status,connect,disconnect,settings}
//! tunnel/
//!   protocol.rs   : frame types and JSON codec
//!   client.rs     : supervisor, connection loop, reconnect
//!   writer.rs     : single writer for the WebSocket sink
//!   heartbeat.rs  : periodic ping
//!   forward.rs    : replays requests against the local server
//!   sse.rs        : event-stream line splitting
//!   status.rs     : TunnelHandle, status snapshot, controls
//!   backoff.rs    : jittered exponential reconnect delay
//! ```

use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use relaylink::config::Config;
use relaylink::routes::{self, AppState};
use relaylink::tunnel::client::display_target;
use relaylink::TunnelHandle;

/// Outbound relay tunnel for a loopback-only HTTP server.
#[derive(Parser)]
#[command(name = "relaylink", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel and the control API (default when no subcommand given).
    Serve,
    /// Print the resolved relay target and forwarding policy, then exit.
    Check,
}

fn main() {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relaylink: {e}");
            std::process::exit(2);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config),
        Commands::Check => check(&config),
    }
}

fn check(config: &Config) {
    let tunnel = match config.tunnel_config() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("relaylink: {e}");
            std::process::exit(2);
        }
    };
    match display_target(&tunnel) {
        Ok(target) => println!("relay target:     {target}"),
        Err(e) => println!("relay target:     ({e})"),
    }
    println!("enabled:          {}", tunnel.enabled);
    println!("client name:      {}", tunnel.client_name);
    println!("local base url:   {}", tunnel.local.base_url);
    println!("local token:      {}", if tunnel.local.token.is_some() { "set" } else { "unset" });
    println!("allowed prefixes: {}", tunnel.local.allowed_prefixes.join(", "));
    println!("allowed paths:    {}", tunnel.local.allowed_paths.join(", "));
    println!("blocked prefixes: {}", tunnel.local.blocked_prefixes.join(", "));
    println!("control listen:   {}", config.control.listen);
}

fn serve(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("relaylink v{} starting", env!("CARGO_PKG_VERSION"));

    let tunnel_config = match config.tunnel_config() {
        Ok(t) => t,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };
    if tunnel_config.enabled && tunnel_config.license_key.is_empty() {
        warn!("No license key configured, set RELAYLINK_LICENSE_KEY or update config");
    }

    let tunnel_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("relay-tunnel")
        .enable_all()
        .build()
        .expect("Failed to build tunnel runtime");
    let main_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let tunnel = TunnelHandle::new(tunnel_config, tunnel_runtime.handle().clone());
    if tunnel.config().enabled {
        tunnel.start();
    } else {
        info!("Tunnel disabled; use POST /api/v1/relay/connect to start it");
    }

    main_runtime.block_on(run_control_api(config, tunnel));
    tunnel_runtime.shutdown_background();
    info!("Goodbye");
}

async fn run_control_api(config: &Config, tunnel: TunnelHandle) {
    let tunnel = Arc::new(RwLock::new(tunnel));
    let state = AppState {
        tunnel: Arc::clone(&tunnel),
        start_time: Instant::now(),
    };
    let token = Some(config.local.token.trim().to_string()).filter(|t| !t.is_empty());
    let app = routes::router(state, token);

    let listener = TcpListener::bind(&config.control.listen)
        .await
        .expect("Failed to bind control listener");
    info!("Control API listening on {}", config.control.listen);

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    tunnel.read().await.stop().await;
}
