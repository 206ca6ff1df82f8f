//! # Huddle Server
//!
//! One binary, two roles:
//! - `huddle hub`: WebSocket signaling hub for project rooms
//! - `huddle sfu`: audio SFU that dials the hub's internal channel
//!
//! Both read the same configuration (`config.toml`, `.env`, `HUDDLE_*`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use huddle_hub::{build_router, AppState, HubSettings, OpenAccess};
use huddle_sfu::{HubLink, LinkSettings, Sfu, SfuSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Real-time signaling hub and audio SFU", long_about = None)]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve `/ws/{project_id}` and `/health`
    Hub {
        /// Overrides `server.port`
        #[arg(long, env = "HUDDLE_PORT")]
        port: Option<u16>,
    },
    /// Run the audio SFU against a hub
    Sfu {
        /// Overrides `sfu.hub_url`
        #[arg(long, env = "HUDDLE_HUB_URL")]
        hub_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = huddle_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Huddle v{}", env!("CARGO_PKG_VERSION"));

    match cli.role {
        Role::Hub { port } => run_hub(config, port).await,
        Role::Sfu { hub_url } => run_sfu(config, hub_url).await,
    }
}

async fn run_hub(
    config: &huddle_common::config::AppConfig,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let secret = config
        .auth
        .as_ref()
        .map(|auth| auth.jwt_secret.as_str())
        .filter(|secret| !secret.is_empty())
        .context("auth.jwt_secret must be set to run the hub")?;

    let state = AppState::new(HubSettings::from(&config.hub), secret, Arc::new(OpenAccess));
    let router = build_router(state);
    let addr = SocketAddr::new(
        config.server.host.parse()?,
        port.unwrap_or(config.server.port),
    );

    tracing::info!("Hub listening on ws://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down hub");
        })
        .await?;
    Ok(())
}

async fn run_sfu(
    config: &huddle_common::config::AppConfig,
    hub_url: Option<String>,
) -> anyhow::Result<()> {
    let (outbound_tx, outbound_rx) = mpsc::channel(config.sfu.outbound_capacity.max(1));
    let sfu = Sfu::new(&SfuSettings::from(&config.sfu), outbound_tx)?;

    let mut link_settings = LinkSettings::from(&config.sfu);
    if let Some(url) = hub_url {
        link_settings.hub_url = url;
    }
    tracing::info!(hub = %link_settings.hub_url, "SFU starting");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down SFU");
        on_signal.cancel();
    });

    HubLink::new(link_settings)
        .run(sfu, outbound_rx, shutdown)
        .await;
    Ok(())
}
