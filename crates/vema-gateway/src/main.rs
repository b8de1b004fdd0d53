//! VEMA gateway binary: loads configuration, wires the agent stack, and
//! serves the HTTP API.

mod app;
mod http;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::AppState;
use vema_core::config::VemaConfig;

#[derive(Parser)]
#[command(name = "vema-gateway", about = "Vehicle emission assistant HTTP gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "vema.toml")]
    config: String,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VEMA_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = VemaConfig::load_from(&args.config)?;
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let bind = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let state = Arc::new(AppState::from_config(config)?);
    let router = http::router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "vema-gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}
