#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use parley_signal::{AppState, Config};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();

    match &config.log_file {
        Some(path) => parley_common::init_tracing_to_file(&config.log_level, path)?,
        None => parley_common::init_tracing_with_default(&config.log_level),
    }
    config.validate()?;

    let state = AppState::from_config(&config);
    let listener = TcpListener::bind(config.listen).await?;
    let bound_addr = listener.local_addr()?;

    info!("signaling server listening on {}", bound_addr);
    info!("websocket endpoint ws://{}/signal", bound_addr);
    if state.ice_servers.ice_servers.is_empty() {
        info!("no STUN/TURN servers configured; clients must bring their own");
    }

    parley_signal::serve(listener, state, shutdown_signal()).await?;
    info!("signaling server shut down");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
