mod auth;
mod bootstrap;
mod cache;
mod chat;
mod error;
mod gateway;
mod health;
mod notify;
mod routes;
mod state;
#[cfg(test)]
mod test_support;

use std::future::IntoFuture;
use std::time::Duration;

use anyhow::Result;
use huddle_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use huddle_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.effective_level().parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "huddle-server listening"
    );

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let server = axum::serve(listener, routes::router(app.state.clone()))
        .with_graceful_shutdown(wait_for_shutdown())
        .into_future();
    // In-flight requests get `grace` to finish once ctrl-c arrives.
    tokio::select! {
        outcome = server => outcome?,
        () = async {
            wait_for_shutdown().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(
                event_name = "system.server.shutdown_forced",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "graceful shutdown window elapsed"
            );
        }
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "huddle-server stopping"
    );
    app.registry.disconnect_all().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_failed",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
