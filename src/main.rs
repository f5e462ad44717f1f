//! Hookrelay webhook delivery agent.
//!
//! Polls the broker for captured webhook events and forwards them to local
//! and remote destinations with retries and health gating. `SIGHUP`
//! reloads routing from the configuration file.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use hookrelay_core::{NoOpEventHandler, RealClock};
use hookrelay_delivery::{BrokerClient, Dispatcher};
use tracing::{info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("starting hookrelay agent");
    info!(
        broker_url = %config.broker_url,
        webhook_scope = %config.webhook_scope,
        destinations = config.destinations.len(),
        rules = config.rules.len(),
        "configuration loaded"
    );

    let broker = Arc::new(
        BrokerClient::new(config.to_broker_config()).context("failed to create broker client")?,
    );
    let dispatcher = Dispatcher::new(
        broker.clone(),
        broker,
        config.to_routing_config(),
        config.to_dispatcher_config(),
        Arc::new(RealClock::new()),
        Arc::new(NoOpEventHandler::new()),
    )
    .context("failed to create dispatcher")?;

    dispatcher.start();
    info!("hookrelay is relaying events");

    tokio::select! {
        () = shutdown_signal() => {},
        result = reload_on_hangup(&dispatcher) => result?,
    }

    info!("shutdown signal received, stopping dispatcher");
    dispatcher.shutdown().await.context("dispatcher did not stop cleanly")?;

    info!("hookrelay shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` takes precedence over the configured
/// filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Re-reads the configuration on every `SIGHUP` and applies its routing.
///
/// Other settings only take effect on restart.
#[cfg(unix)]
async fn reload_on_hangup(dispatcher: &Dispatcher) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        info!("received SIGHUP, reloading routing");
        match Config::load() {
            Ok(config) => dispatcher.reload_routing(config.to_routing_config()),
            Err(e) => warn!(error = %format!("{e:#}"), "reload failed, keeping current routing"),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn reload_on_hangup(_dispatcher: &Dispatcher) -> Result<()> {
    std::future::pending().await
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C signal");
        },
        () = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
