mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use core_gateway::CoreGateway;
use session_store::{Credentials, SessionStore};
use tracing::info;

use corebridge::{config, server, AppState};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Precedence: CLI, then environment, then config file.
    let mut cfg = config::load(&cli.config)?;
    cfg.apply_env(|key| std::env::var(key).ok());
    if let Some(ref listen) = cli.listen {
        cfg.server.listen = listen.clone();
    }
    if let Some(ref auth_file) = cli.auth_file {
        cfg.auth.credentials_file = auth_file.clone();
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.server.listen,
        credentials_file = %cfg.auth.credentials_file.display(),
        "corebridge starting"
    );

    let credentials = Credentials::load_or_init(&cfg.auth.credentials_file)
        .context("failed to load credentials")?;
    let sessions = SessionStore::with_ttl(credentials, cfg.auth.session_ttl());
    let gateway = CoreGateway::new(cfg.gateway.to_gateway_config())
        .context("failed to build core gateway client")?;
    let state = AppState::new(sessions, gateway);

    let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.listen))?;

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    server::serve(listener, state)
        .await
        .context("server terminated with an error")?;

    info!("corebridge stopped");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::error!(%err, "failed to register SIGTERM handler");
                    ctrl_c.await;
                    info!("received SIGINT (ctrl-c)");
                    return;
                }
            };

        tokio::select! {
            () = ctrl_c => info!("received SIGINT (ctrl-c)"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received SIGINT (ctrl-c)");
    }
}
