//! Sluice Node - Git smart HTTP server.
//!
//! Serves one in-memory repository for clone, fetch and push.

use anyhow::Context;
use clap::Parser;
use sluice_node::observability::{init_logging, LogFormat};
use sluice_node::{create_router, AppState, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;

/// Sluice Node - Git smart HTTP server
#[derive(Parser, Debug)]
#[command(name = "sluice-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Location of the served repository
    #[arg(long)]
    repository: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Deadline for a single fetch or push, in seconds
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Largest accepted request body, in bytes
    #[arg(long)]
    max_body_size: Option<usize>,
}

impl Args {
    /// Loads the configuration file, if any, then applies flags over it.
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(repository) = self.repository {
            config.repository = repository;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout_secs = Some(secs);
        }
        if let Some(size) = self.max_body_size {
            config.max_body_size = size;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    init_logging(&config.log_level, LogFormat::parse(&config.log_format));

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Sluice node");
    tracing::info!(
        listen_addr = %config.listen_addr,
        repository = %config.repository,
        max_body_size = config.max_body_size,
        request_timeout_secs = ?config.request_timeout_secs,
        "Node configuration"
    );

    let addr = config.listen_addr;
    let state = AppState::in_memory(config).context("creating repository")?;
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("Sluice node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "repository: /srv/from-file.git").unwrap();
        writeln!(file, "log_level: debug").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = Args::try_parse_from([
            "sluice-node",
            "--config",
            path.as_str(),
            "--repository",
            "/srv/from-flag.git",
            "--request-timeout-secs",
            "5",
        ])
        .unwrap();

        let config = args.into_config().unwrap();
        assert_eq!(config.repository, "/srv/from-flag.git");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.request_timeout_secs, Some(5));
    }

    #[test]
    fn test_invalid_flag_value_rejected() {
        let args = Args::try_parse_from(["sluice-node", "--max-body-size", "0"]).unwrap();
        assert!(args.into_config().is_err());
    }
}
