//! # Resource Gateway - Main Entry Point
//!
//! Loads manifest files into a registry with the built-in kinds, materializes the
//! entrypoint runner and runs it until SIGINT or SIGTERM. On shutdown the runner
//! gets the configured grace period to stop, then every resource is torn down.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use resource_gateway::observability::init_logging;
use resource_gateway::{default_registry, ErrorKind, GatewayError, GatewayResult, LogFormat, Runner, RuntimeConfig};

#[derive(Debug, Parser)]
#[command(name = "resource-gateway", version, about)]
struct Cli {
    /// Manifest file to load; may be repeated
    #[arg(short = 'f', long = "file", env = "GATEWAY_MANIFESTS", value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Identity of the runner to start
    #[arg(long, env = "GATEWAY_ENTRYPOINT")]
    entrypoint: Option<String>,

    /// Log filter directive, e.g. `info` or `resource_gateway=debug`
    #[arg(long, env = "GATEWAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// `json` or `text`
    #[arg(long, env = "GATEWAY_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Registry debug level (0-3)
    #[arg(long, env = "GATEWAY_DEBUG")]
    debug: Option<u8>,
}

impl Cli {
    fn into_config(self) -> GatewayResult<RuntimeConfig> {
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides()?;

        if !self.files.is_empty() {
            config.manifests = self.files;
        }
        if let Some(entrypoint) = self.entrypoint {
            config.entrypoint = entrypoint;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(debug) = self.debug {
            config.debug_level = debug;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config = Cli::parse().into_config()?;
    init_logging(&config)?;

    info!("🚀 Starting Resource Gateway {}", env!("CARGO_PKG_VERSION"));

    let registry = default_registry(config.debug_level)?;
    for path in &config.manifests {
        let loaded = registry.load_file(path).await?;
        info!("Loaded {} resources from {}", loaded.len(), path.display());
    }

    let runner: Arc<dyn Runner> = registry.get_as(&config.entrypoint).await?;
    let shutdown = CancellationToken::new();
    let mut task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run(shutdown).await })
    };

    let result = tokio::select! {
        joined = &mut task => joined_result(joined),
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping {}", config.entrypoint);
            shutdown.cancel();
            match tokio::time::timeout(config.shutdown_timeout, &mut task).await {
                Ok(joined) => joined_result(joined),
                Err(_) => {
                    warn!("Entrypoint did not stop within {:?}", config.shutdown_timeout);
                    task.abort();
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = registry.teardown().await {
        error!("Teardown failed: {}", e);
    }

    match &result {
        Ok(()) => info!("✅ Resource Gateway shutdown complete"),
        Err(e) => error!("Resource Gateway stopped with an error: {}", e),
    }
    result
}

fn joined_result(joined: Result<GatewayResult<()>, tokio::task::JoinError>) -> GatewayResult<()> {
    joined.map_err(|e| GatewayError::new(ErrorKind::Runtime, "main", "entrypoint task failed").wrap(e))?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT"),
        _ = terminate => info!("📡 Received SIGTERM"),
    }
}
