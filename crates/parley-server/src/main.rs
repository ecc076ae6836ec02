//! # Parley Server
//!
//! Presence-aware chat broadcast server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings, or the first parley.toml found
//! parley
//!
//! # Run with an explicit config file
//! parley --config ./parley.toml
//! PARLEY_CONFIG=./parley.toml parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match config_path(&args, std::env::var("PARLEY_CONFIG").ok())? {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            Config::from_file(&path)?
        }
        None => Config::load()?,
    };

    info!(
        host = %config.host,
        port = config.port,
        max_message_size = config.limits.max_message_size,
        queue_capacity = config.limits.queue_capacity,
        "Starting Parley server"
    );

    metrics::init_metrics();
    handlers::run_server(config).await
}

/// Pick an explicit config file: `--config <path>` wins over `PARLEY_CONFIG`.
fn config_path(args: &[String], from_env: Option<String>) -> Result<Option<PathBuf>> {
    match args {
        [] => Ok(from_env.filter(|p| !p.is_empty()).map(PathBuf::from)),
        [flag, path] if flag == "--config" || flag == "-c" => Ok(Some(PathBuf::from(path))),
        _ => bail!("usage: parley [--config <path>]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_path_selection() {
        assert_eq!(config_path(&[], None).unwrap(), None);
        assert_eq!(
            config_path(&[], Some("env.toml".into())).unwrap(),
            Some(PathBuf::from("env.toml"))
        );
        assert_eq!(
            config_path(&args(&["--config", "cli.toml"]), Some("env.toml".into())).unwrap(),
            Some(PathBuf::from("cli.toml"))
        );
        assert!(config_path(&args(&["--verbose"]), None).is_err());
    }
}
