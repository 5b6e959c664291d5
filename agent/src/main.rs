//! Airbox Agent - drives a simulated sensor fleet against a live ingestion API.
//!
//! The fleet is described by a JSON configuration file that is re-read on a
//! fixed interval; boxes start, restart and stop as the file changes.

use airbox_core::{ConfigError, ConfigSource, FieldUpdate, FileConfigStore, FleetDocument, FleetSupervisor, RegistrationUpdate};
use airbox_env::TokioContext;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod http;

use http::HttpBackend;

const DEFAULT_BACKEND_BASE: &str = "http://backend:8000";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "airbox-agent")]
#[command(about = "Simulated indoor air-quality fleet", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the fleet until interrupted
    Run {
        /// Fleet configuration file
        #[arg(short, long, default_value = "config/simulation.json")]
        config: PathBuf,
    },

    /// Set or clear a box's household and registration flag
    Register {
        /// Fleet configuration file
        #[arg(short, long, default_value = "config/simulation.json")]
        config: PathBuf,

        /// Serial number of the box
        #[arg(long)]
        serial: String,

        /// New household id
        #[arg(long, conflicts_with = "clear_house_id")]
        house_id: Option<String>,

        #[arg(long)]
        clear_house_id: bool,

        /// New registration flag
        #[arg(long, conflicts_with = "clear_registered")]
        registered: Option<bool>,

        #[arg(long)]
        clear_registered: bool,
    },
}

/// File-backed source that also steers the backend to the document's `server_url`.
struct AgentSource {
    store: FileConfigStore,
    backend: Arc<HttpBackend>,
    default_base: String,
}

#[async_trait]
impl ConfigSource for AgentSource {
    async fn load(&self) -> Result<FleetDocument, ConfigError> {
        let document = self.store.load().await?;
        let base = document.server_url.as_deref().filter(|url| !url.trim().is_empty());
        self.backend.set_base_url(base.unwrap_or(&self.default_base));
        Ok(document)
    }
}

fn field_update<T: Into<serde_json::Value>>(value: Option<T>, clear: bool, flag: &str) -> Result<FieldUpdate> {
    match (value, clear) {
        (Some(value), false) => Ok(FieldUpdate::set(value)),
        (None, true) => Ok(FieldUpdate::clear()),
        _ => bail!("exactly one of --{flag} or --clear-{flag} is required"),
    }
}

fn poll_interval() -> Duration {
    let secs = std::env::var("SIMULATION_CONFIG_POLL_INTERVAL")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    Duration::from_secs(secs)
}

async fn run(config: PathBuf) -> Result<()> {
    let default_base = std::env::var("BACKEND_BASE").unwrap_or_else(|_| DEFAULT_BACKEND_BASE.to_string());
    let interval = poll_interval();
    info!(config = %config.display(), backend = %default_base, interval_s = interval.as_secs(), "Starting fleet");

    let backend = Arc::new(HttpBackend::new(&default_base));
    let source = AgentSource {
        store: FileConfigStore::new(config),
        backend: backend.clone(),
        default_base,
    };
    let mut supervisor = FleetSupervisor::new(TokioContext::shared(), backend);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "Cannot listen for interrupts"),
        }
        let _ = shutdown_tx.send(true);
    });

    supervisor.poll_forever(&source, interval, shutdown_rx).await;
    Ok(())
}

async fn register(config: PathBuf, update: RegistrationUpdate) -> Result<()> {
    let store = FileConfigStore::new(config.clone());
    let outcome = store
        .update_registration(&update)
        .await
        .with_context(|| format!("updating {}", config.display()))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::Register {
            config,
            serial,
            house_id,
            clear_house_id,
            registered,
            clear_registered,
        } => {
            let update = RegistrationUpdate {
                serial_number: serial,
                house_id: field_update(house_id, clear_house_id, "house-id")?,
                registered: field_update(registered, clear_registered, "registered")?,
            };
            register(config, update).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_update_flags() {
        assert_eq!(field_update(Some("H1"), false, "house-id").unwrap(), FieldUpdate::set("H1"));
        assert_eq!(field_update::<bool>(None, true, "registered").unwrap(), FieldUpdate::clear());
        assert!(field_update::<bool>(None, false, "registered").is_err());
        assert!(field_update(Some(true), true, "registered").is_err());
    }

    #[tokio::test]
    async fn test_source_applies_server_url() {
        let path = std::env::temp_dir().join(format!("airbox-agent-{}.json", std::process::id()));
        let document = json!({"server_url": "http://ingest.local:9000/", "boxes": []});
        tokio::fs::write(&path, document.to_string()).await.unwrap();

        let backend = Arc::new(HttpBackend::new(DEFAULT_BACKEND_BASE));
        let source = AgentSource {
            store: FileConfigStore::new(path.clone()),
            backend: backend.clone(),
            default_base: DEFAULT_BACKEND_BASE.to_string(),
        };
        source.load().await.unwrap();
        assert_eq!(backend.base_url(), "http://ingest.local:9000");

        tokio::fs::write(&path, json!({"boxes": []}).to_string()).await.unwrap();
        source.load().await.unwrap();
        assert_eq!(backend.base_url(), DEFAULT_BACKEND_BASE);

        tokio::fs::remove_file(&path).await.ok();
    }
}
