//! Command-line interface for PrintFleet.

mod fleet;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use printfleet_core::{ConnectionState, EventBus, FleetEvent, SharedEventBus, SharedSettings};
use printfleet_devices::{PrinterAdapter, PrinterRegistry, RegistryOutcome, StatusSync};
use tracing::{debug, info, warn};

use crate::fleet::FleetFile;

/// PrintFleet - keep a fleet of 3D printers connected.
#[derive(Parser, Debug)]
#[command(name = "printfleet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Connect every printer in the fleet and log events until Ctrl-C.
    Run {
        /// Fleet file (TOML).
        #[arg(short, long)]
        fleet: PathBuf,
    },
    /// Validate a fleet file without connecting.
    Check {
        /// Fleet file (TOML).
        #[arg(short, long)]
        fleet: PathBuf,
    },
    /// Connect one printer, print its version and status, then disconnect.
    Probe {
        /// Fleet file (TOML).
        #[arg(short, long)]
        fleet: PathBuf,
        /// Printer id.
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run { fleet } => run(FleetFile::load(&fleet)?).await,
        Command::Check { fleet } => check(FleetFile::load(&fleet)?),
        Command::Probe { fleet, id } => probe(FleetFile::load(&fleet)?, &id).await,
    }
}

fn init_logging(verbose: bool) {
    // JSON output for container environments
    let json_logging = std::env::var("PRINTFLEET_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "printfleet=debug" } else { "printfleet=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

async fn run(fleet: FleetFile) -> Result<()> {
    let bus: SharedEventBus = Arc::new(EventBus::with_name("printfleet"));
    let settings = SharedSettings::new(fleet.settings.clone());

    let logger = tokio::spawn(log_events(bus.clone()));
    let sync = StatusSync::new(bus.clone(), settings.clone());
    sync.start();

    let registry = PrinterRegistry::new(bus.clone(), settings);
    info!(printers = fleet.printers.len(), "Loading fleet");
    for (id, result) in registry.load_fleet(fleet.printers).await {
        if let Err(e) = result {
            warn!(device_id = %id, "Printer not started: {}", e);
        }
    }
    info!(connected = registry.len().await, "Fleet running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    registry.shutdown().await;
    sync.stop().await;
    logger.abort();
    Ok(())
}

/// Log every fleet event at a level matching its weight.
async fn log_events(bus: SharedEventBus) {
    let mut rx = bus.subscribe();
    while let Some((event, _meta)) = rx.recv().await {
        match event {
            FleetEvent::ConnectionStateChanged {
                device_id,
                previous,
                state,
                ..
            } => info!(device_id = %device_id, %previous, %state, "Connection state"),
            FleetEvent::PrinterStateChanged {
                device_id,
                socket_state,
                api_state,
                ..
            } => debug!(device_id = %device_id, ?socket_state, ?api_state, "Printer state"),
            FleetEvent::CurrentStatus { device_id, status } => {
                debug!(device_id = %device_id, state = %status.state_text, "Status")
            }
            FleetEvent::Lifecycle {
                device_id,
                kind,
                reason,
                ..
            } => warn!(device_id = %device_id, kind = kind.as_str(), "{}", reason),
            FleetEvent::PrinterRemoved { device_id, .. } => {
                info!(device_id = %device_id, "Printer removed")
            }
            FleetEvent::StatusSync {
                updated, deleted, ..
            } => info!(
                updated = updated.len(),
                deleted = deleted.len(),
                "Status sync"
            ),
        }
    }
}

fn check(fleet: FleetFile) -> Result<()> {
    let problems = fleet.problems();
    for printer in &fleet.printers {
        match problems.iter().find(|(id, _)| *id == printer.id) {
            Some((_, problem)) => println!("✗ {} ({}): {}", printer.id, printer.protocol(), problem),
            None if !printer.enabled => {
                println!("- {} ({}): disabled", printer.id, printer.protocol())
            }
            None => println!("✓ {} ({})", printer.id, printer.protocol()),
        }
    }
    if !problems.is_empty() {
        bail!("{} of {} printers have problems", problems.len(), fleet.printers.len());
    }
    println!("{} printers OK", fleet.printers.len());
    Ok(())
}

/// Register one printer in a private registry, report on it, then delete it.
async fn probe(fleet: FleetFile, id: &str) -> Result<()> {
    let record = fleet
        .printer(id)
        .with_context(|| format!("No printer {:?} in fleet file", id))?
        .clone();
    let protocol = record.protocol();
    let registry = PrinterRegistry::new(
        Arc::new(EventBus::with_name("probe")),
        SharedSettings::new(fleet.settings),
    );

    if registry.on_created(record).await? == RegistryOutcome::Skipped {
        bail!("{} ({}) is disabled", id, protocol);
    }

    let result = async {
        let adapter = registry
            .get(id)
            .await
            .with_context(|| format!("{} was not registered", id))?;
        let state = adapter.connection_state();
        if state != ConnectionState::Connected {
            bail!("{} did not connect (state: {})", id, state);
        }
        let version = adapter.get_version().await?;
        println!("{} ({}) version {}", id, protocol, version);
        let sub_state = serde_json::to_string_pretty(&adapter.sub_state())?;
        println!("{}", sub_state);
        anyhow::Ok(())
    }
    .await;

    registry.on_deleted(id).await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET: &str = r#"
[settings]
octoprint_enabled = false

[[printers]]
id = "mk4"
enabled = false

[printers.login]
protocol = "prusaLink"
printerUrl = "127.0.0.1:9"
username = "maker"
password = "secret"

[[printers]]
id = "octopi"

[printers.login]
protocol = "octoprint"
printerUrl = "127.0.0.1:9"
apiKey = "key"
"#;

    #[tokio::test]
    async fn test_unknown_printer_is_reported() {
        let fleet = FleetFile::parse(FLEET).unwrap();
        let err = probe(fleet, "x1c").await.unwrap_err();
        assert!(err.to_string().contains("No printer"));
    }

    #[tokio::test]
    async fn test_disabled_printer_is_refused() {
        let fleet = FleetFile::parse(FLEET).unwrap();
        let err = probe(fleet, "mk4").await.unwrap_err();
        assert!(err.to_string().contains("disabled"), "{}", err);
    }

    #[tokio::test]
    async fn test_disabled_protocol_is_refused() {
        let fleet = FleetFile::parse(FLEET).unwrap();
        let err = probe(fleet, "octopi").await.unwrap_err();
        assert!(err.to_string().contains("disabled"), "{}", err);
    }
}
