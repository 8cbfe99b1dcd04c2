//! objsim
//!
//! Runs a fleet of simulated devices with the scenario dispatcher and the
//! metrics recorder, and manages the stores they use.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use objsim::app::{launch, seed_scenarios, Stores};
use objsim::config::{SimConfig, DEFAULT_CONFIG_FILE};
use objsim::objsim_runtime::ServiceManager;
use objsim::registry::FieldSource;
use objsim::scenario::load_file;
use objsim::store::MetricValue;
use objsim::Value;

/// Simulated IoT devices on a topic bus
#[derive(Parser, Debug)]
#[command(name = "objsim")]
#[command(about = "Simulated IoT devices on a topic bus", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the recorder, the dispatcher and the configured devices
    Run {
        /// Publish this scenario id once everything is up
        #[arg(long)]
        trigger: Option<u32>,
    },

    /// Manage stored scenarios
    Scenarios {
        #[command(subcommand)]
        action: ScenarioAction,
    },

    /// Manage stored device descriptions
    Devices {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// Print recorded points of one measurement (a device type)
    Metrics {
        measurement: String,

        /// How far back to look
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Maximum number of points
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand, Debug)]
enum ScenarioAction {
    /// List stored scenarios
    List,
    /// Import scenarios from a JSON file
    Import { file: PathBuf },
    /// Store the built-in scenarios that are missing
    Seed,
    /// Remove every scenario
    Clear,
}

#[derive(Subcommand, Debug)]
enum DeviceAction {
    /// List stored device descriptions
    List,
    /// Remove every device description
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("objsim=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = SimConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let stores = Stores::open(&config.store).context("opening store")?;

    match args.command {
        Command::Run { trigger } => run(&config, &stores, trigger).await,
        Command::Scenarios { action } => scenarios(&config, &stores, action),
        Command::Devices { action } => devices(&stores, action),
        Command::Metrics {
            measurement,
            hours,
            limit,
        } => metrics(&stores, &measurement, hours, limit),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: &SimConfig, stores: &Stores, trigger: Option<u32>) -> Result<()> {
    info!("Starting objsim v{}", env!("CARGO_PKG_VERSION"));

    let manager = ServiceManager::with_capacity(config.bus.capacity);
    let devices = launch(config, &manager, stores).await?;

    for (id, state) in manager.list() {
        info!("  - {} ({:?})", id, state);
    }

    if let Some(id) = trigger {
        info!(scenario = id, "Triggering scenario");
        manager.emit(config.dispatcher.control_topic.as_str(), id.to_string(), "cli")?;
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(devices = devices.len(), "Shutting down");

    if let Err(e) = manager.shutdown_all().await {
        warn!("Shutdown incomplete: {}", e);
    }
    Ok(())
}

fn scenarios(config: &SimConfig, stores: &Stores, action: ScenarioAction) -> Result<()> {
    let store = stores.documents.as_ref();
    match action {
        ScenarioAction::List => {
            for scenario in store.list_scenarios()? {
                println!(
                    "{:>4}  {:<16} {} entries",
                    scenario.scenario_id,
                    scenario.scenario_name,
                    scenario.configs.len()
                );
            }
        }
        ScenarioAction::Import { file } => {
            let imported = load_file(&file).with_context(|| format!("reading {}", file.display()))?;
            for scenario in &imported {
                store.put_scenario(scenario)?;
            }
            println!("Imported {} scenarios", imported.len());
        }
        ScenarioAction::Seed => {
            let mut dispatcher = config.dispatcher.clone();
            dispatcher.seed_builtin = true;
            dispatcher.scenario_file = None;
            let written = seed_scenarios(&dispatcher, store)?;
            println!("Stored {} scenarios", written);
        }
        ScenarioAction::Clear => {
            println!("Removed {} scenarios", store.clear_scenarios()?);
        }
    }
    Ok(())
}

fn devices(stores: &Stores, action: DeviceAction) -> Result<()> {
    let store = stores.documents.as_ref();
    match action {
        DeviceAction::List => {
            for (id, description) in store.list_descriptions()? {
                println!(
                    "{}  {}  modified {}",
                    id,
                    description.identity,
                    description.last_modified.to_rfc3339()
                );
                for (name, parameter) in &description.config {
                    println!("    config {:<20} {}", name, parameter.value);
                }
                for (name, field) in &description.fields {
                    let value = match field.source {
                        FieldSource::Computed => "(computed)".to_string(),
                        FieldSource::Stored => field.value.clone().unwrap_or(Value::Empty).to_string(),
                    };
                    println!("    field  {:<20} {}", name, value);
                }
            }
        }
        DeviceAction::Clear => {
            println!("Removed {} device descriptions", store.clear_descriptions()?);
        }
    }
    Ok(())
}

fn metrics(stores: &Stores, measurement: &str, hours: i64, limit: Option<usize>) -> Result<()> {
    let end = Utc::now();
    let start = end - chrono::Duration::hours(hours);
    for point in stores.metrics.query_points(measurement, start, end, limit)? {
        let value = match point.value {
            MetricValue::Number(n) => n.to_string(),
            MetricValue::Text(s) => s,
        };
        println!(
            "{}  {}/{}/{}/{}  {} = {}",
            point.timestamp.to_rfc3339(),
            point.tags.building,
            point.tags.floor,
            point.tags.room,
            point.tags.object_name,
            point.tags.field_name,
            value
        );
    }
    Ok(())
}
