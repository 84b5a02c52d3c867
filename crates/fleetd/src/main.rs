//! fleetd — the fleetgrid daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run   --config fleetd.toml [--data-dir /var/lib/fleetgrid]
//! fleetd apply --config fleetd.toml --project main --fleet gpu.toml
//! fleetd plan  --config fleetd.toml --project main --run train.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;

use fleetd::FleetdConfig;
use fleetd::commands::{FleetFile, apply_fleet, load_run_spec, render_plans};
use fleetd::daemon::run_pipelines;
use fleetgrid_placement::get_job_plans;
use fleetgrid_state::{StateStore, epoch_millis};

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid daemon", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet, instance, and gateway pipelines until Ctrl-C.
    Run {
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Create or update a fleet from a TOML file.
    Apply {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        project: String,
        #[arg(long)]
        fleet: PathBuf,
    },
    /// Print job plans for a run without placing it.
    Plan {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        project: String,
        /// Run spec TOML.
        #[arg(long)]
        run: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
        Command::Apply {
            config,
            data_dir,
            project,
            fleet,
        } => {
            let config = FleetdConfig::from_file(&config)?;
            let store = open_store(&config, data_dir)?;
            let fleet = apply_fleet(&store, &project, FleetFile::from_file(&fleet)?, epoch_millis())?;
            println!("{} {}", fleet.name, fleet.id);
            Ok(())
        }
        Command::Plan {
            config,
            data_dir,
            project,
            run,
            format,
        } => {
            let config = FleetdConfig::from_file(&config)?;
            let store = open_store(&config, data_dir)?;
            let run = load_run_spec(&run)?;
            let plans = get_job_plans(
                &store,
                &config.registry(),
                &project,
                &run,
                config.placement.limits(),
            )
            .await?;
            match format {
                OutputFormat::Text => print!("{}", render_plans(&run, &plans)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
            }
            Ok(())
        }
    }
}

fn open_store(config: &FleetdConfig, data_dir: Option<PathBuf>) -> anyhow::Result<StateStore> {
    let data_dir = config.data_dir(data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(config_path: PathBuf, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    info!(config = ?config_path, "fleetd starting");
    let config = FleetdConfig::from_file(&config_path)?;
    let store = open_store(&config, data_dir)?;

    let registry = config.registry();
    if registry.is_empty() {
        info!("no backends configured, instances will not be provisioned");
    } else {
        info!(backends = ?registry.names(), "backends registered");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    run_pipelines(store, registry, &config, shutdown_rx).await?;
    info!("fleetd stopped");
    Ok(())
}
