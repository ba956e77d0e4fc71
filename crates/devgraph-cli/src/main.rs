//! devgraph CLI application
//!
//! Plans and executes demo tensor graphs on the simulated compute device,
//! and inspects the device configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devgraph_cli::commands::{PlanCommand, RunCommand};
use devgraph_cli::exit::{EXIT_CONFIG, EXIT_EXECUTION, EXIT_GENERIC_FAIL, EXIT_SUCCESS};
use devgraph_common::{ConfigError, DeviceConfig, ExecError};
use std::path::PathBuf;
use tracing::error;

/// devgraph - multi-stream execution of tensor graphs
#[derive(Parser)]
#[command(name = "devgraph")]
#[command(about = "Plan and execute tensor graphs across parallel command streams")]
#[command(long_about = r#"
devgraph maps host buffers onto a compute device, groups graph nodes that may
run concurrently, and dispatches each group across parallel command streams
with a barrier between groups.

Examples:
  # Show how the diamond graph is grouped
  devgraph plan --graph diamond

  # Execute the mlp graph on 8 streams and print a JSON report
  devgraph run --graph mlp --width 256 --streams 8 --format json

  # Execute one node at a time
  devgraph run --graph fanout --serial

  # Print the default configuration file
  devgraph config default > devgraph.toml
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true, default_value = "warn")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT", global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the concurrency plan for a demo graph
    Plan(PlanCommand),

    /// Execute a demo graph
    #[command(alias = "exec")]
    Run(RunCommand),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration (file, then environment)
    Show,
    /// Print the default configuration
    Default,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, &cli.log_format);

    let code = match dispatch(&cli) {
        Ok(output) => {
            print!("{output}");
            EXIT_SUCCESS
        }
        Err(e) => {
            error!("command failed: {e}");
            for cause in e.chain().skip(1) {
                error!("  caused by: {cause}");
            }
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> Result<String> {
    match &cli.command {
        Commands::Config { action: ConfigAction::Default } => {
            Ok(DeviceConfig::default_toml().context("failed to render default configuration")?)
        }
        Commands::Config { action: ConfigAction::Show } => {
            let config = load_configuration(cli)?;
            Ok(toml::to_string_pretty(&config).context("failed to serialize configuration")?)
        }
        Commands::Plan(cmd) => cmd.execute(&load_configuration(cli)?),
        Commands::Run(cmd) => cmd.execute(&load_configuration(cli)?),
    }
}

/// Load the configuration file if one was given, else start from defaults;
/// `DEVGRAPH_*` variables override either.
fn load_configuration(cli: &Cli) -> Result<DeviceConfig> {
    match &cli.config {
        Some(path) => DeviceConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => DeviceConfig::from_env().context("invalid configuration in environment"),
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else if e.downcast_ref::<ExecError>().is_some() {
        EXIT_EXECUTION
    } else {
        EXIT_GENERIC_FAIL
    }
}

/// Logs go to stderr so stdout carries only command output.
fn setup_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init(),
        "pretty" => subscriber.pretty().init(),
        _ => subscriber.compact().init(),
    }
}
