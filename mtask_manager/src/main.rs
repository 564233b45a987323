use clap::{Parser, Subcommand};
use colored::*;
use mtask_core::error::MtaskResult;
use std::time::Duration;

use mtask_manager::commands;

const DEFAULT_GLOBAL_ADDRESS: &str = "127.0.0.1:7400";

#[derive(Parser)]
#[command(name = "mtask")]
#[command(about = "MTASK - global component manager and inspection tool")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a standalone global component manager
    Global {
        /// Address to listen on
        #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:7400")]
        listen: String,

        /// Timeout for outgoing connections, in milliseconds
        #[arg(long = "connect-timeout", default_value_t = 2000)]
        connect_timeout_ms: u64,
    },

    /// List processes registered with a global manager
    Processes {
        #[command(flatten)]
        target: Target,
    },

    /// List components registered with a global manager
    Components {
        #[command(flatten)]
        target: Target,

        /// Only show components of this process
        #[arg(short = 'p', long = "process")]
        process: Option<String>,

        /// Show commands, events, functions and handlers
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },

    /// List connections brokered by a global manager
    Connections {
        #[command(flatten)]
        target: Target,
    },

    /// Check that a global manager is reachable
    Ping {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Address of the global manager
    #[arg(short = 'g', long = "global", default_value = DEFAULT_GLOBAL_ADDRESS)]
    global: String,

    /// Request timeout, in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = 2000)]
    timeout_ms: u64,
}

impl Target {
    fn client(&self) -> MtaskResult<mtask_core::manager::GlobalClient> {
        commands::inspect::connect(&self.global, Duration::from_millis(self.timeout_ms))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_command(cli.command) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> MtaskResult<()> {
    match command {
        Commands::Global {
            listen,
            connect_timeout_ms,
        } => commands::global::run_global(&listen, Duration::from_millis(connect_timeout_ms)),

        Commands::Processes { target } => commands::inspect::list_processes(&target.client()?),

        Commands::Components {
            target,
            process,
            verbose,
        } => commands::inspect::list_components(&target.client()?, process.as_deref(), verbose),

        Commands::Connections { target } => {
            commands::inspect::list_connections(&target.client()?)
        }

        Commands::Ping { target } => commands::inspect::ping(&target.client()?),
    }
}
