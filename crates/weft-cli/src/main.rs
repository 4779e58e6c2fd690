//! weft command line.
//!
//! # Quick Start
//!
//! ```bash
//! # Serve on the configured address (127.0.0.1:7000 by default)
//! weft serve
//!
//! # Any free port, newline-delimited frames
//! weft serve --address 127.0.0.1:0 --delimiter '\n'
//!
//! # Show the merged configuration
//! weft config show
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::serve::ServeArgs;

/// weft - event-driven TCP frame server.
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run a line-echo server until interrupted.
    Serve {
        /// Address to bind to (port only: 7000, or full: 127.0.0.1:7000).
        #[arg(short, long)]
        address: Option<String>,

        /// Frame delimiter; accepts \r, \n, \t, \0 and \\ escapes.
        #[arg(short, long)]
        delimiter: Option<String>,

        /// Project directory holding weft.toml.
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Print prometheus metrics after shutdown.
        #[arg(long)]
        print_metrics: bool,
    },

    /// Configuration commands.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML.
    Show {
        /// Project directory holding weft.toml.
        #[arg(short, long, default_value = ".")]
        project: String,
    },

    /// Check that the configuration loads and is valid.
    Validate {
        /// Project directory holding weft.toml.
        #[arg(short, long, default_value = ".")]
        project: String,
    },
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured level.
pub(crate) fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::Serve {
            address,
            delimiter,
            project,
            print_metrics,
        } => commands::serve::run(&ServeArgs {
            project,
            address,
            delimiter,
            print_metrics,
        }),
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show { project } => commands::config::show(&project),
            ConfigCommands::Validate { project } => commands::config::validate(&project),
        },
    }
}
