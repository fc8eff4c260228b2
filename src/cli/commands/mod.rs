//! CLI parser and dispatch to command-specific modules.

mod ask;
mod check;
mod env_example;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "analyst")]
#[command(about = "LLM-planned data analysis service")]
#[command(version)]
pub struct Cli {
    /// TOML config file (environment variables still override it)
    #[arg(short, long, global = true, env = "ANALYST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Bind address: PORT, HOST, or HOST:PORT (default from HOST/PORT)
        bind: Option<String>,
    },

    /// Validate configuration and print a summary
    Check,

    /// Print a .env template
    EnvExample {
        /// Write the template to this path instead of stdout
        #[arg(long)]
        write: Option<PathBuf>,
    },

    /// Run one analysis locally and print the JSON outcome
    Ask {
        /// File containing the task text
        file: PathBuf,
        /// CSV files to load as tables (repeatable)
        #[arg(short, long = "attach")]
        attach: Vec<PathBuf>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The template needs no configuration.
    if let Commands::EnvExample { write } = &cli.command {
        return env_example::cmd_env_example(write.as_deref());
    }

    let settings = Settings::load(cli.config.as_deref())?;
    init_logging(&log_filter(&settings.log_level, cli.verbose));

    match cli.command {
        Commands::Serve { bind } => serve::cmd_serve(&settings, bind.as_deref()).await,
        Commands::Check => check::cmd_check(&settings),
        Commands::Ask { file, attach } => ask::cmd_ask(&settings, &file, &attach).await,
        Commands::EnvExample { .. } => Ok(()),
    }
}

/// Default filter for the configured level; `-v` forces `info`.
fn log_filter(log_level: &str, verbose: bool) -> String {
    if verbose {
        "analyst=info".to_string()
    } else {
        format!("analyst={},tower_http=warn", log_level.trim().to_lowercase())
    }
}

/// Install the subscriber. `RUST_LOG` overrides the default filter.
fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
