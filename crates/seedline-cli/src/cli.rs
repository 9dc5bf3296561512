use clap::{Parser, Subcommand};
use seedline_core::ConsensusStrategy;
use std::path::PathBuf;

/// Seed-to-candidate pipeline runner
#[derive(Parser, Debug)]
#[command(name = "seedline")]
#[command(about = "Turn seed terms into validated candidate sets", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ~/.seedline/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the pipeline over configured work units
    Run {
        /// Work units to run, in order (defaults to every configured unit)
        units: Vec<String>,

        /// Explicit run id
        #[arg(long)]
        run_id: Option<String>,

        /// Directory for exported artifacts
        #[arg(short, long, default_value = "seedline-out")]
        output: PathBuf,

        /// Milliseconds between progress log lines
        #[arg(long, default_value_t = 1000)]
        progress_interval_ms: u64,
    },

    /// Run the consensus engine once over ad-hoc terms
    Validate {
        /// Terms to validate
        #[arg(required = true)]
        terms: Vec<String>,

        /// Category assigned to every term
        #[arg(long, default_value = "general")]
        category: String,

        /// Consensus strategy (defaults to the configured one)
        #[arg(long)]
        strategy: Option<ConsensusStrategy>,
    },
}
