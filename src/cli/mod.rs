pub mod serve;
pub mod validate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A3S Pipeline - Event ingestion, buffering and remediation
#[derive(Debug, Parser)]
#[command(name = "a3s-pipeline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline and its HTTP ingress
    Serve {
        /// Path to the pipeline TOML file
        #[arg(long, short)]
        config: PathBuf,

        /// Override the configured host address
        #[arg(long)]
        host: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Check a configuration file and print the pipeline it describes
    Validate {
        /// Path to the pipeline TOML file
        #[arg(long, short)]
        config: PathBuf,
    },
}
