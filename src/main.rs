use clap::Parser;
use tracing_subscriber::EnvFilter;

use a3s_pipeline::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            a3s_pipeline::cli::serve::execute(&config, host, port).await?;
        }
        Commands::Validate { config } => {
            a3s_pipeline::cli::validate::execute(&config)?;
        }
    }

    Ok(())
}
