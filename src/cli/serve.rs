use crate::config::PipelineConfig;
use crate::coordinator::{PipelineCoordinator, PipelineDeps};
use crate::error::{PipelineError, Result};
use std::path::Path;

/// Execute the `serve` command: run the pipeline until Ctrl+C or SIGTERM.
pub async fn execute(config_path: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = PipelineConfig::load(config_path)?;

    // Override config with CLI arguments
    if let Some(host) = host {
        config.ingress.host = host;
    }
    if let Some(port) = port {
        config.ingress.port = port;
    }

    let bind_addr = config.ingress.bind_address();
    let drain_timeout = config.shutdown.drain_timeout();

    let deps = PipelineDeps::from_config(&config).await?;
    let pipeline = PipelineCoordinator::build(config, deps)?;
    pipeline.start().await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| PipelineError::Config(format!("Failed to bind to {bind_addr}: {e}")))?;

    println!("A3S Pipeline starting...");
    println!("Listening on http://{bind_addr}");
    println!("Press Ctrl+C to stop");
    tracing::info!("Server listening on {bind_addr}");

    axum::serve(listener, pipeline.http_routes())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = pipeline.shutdown(drain_timeout).await?;
    for (stage, stats) in &report.stages {
        if !stats.is_drained() {
            println!(
                "Stage {stage}: {} visible, {} in flight left queued",
                stats.visible, stats.in_flight
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
