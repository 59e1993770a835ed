use crate::config::{DeliverTo, PipelineConfig};
use crate::error::Result;
use std::path::Path;

/// Execute the `validate` command: parse, check and summarize a config file.
pub fn execute(config_path: &Path) -> Result<()> {
    let config = PipelineConfig::load(config_path)?;

    println!("{} is valid\n", config_path.display());

    println!("{:<24} {:<8} {:<10} DELIVERS TO", "STAGE", "WORKERS", "MAX RECV");
    for stage in &config.stages {
        let target = match &stage.deliver_to {
            DeliverTo::Stage(name) => format!("stage:{name}"),
            DeliverTo::Sink(name) => format!("sink:{name}"),
            DeliverTo::Router => "router".to_string(),
            DeliverTo::Transform(t) => format!("transform:{}", t.source),
        };
        println!(
            "{:<24} {:<8} {:<10} {}",
            stage.name, stage.workers, stage.max_receive_count, target
        );
    }

    println!("\n{:<24} TARGET", "SUBSCRIPTION");
    for sub in &config.subscriptions {
        println!("{:<24} {}", sub.name, sub.target);
    }

    println!(
        "\n{} route(s), {} sink(s), remediation {}",
        config.ingress.routes.len(),
        config.sinks.len(),
        if config.remediation.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
