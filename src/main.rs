//! sfn - stream-function processor
//!
//! Accepts sources and stream functions over QUIC and routes their data along
//! a configured workflow.

use sfn_core::WorkflowConfig;
use sfn_server::{Config, Processor};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if SFN_CONFIG is set, then env overrides)
    let config_path = std::env::var("SFN_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    // Load auth secrets from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    let Some(workflow_path) = config.workflow.clone() else {
        tracing::error!("No workflow configured (set SFN_WORKFLOW or `workflow` in SFN_CONFIG)");
        return Err("no workflow configured".into());
    };
    let workflow = WorkflowConfig::from_file(&workflow_path).map_err(|e| {
        tracing::error!("Invalid workflow {}: {}", workflow_path.display(), e);
        e
    })?;

    tracing::info!("Starting sfn processor '{}'", workflow.name);
    tracing::info!("  Listen address: {}", workflow.listen_addr());
    tracing::info!("  Functions: {}", workflow.function_names().join(" -> "));
    for downstream in &workflow.downstreams {
        tracing::info!("  Downstream: {} ({})", downstream.name, downstream.addr());
    }
    tracing::info!("  Authentication: {}", config.auth.mode);
    if config.tls.dev_mode {
        tracing::warn!("  TLS: dev mode (self-signed certificate)");
    } else {
        tracing::info!("  TLS: enabled");
    }
    if config.metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
    }

    let processor = Arc::new(Processor::start(workflow, config).await?);

    // Spawn shutdown signal handler
    let shutdown_processor = processor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping processor...");
        shutdown_processor.shutdown();
    });

    // Run processor (blocks until shutdown)
    processor.run().await?;

    tracing::info!("Processor stopped");
    Ok(())
}
