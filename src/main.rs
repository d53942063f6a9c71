use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walkdir::WalkDir;

use dataset_api_service::{DatasetEngine, ServiceConfig};

/// Expands directory arguments into the CSV files below them.
fn collect_inputs(args: impl Iterator<Item = String>) -> Vec<PathBuf> {
    let mut inputs = Vec::new();
    for arg in args {
        let path = PathBuf::from(arg);
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(&path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
                })
                .collect();
            found.sort();
            inputs.extend(found);
        } else {
            inputs.push(path);
        }
    }
    inputs
}

fn dataset_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dataset_api_service=debug,dataset_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Dataset API Service v{}", env!("CARGO_PKG_VERSION"));

    let config = ServiceConfig::from_env().context("Failed to load configuration")?;
    info!("Configuration loaded:");
    info!("  Database: {}", config.redacted_database_url());
    info!("  Pool size: {}", config.pool_size);
    info!("  Storage timeout: {:?}", config.storage_timeout);
    info!(
        "  Limits: {} rows, {} columns",
        config.max_rows, config.max_columns
    );

    let engine = DatasetEngine::new(config)
        .await
        .context("Failed to initialize dataset engine")?;
    engine.health_check().await.context("Database health check failed")?;
    info!("Dataset engine initialized successfully");

    for path in collect_inputs(std::env::args().skip(1)) {
        let name = dataset_name(&path);
        match engine.ingest_file(&name, &path).await {
            Ok(schema) => {
                let described = engine.describe(&schema.slug).await?;
                info!(
                    "Dataset {} ({}):\n{}",
                    described.slug,
                    described.status,
                    serde_json::to_string_pretty(&described)?
                );
                if !described.error_message.is_empty() {
                    warn!("Dataset {} failed: {}", described.slug, described.error_message);
                }
            }
            Err(e) => error!(detail = %e, "Failed to ingest {}: {}", path.display(), e.public_message()),
        }
    }

    for summary in engine.list_datasets().await? {
        info!(
            "  {} [{}] {} rows at {}",
            summary.slug, summary.status, summary.row_count, summary.api_path
        );
    }

    info!("Dataset API Service started successfully");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal, gracefully shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    info!("Dataset API Service shutdown complete");
    Ok(())
}
