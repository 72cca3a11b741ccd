pub mod api;
pub mod logging;
pub mod models;
pub mod processor;
pub mod reader;
pub mod schema;
pub mod services;
pub mod storage;
pub mod utils;

use common::config::{DirectoryRole, Settings};
use common::Result;
use datafusion::prelude::SessionContext;
use processor::features::read_hospitalizations;
use processor::{FeatureExporter, IndicatorProcessor, RunSummary, SessionTableRegistry};
use reader::SourceReader;
use services::IndicatorService;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::{LocalStorage, StorageManager, WrittenTable};
use tokio::net::TcpListener;
use tracing::info;
use utils::paths::{ArtifactPaths, FEATURES_FILE};

/// Runs the complete pipeline and materializes the indicator table.
pub async fn run_pipeline(settings: &Settings) -> Result<RunSummary> {
    info!(year = settings.year, output = %settings.dirs.output.display(), "Starting indicator pipeline");
    let processor = IndicatorProcessor::new(settings);
    let summary = processor.run().await?;

    for metrics in &summary.dedup {
        info!(
            table = %metrics.table,
            kept_rows = metrics.kept_rows,
            removed_rows = metrics.removed_rows,
            "Deduplication summary"
        );
    }
    Ok(summary)
}

/// Writes `features.parquet` next to the indicator table.
pub async fn export_features(settings: &Settings) -> Result<WrittenTable> {
    let paths = ArtifactPaths::new(&settings.dirs.output);
    let artifact = paths.indicator_table();
    let hospitalizations = match settings.dirs.path(DirectoryRole::Hospitalizations) {
        Some(dir) => Some(read_hospitalizations(
            &SourceReader::new(settings.reader.clone()),
            dir,
        )?),
        None => None,
    };

    let exporter = FeatureExporter::new(Arc::new(SessionContext::new()), Arc::new(SessionTableRegistry));
    let df = exporter.features(&artifact, hospitalizations).await?;
    let schema = Arc::new(df.schema().as_arrow().clone());
    let batches = df.collect().await?;

    let written = StorageManager::new(Arc::new(LocalStorage::new(&settings.dirs.output)))
        .write_table(schema, &batches, FEATURES_FILE)
        .await?;
    info!(path = %paths.features().display(), columns = written.columns.len(), "Feature table written");
    Ok(written)
}

/// Serves the read-only API over the last materialized artifact.
pub async fn serve(settings: &Settings) -> Result<()> {
    let service = Arc::new(IndicatorService::new(settings).await?);
    let api_router = api::routes(service);

    let addr = SocketAddr::from(([127, 0, 0, 1], settings.api.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Indicator API listening");
    axum::serve(listener, api_router).await?;

    Ok(())
}
