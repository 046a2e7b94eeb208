use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_pipeline::bus::EventBus;
use telemetry_pipeline::config::{Config, StorageBackend};
use telemetry_pipeline::simulator::TelemetrySimulator;
use telemetry_pipeline::storage::memory::MemoryStorage;
use telemetry_pipeline::storage::postgres::PgStorage;
use telemetry_pipeline::storage::Storage;
use telemetry_pipeline::IngestionPipeline;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_pipeline=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telemetry-pipeline"),
            ])))
            .install_batch(Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn build_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.storage_backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; telemetry will not survive a restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("database url missing for postgres backend")?;
            Ok(Arc::new(PgStorage::connect(url, config.db_pool_size).await?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let storage = build_storage(&config).await?;
    let pipeline = IngestionPipeline::new(
        storage,
        EventBus::new(config.subscriber_capacity),
        config.writer_config(),
        config.device_cache_size,
    );
    pipeline.start().await;
    pipeline.spawn_source(Box::new(TelemetrySimulator::new(
        config.sim_device_id.clone(),
        config.sim_interval(),
    )));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    pipeline.stop().await;
    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}
