use anyhow::{bail, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::writer::WriterConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unsupported STORAGE_BACKEND {other:?} (expected postgres or memory)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub device_cache_size: usize,
    pub max_inflight_flushes: usize,
    pub shutdown_timeout_ms: u64,
    pub subscriber_capacity: usize,
    pub source: String,
    pub sim_device_id: String,
    pub sim_interval_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let parsed = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        let storage_backend = match var("STORAGE_BACKEND") {
            Some(value) => value.parse::<StorageBackend>()?,
            None => StorageBackend::Postgres,
        };

        let database_url = var("PIPELINE_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .map(normalize_database_url);
        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            bail!("PIPELINE_DATABASE_URL or DATABASE_URL is required for the postgres backend");
        }

        let db_pool_size = var("DB_POOL_SIZE")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let batch_size = parsed("DB_WRITE_BATCH_SIZE")
            .filter(|v| *v > 0)
            .unwrap_or(200) as usize;
        let flush_interval_ms = parsed("DB_WRITE_FLUSH_MS").unwrap_or(200);
        let max_queue = parsed("DB_QUEUE_MAXSIZE")
            .filter(|v| *v > 0)
            .unwrap_or(20_000) as usize;
        let device_cache_size = parsed("DB_DEVICE_CACHE_SIZE").unwrap_or(5000) as usize;
        let max_inflight_flushes = parsed("DB_MAX_INFLIGHT_FLUSHES")
            .filter(|v| *v > 0)
            .unwrap_or(1) as usize;
        let shutdown_timeout_ms = parsed("SHUTDOWN_TIMEOUT_MS").unwrap_or(5000);
        let subscriber_capacity = parsed("BUS_SUBSCRIBER_CAPACITY")
            .filter(|v| *v > 0)
            .unwrap_or(200) as usize;

        let source = var("SERIAL_MODE").unwrap_or_else(|| "simulator".to_string());
        let sim_device_id = var("SIM_DEVICE_ID").unwrap_or_else(|| "board-01".to_string());
        let sim_interval_ms = parsed("SIM_INTERVAL_MS").unwrap_or(300);
        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            storage_backend,
            database_url,
            db_pool_size,
            batch_size,
            flush_interval_ms,
            max_queue,
            device_cache_size,
            max_inflight_flushes,
            shutdown_timeout_ms,
            subscriber_capacity,
            source,
            sim_device_id,
            sim_interval_ms,
            otlp_endpoint,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn sim_interval(&self) -> Duration {
        Duration::from_millis(self.sim_interval_ms)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval(),
            queue_capacity: self.max_queue,
            max_inflight_flushes: self.max_inflight_flushes,
            shutdown_timeout: self.shutdown_timeout(),
            source: self.source.clone(),
        }
    }
}

pub fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
