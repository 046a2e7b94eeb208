//! Persistence seam for the writer and the history read path.
//!
//! A flush opens one [`StorageTx`], upserts every device it touches, inserts
//! each device's samples, and commits. A transaction dropped without
//! [`StorageTx::commit`] is rolled back, so an abandoned flush never leaves
//! half a batch behind.

pub mod memory;
pub mod postgres;

use crate::telemetry::SharedEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;

pub const DEFAULT_HISTORY_LIMIT: i64 = 2000;
pub const MAX_HISTORY_LIMIT: i64 = 20_000;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode telemetry json: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage is closed")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// One open unit of work. All calls made through it commit or roll back together.
#[async_trait]
pub trait StorageTx: Send {
    /// Atomic get-or-create keyed on the unique `device_uid`.
    ///
    /// Supplied metadata replaces what is stored; `None` keeps the existing value.
    async fn upsert_device(
        &mut self,
        device_uid: &str,
        metadata: Option<&JsonValue>,
    ) -> StorageResult<i64>;

    /// Appends `events` for one resolved device and returns the rows written.
    async fn insert_samples(
        &mut self,
        device_id: i64,
        events: &[SharedEvent],
        source: &str,
    ) -> StorageResult<u64>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn begin(&self) -> StorageResult<Box<dyn StorageTx>>;

    /// Samples for one device, oldest first, bounded by `query.limit`.
    async fn fetch_history(&self, query: &HistoryQuery) -> StorageResult<Vec<HistoryPoint>>;

    /// Releases pooled connections. Later calls fail with [`StorageError::Closed`].
    async fn close(&self);

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub device_uid: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl HistoryQuery {
    pub fn new(device_uid: impl Into<String>) -> Self {
        Self {
            device_uid: device_uid.into(),
            start: None,
            end: None,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_HISTORY_LIMIT)
    }

    pub(crate) fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map(|start| ts >= start).unwrap_or(true)
            && self.end.map(|end| ts <= end).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub ts: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub quality: Option<JsonMap<String, JsonValue>>,
}
