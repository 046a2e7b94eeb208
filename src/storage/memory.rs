//! In-process backend with the same commit/rollback guarantees as Postgres.
//!
//! Device upserts apply immediately under the shared lock (they are idempotent);
//! samples are staged in the transaction and only appended on commit.

use super::{HistoryPoint, HistoryQuery, Storage, StorageError, StorageResult, StorageTx};
use crate::telemetry::SharedEvent;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoredDevice {
    pub id: i64,
    pub device_uid: String,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct StoredSample {
    pub device_id: i64,
    pub event: SharedEvent,
    pub source: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_device_id: i64,
    devices: HashMap<String, StoredDevice>,
    samples: Vec<StoredSample>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_upserts: AtomicBool,
    fail_inserts: AtomicBool,
    fail_commits: AtomicBool,
    commit_delay_ms: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<FaultPlan>,
    closed: Arc<AtomicBool>,
    upserts: Arc<AtomicU64>,
    commits: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self, device_uid: &str) -> Option<StoredDevice> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.devices.get(device_uid).cloned())
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().map(|s| s.devices.len()).unwrap_or(0)
    }

    pub fn samples(&self) -> Vec<StoredSample> {
        self.state
            .lock()
            .map(|s| s.samples.clone())
            .unwrap_or_default()
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().map(|s| s.samples.len()).unwrap_or(0)
    }

    /// Storage round trips spent on device upserts.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.faults.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.faults.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.faults.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes every commit sleep first, to simulate a slow database.
    pub fn delay_commits(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn lock_state(&self) -> StorageResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory storage lock poisoned".into()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn begin(&self) -> StorageResult<Box<dyn StorageTx>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryTx {
            storage: self.clone(),
            staged: Vec::new(),
        }))
    }

    async fn fetch_history(&self, query: &HistoryQuery) -> StorageResult<Vec<HistoryPoint>> {
        self.ensure_open()?;
        let state = self.lock_state()?;
        let Some(device) = state.devices.get(&query.device_uid) else {
            return Ok(Vec::new());
        };
        let mut matching: Vec<&StoredSample> = state
            .samples
            .iter()
            .filter(|s| s.device_id == device.id && query.contains(s.event.ts))
            .collect();
        matching.sort_by_key(|s| s.event.ts);
        let skip = matching
            .len()
            .saturating_sub(query.effective_limit() as usize);
        Ok(matching
            .into_iter()
            .skip(skip)
            .map(|s| HistoryPoint {
                ts: s.event.ts,
                metrics: s.event.metrics.clone(),
                quality: (!s.event.quality.is_empty()).then(|| s.event.quality.clone()),
            })
            .collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTx {
    storage: MemoryStorage,
    staged: Vec<StoredSample>,
}

#[async_trait]
impl StorageTx for MemoryTx {
    async fn upsert_device(
        &mut self,
        device_uid: &str,
        metadata: Option<&JsonValue>,
    ) -> StorageResult<i64> {
        self.storage.ensure_open()?;
        self.storage.upserts.fetch_add(1, Ordering::Relaxed);
        if self.storage.faults.fail_upserts.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected upsert failure".into()));
        }

        let mut state = self.storage.lock_state()?;
        let metadata = metadata.filter(|meta| !meta.is_null()).cloned();
        if let Some(existing) = state.devices.get_mut(device_uid) {
            if metadata.is_some() {
                existing.metadata = metadata;
            }
            return Ok(existing.id);
        }

        state.next_device_id += 1;
        let device = StoredDevice {
            id: state.next_device_id,
            device_uid: device_uid.to_string(),
            metadata,
        };
        let id = device.id;
        state.devices.insert(device_uid.to_string(), device);
        Ok(id)
    }

    async fn insert_samples(
        &mut self,
        device_id: i64,
        events: &[SharedEvent],
        source: &str,
    ) -> StorageResult<u64> {
        self.storage.ensure_open()?;
        if self.storage.faults.fail_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected insert failure".into()));
        }
        self.staged.extend(events.iter().map(|event| StoredSample {
            device_id,
            event: event.clone(),
            source: source.to_string(),
        }));
        Ok(events.len() as u64)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let delay_ms = self.storage.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        self.storage.ensure_open()?;
        if self.storage.faults.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected commit failure".into()));
        }
        let MemoryTx { storage, staged } = *self;
        storage.lock_state()?.samples.extend(staged);
        storage.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
