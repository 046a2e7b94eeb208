//! Bounded queue + single consumer loop that persists telemetry in batches.
//!
//! `submit` never waits: when the queue is full the event is dropped. The
//! consumer loop flushes when the batch reaches `batch_size` or when its oldest
//! event has waited `flush_interval`. Each flush runs in its own task inside one
//! storage transaction; a failed flush drops its whole batch.

use crate::identity::DeviceIdentityResolver;
use crate::storage::{Storage, StorageResult};
use crate::telemetry::SharedEvent;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

// Extra time `stop` allows the loop beyond its drain budget before aborting it.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub max_inflight_flushes: usize,
    pub shutdown_timeout: Duration,
    pub source: String,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval: Duration::from_millis(200),
            queue_capacity: 20_000,
            max_inflight_flushes: 1,
            shutdown_timeout: Duration::from_secs(5),
            source: "simulator".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug)]
pub struct WriterStats {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
    pub queue_depth: AtomicU64,
    pub flushed_batches: AtomicU64,
    pub failed_batches: AtomicU64,
    pub failed_rows: AtomicU64,
    pub rows_written: AtomicU64,
    pub discarded_at_shutdown: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl WriterStats {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            failed_rows: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            discarded_at_shutdown: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn dequeued(&self, count: u64) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                Some(depth.saturating_sub(count))
            });
    }

    fn record_flush(&self, len: usize, rows: u64, micros: u64) {
        self.flushed_batches.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            micros
        } else {
            (prev + micros) / 2
        };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }
}

impl Default for WriterStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

pub struct BatchingWriter {
    config: WriterConfig,
    storage: Arc<dyn Storage>,
    resolver: Arc<DeviceIdentityResolver>,
    stats: Arc<WriterStats>,
    phase: Mutex<WriterPhase>,
    sender: RwLock<Option<mpsc::Sender<SharedEvent>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl BatchingWriter {
    pub fn new(
        config: WriterConfig,
        storage: Arc<dyn Storage>,
        resolver: Arc<DeviceIdentityResolver>,
    ) -> Self {
        Self {
            config,
            storage,
            resolver,
            stats: Arc::new(WriterStats::new()),
            phase: Mutex::new(WriterPhase::Stopped),
            sender: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    pub fn resolver(&self) -> Arc<DeviceIdentityResolver> {
        self.resolver.clone()
    }

    pub fn phase(&self) -> WriterPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(WriterPhase::Stopped)
    }

    fn set_phase(&self, next: WriterPhase) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = next;
        }
    }

    pub fn queue_depth(&self) -> u64 {
        self.stats.queue_depth.load(Ordering::Relaxed)
    }

    /// Spawns the consumer loop. Does nothing unless the writer is stopped.
    pub async fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.phase() != WriterPhase::Stopped {
            return;
        }
        self.set_phase(WriterPhase::Starting);

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let consumer = ConsumerLoop {
            rx,
            cancel: cancel.clone(),
            batch_size: self.config.batch_size.max(1),
            flush_interval: self.config.flush_interval,
            max_inflight: self.config.max_inflight_flushes.max(1),
            shutdown_timeout: self.config.shutdown_timeout,
            flusher: Flusher {
                storage: self.storage.clone(),
                resolver: self.resolver.clone(),
                stats: self.stats.clone(),
                source: Arc::from(self.config.source.as_str()),
            },
            inflight: JoinSet::new(),
        };
        lifecycle.handle = Some(tokio::spawn(consumer.run()));
        lifecycle.cancel = Some(cancel);
        if let Ok(mut sender) = self.sender.write() {
            *sender = Some(tx);
        }
        self.set_phase(WriterPhase::Running);

        tracing::info!(
            batch_size = self.config.batch_size,
            flush_ms = self.config.flush_interval.as_millis() as u64,
            queue_capacity = self.config.queue_capacity,
            max_inflight_flushes = self.config.max_inflight_flushes,
            source = %self.config.source,
            backend = self.storage.backend(),
            "db writer started"
        );
    }

    /// Stops accepting events, lets the loop drain within `shutdown_timeout`, and
    /// waits for it. Never waits longer than the drain budget plus a short grace.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.phase() != WriterPhase::Running {
            return;
        }
        self.set_phase(WriterPhase::Stopping);

        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }

        if let Some(mut handle) = lifecycle.handle.take() {
            let budget = self.config.shutdown_timeout + STOP_GRACE;
            match tokio::time::timeout(budget, &mut handle).await {
                Ok(Ok(())) => tracing::info!("db writer loop finished"),
                Ok(Err(err)) => log_shutdown_join_error(&err),
                Err(_) => {
                    tracing::warn!(
                        budget_ms = budget.as_millis() as u64,
                        "db writer loop did not stop in time; aborting"
                    );
                    handle.abort();
                    if let Err(err) = handle.await {
                        log_shutdown_join_error(&err);
                    }
                }
            }
        }

        self.set_phase(WriterPhase::Stopped);
        tracing::info!(
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            dropped = self.stats.dropped.load(Ordering::Relaxed),
            discarded = self.stats.discarded_at_shutdown.load(Ordering::Relaxed),
            "db writer stopped"
        );
    }

    /// Enqueues without waiting. Returns `false` when the event was dropped.
    pub fn submit(&self, event: SharedEvent) -> bool {
        let guard = match self.sender.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(tx) = guard.as_ref() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(device_uid = %event.device_uid, "db writer not running; dropping event");
            return false;
        };

        self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(event) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(queue_depth = self.queue_depth(), "queued event");
                true
            }
            Err(TrySendError::Full(event)) => {
                self.stats.dequeued(1);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    device_uid = %event.device_uid,
                    queue_capacity = self.config.queue_capacity,
                    "db queue full; dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.stats.dequeued(1);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device_uid = %event.device_uid, "db queue closed; dropping event");
                false
            }
        }
    }
}

fn log_shutdown_join_error(err: &JoinError) {
    if err.is_cancelled() {
        tracing::info!("db writer cancelled cleanly");
    } else {
        tracing::error!(error = %err, "db writer loop failed during shutdown");
    }
}

enum Step {
    Shutdown,
    FlushDone(Result<(), JoinError>),
    Received(SharedEvent),
    Deadline,
    Closed,
}

struct ConsumerLoop {
    rx: mpsc::Receiver<SharedEvent>,
    cancel: CancellationToken,
    batch_size: usize,
    flush_interval: Duration,
    max_inflight: usize,
    shutdown_timeout: Duration,
    flusher: Flusher,
    inflight: JoinSet<()>,
}

async fn next_event(rx: &mut mpsc::Receiver<SharedEvent>, deadline: Option<Instant>) -> Step {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => Step::Received(event),
            Ok(None) => Step::Closed,
            Err(_) => Step::Deadline,
        },
        None => match rx.recv().await {
            Some(event) => Step::Received(event),
            None => Step::Closed,
        },
    }
}

impl ConsumerLoop {
    async fn run(mut self) {
        let mut batch: Vec<SharedEvent> = Vec::with_capacity(self.batch_size);
        // The time budget starts when the first event lands in an empty batch.
        let mut batch_started: Option<Instant> = None;

        loop {
            let deadline = batch_started.map(|started| started + self.flush_interval);
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Shutdown,
                Some(res) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    Step::FlushDone(res)
                }
                step = next_event(&mut self.rx, deadline) => step,
            };

            match step {
                Step::Shutdown | Step::Closed => break,
                Step::FlushDone(res) => {
                    finish_flush(res);
                    continue;
                }
                Step::Received(event) => {
                    self.flusher.stats.dequeued(1);
                    if batch.is_empty() {
                        batch_started = Some(Instant::now());
                    }
                    batch.push(event);
                }
                Step::Deadline => {}
            }

            let due = batch_started
                .map(|started| started.elapsed() >= self.flush_interval)
                .unwrap_or(false);
            if !batch.is_empty() && (batch.len() >= self.batch_size || due) {
                let ready = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                batch_started = None;
                if let Some(unsent) = self.dispatch(ready).await {
                    batch = unsent;
                    break;
                }
            }
        }

        self.drain(batch).await;
    }

    /// Hands `batch` to a flush task, first waiting for a free slot. Gives the
    /// batch back if shutdown starts while waiting.
    async fn dispatch(&mut self, batch: Vec<SharedEvent>) -> Option<Vec<SharedEvent>> {
        while self.inflight.len() >= self.max_inflight {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(batch),
                res = self.inflight.join_next() => res,
            };
            if let Some(res) = joined {
                finish_flush(res);
            }
        }
        self.spawn_flush(batch);
        None
    }

    fn spawn_flush(&mut self, batch: Vec<SharedEvent>) {
        let flusher = self.flusher.clone();
        let queue_depth = self.rx.len();
        // Created outside the task so a flush aborted before its first poll is still accounted.
        let guard = FlushGuard::new(&self.flusher, batch.len());
        let span = tracing::info_span!(
            "flush",
            flush_id = %Uuid::new_v4(),
            batch_size = batch.len()
        );
        self.inflight
            .spawn(async move { flusher.flush(batch, queue_depth, guard).await }.instrument(span));
    }

    async fn drain(mut self, mut batch: Vec<SharedEvent>) {
        let deadline = Instant::now() + self.shutdown_timeout;
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            self.flusher.stats.dequeued(1);
            batch.push(event);
        }

        let mut chunks: VecDeque<Vec<SharedEvent>> = VecDeque::new();
        let mut pending = batch.into_iter().peekable();
        while pending.peek().is_some() {
            chunks.push_back(pending.by_ref().take(self.batch_size).collect());
        }
        if !chunks.is_empty() {
            tracing::info!(batches = chunks.len(), "flushing queued telemetry before shutdown");
        }

        while !chunks.is_empty() && Instant::now() < deadline {
            if self.inflight.len() >= self.max_inflight {
                match tokio::time::timeout_at(deadline, self.inflight.join_next()).await {
                    Ok(Some(res)) => finish_flush(res),
                    Ok(None) => {}
                    Err(_) => break,
                }
                continue;
            }
            if let Some(chunk) = chunks.pop_front() {
                self.spawn_flush(chunk);
            }
        }

        let discarded: usize = chunks.iter().map(Vec::len).sum();
        if discarded > 0 {
            self.flusher
                .stats
                .discarded_at_shutdown
                .fetch_add(discarded as u64, Ordering::Relaxed);
            tracing::warn!(discarded, "shutdown budget exhausted; discarding queued telemetry");
        }

        let settled = tokio::time::timeout_at(deadline, async {
            while let Some(res) = self.inflight.join_next().await {
                finish_flush(res);
            }
        })
        .await;
        if settled.is_err() {
            let abandoned = self.inflight.len();
            self.inflight.abort_all();
            while let Some(res) = self.inflight.join_next().await {
                finish_flush(res);
            }
            tracing::warn!(abandoned, "abandoned in-flight flushes at shutdown");
        }
    }
}

fn finish_flush(res: Result<(), JoinError>) {
    if let Err(err) = res {
        if err.is_cancelled() {
            tracing::debug!("flush task cancelled");
        } else {
            tracing::error!(error = %err, "flush task panicked");
        }
    }
}

/// Group `batch` by device uid, keeping first-seen device order and per-device event order.
pub fn group_by_device(batch: &[SharedEvent]) -> Vec<(&str, Vec<SharedEvent>)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<(&str, Vec<SharedEvent>)> = Vec::new();
    for event in batch {
        let uid = event.device_uid.as_str();
        match index.get(uid) {
            Some(&slot) => groups[slot].1.push(event.clone()),
            None => {
                index.insert(uid, groups.len());
                groups.push((uid, vec![event.clone()]));
            }
        }
    }
    groups
}

#[derive(Clone)]
struct Flusher {
    storage: Arc<dyn Storage>,
    resolver: Arc<DeviceIdentityResolver>,
    stats: Arc<WriterStats>,
    source: Arc<str>,
}

/// Tracks one flush from spawn to completion. Dropped before it settles (the task
/// was aborted) it counts the batch as discarded. Dropped without `committed` it
/// forgets the ids the flush learned, since its transaction rolled back.
struct FlushGuard {
    stats: Arc<WriterStats>,
    resolver: Arc<DeviceIdentityResolver>,
    len: usize,
    learned: Vec<String>,
    committed: bool,
    settled: bool,
}

impl FlushGuard {
    fn new(flusher: &Flusher, len: usize) -> Self {
        flusher.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
        Self {
            stats: flusher.stats.clone(),
            resolver: flusher.resolver.clone(),
            len,
            learned: Vec::new(),
            committed: false,
            settled: false,
        }
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);
        if !self.committed {
            self.resolver.forget(self.learned.iter().map(String::as_str));
        }
        if !self.settled {
            self.stats
                .discarded_at_shutdown
                .fetch_add(self.len as u64, Ordering::Relaxed);
            tracing::debug!(batch_size = self.len, "in-flight batch discarded");
        }
    }
}

impl Flusher {
    async fn flush(&self, batch: Vec<SharedEvent>, queue_depth: usize, mut guard: FlushGuard) {
        let started = std::time::Instant::now();
        let len = batch.len();

        let result = self.write(&batch, &mut guard.learned).await;
        guard.committed = result.is_ok();
        guard.settled = true;
        match result {
            Ok(rows) => {
                let micros = started.elapsed().as_micros() as u64;
                self.stats.record_flush(len, rows, micros);
                tracing::debug!(
                    rows,
                    batch_size = len,
                    elapsed_ms = micros / 1000,
                    queue_depth,
                    "telemetry batch written"
                );
            }
            Err(err) => {
                self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.stats.failed_rows.fetch_add(len as u64, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(
                    error = %err,
                    batch_size = len,
                    queue_depth,
                    "telemetry batch write failed; dropping batch"
                );
            }
        }
    }

    async fn write(&self, batch: &[SharedEvent], learned: &mut Vec<String>) -> StorageResult<u64> {
        let groups = group_by_device(batch);
        let mut tx = self.storage.begin().await?;
        let mut total = 0u64;
        for (device_uid, events) in &groups {
            let (device_id, fetched) = self.resolver.resolve_tracked(tx.as_mut(), device_uid).await?;
            if fetched {
                learned.push(device_uid.to_string());
            }
            total += tx.insert_samples(device_id, events, &self.source).await?;
        }
        tx.commit().await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::telemetry::TelemetryEvent;
    use serde_json::Map as JsonMap;
    use std::collections::BTreeMap;

    fn event(device_uid: &str, seq: i64) -> SharedEvent {
        TelemetryEvent::new(
            Utc::now(),
            device_uid,
            BTreeMap::from([("seq".to_string(), seq as f64)]),
            JsonMap::new(),
        )
        .into_shared()
    }

    fn writer_with(storage: &MemoryStorage, config: WriterConfig) -> BatchingWriter {
        BatchingWriter::new(
            config,
            Arc::new(storage.clone()),
            Arc::new(DeviceIdentityResolver::new(64)),
        )
    }

    fn config(batch_size: usize, flush_ms: u64) -> WriterConfig {
        WriterConfig {
            batch_size,
            flush_interval: Duration::from_millis(flush_ms),
            queue_capacity: 1000,
            max_inflight_flushes: 1,
            shutdown_timeout: Duration::from_millis(500),
            source: "test".to_string(),
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cond()
    }

    fn seqs(storage: &MemoryStorage) -> Vec<i64> {
        storage
            .samples()
            .iter()
            .map(|s| s.event.metrics["seq"] as i64)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_triggers_one_flush() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(3, 10_000));
        writer.start().await;

        for seq in 1..=3 {
            assert!(writer.submit(event("board-01", seq)));
        }

        assert!(wait_until(|| storage.commit_count() == 1, Duration::from_secs(1)).await);
        assert_eq!(seqs(&storage), vec![1, 2, 3]);
        let stats = writer.stats();
        assert_eq!(stats.flushed_batches.load(Ordering::Relaxed), 1);
        assert_eq!(stats.last_batch_len.load(Ordering::Relaxed), 3);
        assert_eq!(stats.rows_written.load(Ordering::Relaxed), 3);
        assert!(storage.samples().iter().all(|s| s.source == "test"));
        writer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn time_threshold_flushes_lone_event() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(3, 100));
        writer.start().await;

        assert!(writer.submit(event("board-01", 1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.commit_count(), 0);

        assert!(wait_until(|| storage.commit_count() == 1, Duration::from_millis(200)).await);
        assert_eq!(seqs(&storage), vec![1]);
        writer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_newest_and_accounts_for_every_submit() {
        let storage = MemoryStorage::new();
        let mut cfg = config(100, 10_000);
        cfg.queue_capacity = 4;
        let writer = writer_with(&storage, cfg);
        writer.start().await;

        // No await between submits: the consumer loop cannot drain in between.
        let results: Vec<bool> = (0..10).map(|seq| writer.submit(event("d", seq))).collect();

        assert_eq!(results.iter().filter(|ok| **ok).count(), 4);
        assert!(results[..4].iter().all(|ok| *ok));
        let stats = writer.stats();
        let accepted = stats.accepted.load(Ordering::Relaxed);
        let dropped = stats.dropped.load(Ordering::Relaxed);
        assert_eq!(accepted, 4);
        assert_eq!(accepted + dropped, 10);
        assert_eq!(writer.queue_depth(), 4);

        writer.stop().await;
        assert_eq!(seqs(&storage), vec![0, 1, 2, 3]);
        assert_eq!(writer.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_groups_by_device_preserving_order() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(4, 10_000));
        writer.start().await;

        writer.submit(event("a", 1));
        writer.submit(event("b", 2));
        writer.submit(event("a", 3));
        writer.submit(event("b", 4));

        assert!(wait_until(|| storage.commit_count() == 1, Duration::from_secs(1)).await);
        assert_eq!(seqs(&storage), vec![1, 3, 2, 4]);
        let a = storage.device("a").unwrap().id;
        let b = storage.device("b").unwrap().id;
        let ids: Vec<i64> = storage.samples().iter().map(|s| s.device_id).collect();
        assert_eq!(ids, vec![a, a, b, b]);
        writer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_drops_batch_and_loop_continues() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(2, 10_000));
        writer.start().await;
        storage.fail_inserts(true);

        writer.submit(event("board-01", 1));
        writer.submit(event("board-01", 2));
        let stats = writer.stats();
        assert!(
            wait_until(
                || stats.failed_batches.load(Ordering::Relaxed) == 1,
                Duration::from_secs(1)
            )
            .await
        );
        assert_eq!(storage.sample_count(), 0);
        assert!(stats.last_error().is_some());
        assert_eq!(writer.resolver().cache().get("board-01"), None);

        storage.fail_inserts(false);
        writer.submit(event("board-01", 3));
        writer.submit(event("board-01", 4));
        assert!(wait_until(|| storage.commit_count() == 1, Duration::from_secs(1)).await);
        assert_eq!(seqs(&storage), vec![3, 4]);
        assert!(stats.last_error().is_none());
        writer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resolver_failure_discards_whole_flush() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(2, 10_000));
        writer.start().await;
        storage.fail_upserts(true);

        writer.submit(event("a", 1));
        writer.submit(event("b", 2));
        let stats = writer.stats();
        assert!(
            wait_until(
                || stats.failed_batches.load(Ordering::Relaxed) == 1,
                Duration::from_secs(1)
            )
            .await
        );
        assert_eq!(storage.sample_count(), 0);
        assert_eq!(storage.commit_count(), 0);
        writer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_storage_does_not_block_submit() {
        let storage = MemoryStorage::new();
        storage.delay_commits(Duration::from_secs(1));
        let mut cfg = config(1, 10_000);
        cfg.queue_capacity = 100;
        let writer = writer_with(&storage, cfg);
        writer.start().await;

        for seq in 0..10 {
            assert!(writer.submit(event("d", seq)));
            tokio::task::yield_now().await;
        }
        let stats = writer.stats();
        assert!(
            wait_until(
                || stats.inflight_flushes.load(Ordering::Relaxed) == 1,
                Duration::from_millis(50)
            )
            .await
        );
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 0);
        writer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_pending_batch() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(100, 10_000));
        writer.start().await;

        for seq in 0..5 {
            writer.submit(event("board-01", seq));
        }
        writer.stop().await;

        assert_eq!(writer.phase(), WriterPhase::Stopped);
        assert_eq!(seqs(&storage), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_with_backlog_is_bounded() {
        let storage = MemoryStorage::new();
        storage.delay_commits(Duration::from_secs(30));
        let mut cfg = config(2, 10_000);
        cfg.shutdown_timeout = Duration::from_millis(200);
        let writer = writer_with(&storage, cfg);
        writer.start().await;

        for seq in 0..50 {
            writer.submit(event("board-01", seq));
        }
        tokio::task::yield_now().await;

        let stopped = tokio::time::timeout(Duration::from_secs(2), writer.stop()).await;
        assert!(stopped.is_ok());
        assert_eq!(writer.phase(), WriterPhase::Stopped);
        assert_eq!(storage.sample_count(), 0);
        let stats = writer.stats();
        let accepted = stats.accepted.load(Ordering::Relaxed);
        let written = stats.rows_written.load(Ordering::Relaxed);
        let failed = stats.failed_rows.load(Ordering::Relaxed);
        let discarded = stats.discarded_at_shutdown.load(Ordering::Relaxed);
        assert_eq!(accepted, 50);
        assert_eq!(discarded, 50);
        assert_eq!(accepted, written + failed + discarded);
        assert_eq!(stats.inflight_flushes.load(Ordering::Relaxed), 0);
        // The aborted flush upserted board-01 but never committed.
        assert_eq!(writer.resolver().cache().get("board-01"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn every_accepted_event_is_accounted_for() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(4, 10_000));
        writer.start().await;

        storage.fail_inserts(true);
        for seq in 0..4 {
            writer.submit(event("board-01", seq));
        }
        let stats = writer.stats();
        assert!(
            wait_until(
                || stats.failed_batches.load(Ordering::Relaxed) == 1,
                Duration::from_secs(1)
            )
            .await
        );
        storage.fail_inserts(false);
        for seq in 4..10 {
            writer.submit(event("board-01", seq));
        }
        writer.stop().await;

        let accepted = stats.accepted.load(Ordering::Relaxed);
        assert_eq!(accepted, 10);
        assert_eq!(stats.failed_rows.load(Ordering::Relaxed), 4);
        assert_eq!(stats.rows_written.load(Ordering::Relaxed), 6);
        assert_eq!(stats.discarded_at_shutdown.load(Ordering::Relaxed), 0);
        assert_eq!(seqs(&storage), vec![4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stopped_writer_drops() {
        let storage = MemoryStorage::new();
        let writer = writer_with(&storage, config(1, 10_000));

        assert!(!writer.submit(event("d", 0)));
        assert_eq!(writer.stats().dropped.load(Ordering::Relaxed), 1);

        writer.start().await;
        writer.start().await;
        assert_eq!(writer.phase(), WriterPhase::Running);
        assert!(writer.submit(event("d", 1)));
        assert!(wait_until(|| storage.commit_count() == 1, Duration::from_secs(1)).await);

        writer.stop().await;
        writer.stop().await;
        assert_eq!(writer.phase(), WriterPhase::Stopped);
        assert!(!writer.submit(event("d", 2)));
    }

    #[test]
    fn grouping_keeps_first_seen_device_order() {
        let batch = vec![event("x", 1), event("y", 2), event("x", 3), event("z", 4)];
        let groups = group_by_device(&batch);
        let shape: Vec<(&str, Vec<i64>)> = groups
            .iter()
            .map(|(uid, events)| {
                (
                    *uid,
                    events.iter().map(|e| e.metrics["seq"] as i64).collect(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![("x", vec![1, 3]), ("y", vec![2]), ("z", vec![4])]
        );
    }
}
