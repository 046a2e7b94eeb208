//! Publish-then-persist orchestration and ordered start/stop.

use crate::bus::EventBus;
use crate::identity::DeviceIdentityResolver;
use crate::storage::Storage;
use crate::telemetry::TelemetryEvent;
use crate::writer::{BatchingWriter, WriterConfig};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Who produced an event. Recorded on the ingest span only; persisted rows carry
/// the writer's configured source tag.
#[derive(Debug, Clone)]
pub struct IngestContext {
    pub source: String,
    pub correlation_id: Uuid,
}

impl IngestContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// A producer task feeding the pipeline until cancelled.
#[async_trait]
pub trait EventSource: Send + 'static {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>, sink: IngestSink, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Cloneable ingest entry point handed to producers.
#[derive(Clone)]
pub struct IngestSink {
    ctx: IngestContext,
    bus: EventBus,
    writer: Arc<BatchingWriter>,
}

impl IngestSink {
    pub fn context(&self) -> &IngestContext {
        &self.ctx
    }

    pub fn ingest(&self, event: TelemetryEvent) {
        ingest_event(&self.bus, &self.writer, &self.ctx, event);
    }
}

fn ingest_event(bus: &EventBus, writer: &BatchingWriter, ctx: &IngestContext, event: TelemetryEvent) {
    let span = tracing::trace_span!(
        "ingest",
        source = %ctx.source,
        correlation_id = %ctx.correlation_id,
        device_uid = %event.device_uid
    );
    let _entered = span.enter();

    let event = event.into_shared();
    bus.publish(&event);
    writer.submit(event);
}

struct Producer {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub struct IngestionPipeline {
    bus: EventBus,
    writer: Arc<BatchingWriter>,
    storage: Arc<dyn Storage>,
    producers: Mutex<Vec<Producer>>,
    shutdown_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        bus: EventBus,
        writer_config: WriterConfig,
        device_cache_size: usize,
    ) -> Self {
        let shutdown_timeout = writer_config.shutdown_timeout;
        let resolver = Arc::new(DeviceIdentityResolver::new(device_cache_size));
        let writer = Arc::new(BatchingWriter::new(writer_config, storage.clone(), resolver));
        Self {
            bus,
            writer,
            storage,
            producers: Mutex::new(Vec::new()),
            shutdown_timeout,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn writer(&self) -> &Arc<BatchingWriter> {
        &self.writer
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Brings up persistence. Producers should be attached afterwards.
    pub async fn start(&self) {
        self.writer.start().await;
        tracing::info!(backend = self.storage.backend(), "ingestion pipeline started");
    }

    /// Publishes to live subscribers first, then hands the event to the writer.
    /// Neither path reports failure to the caller.
    pub fn ingest(&self, ctx: &IngestContext, event: TelemetryEvent) {
        ingest_event(&self.bus, &self.writer, ctx, event);
    }

    pub fn sink(&self, ctx: IngestContext) -> IngestSink {
        IngestSink {
            ctx,
            bus: self.bus.clone(),
            writer: self.writer.clone(),
        }
    }

    /// Runs `source` in its own task until `stop` cancels it.
    pub fn spawn_source(&self, source: Box<dyn EventSource>) {
        let name = source.name().to_string();
        let ctx = IngestContext::new(name.clone());
        let correlation_id = ctx.correlation_id;
        let sink = self.sink(ctx);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(sink, cancel.clone()));

        tracing::info!(source = %name, %correlation_id, "event source attached");
        match self.producers.lock() {
            Ok(mut producers) => producers.push(Producer { name, cancel, handle }),
            Err(poisoned) => poisoned
                .into_inner()
                .push(Producer { name, cancel, handle }),
        }
    }

    /// Stops producers, then the writer, then storage. Always completes.
    pub async fn stop(&self) {
        let producers = match self.producers.lock() {
            Ok(mut producers) => std::mem::take(&mut *producers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for producer in &producers {
            producer.cancel.cancel();
        }
        for Producer { name, handle, .. } in producers {
            stop_producer(&name, handle, self.shutdown_timeout).await;
        }

        self.writer.stop().await;
        self.storage.close().await;
        tracing::info!("ingestion pipeline stopped");
    }
}

async fn stop_producer(name: &str, mut handle: JoinHandle<anyhow::Result<()>>, budget: Duration) {
    match tokio::time::timeout(budget, &mut handle).await {
        Ok(Ok(Ok(()))) => tracing::info!(source = name, "event source stopped"),
        Ok(Ok(Err(err))) => tracing::error!(source = name, error = %err, "event source failed"),
        Ok(Err(err)) if err.is_cancelled() => {
            tracing::info!(source = name, "event source cancelled cleanly")
        }
        Ok(Err(err)) => tracing::error!(source = name, error = %err, "event source panicked"),
        Err(_) => {
            tracing::warn!(source = name, "event source ignored cancellation; aborting");
            handle.abort();
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    tracing::error!(source = name, error = %err, "event source panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::StorageError;
    use chrono::Utc;
    use serde_json::Map as JsonMap;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn event(device_uid: &str, seq: i64) -> TelemetryEvent {
        TelemetryEvent::new(
            Utc::now(),
            device_uid,
            BTreeMap::from([("seq".to_string(), seq as f64)]),
            JsonMap::new(),
        )
    }

    fn pipeline(storage: &MemoryStorage, subscriber_capacity: usize) -> IngestionPipeline {
        let config = WriterConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
            queue_capacity: 1000,
            max_inflight_flushes: 1,
            shutdown_timeout: Duration::from_millis(500),
            source: "test".to_string(),
        };
        IngestionPipeline::new(
            Arc::new(storage.clone()),
            EventBus::new(subscriber_capacity),
            config,
            16,
        )
    }

    struct Counter {
        limit: Option<i64>,
    }

    #[async_trait]
    impl EventSource for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        async fn run(self: Box<Self>, sink: IngestSink, cancel: CancellationToken) -> anyhow::Result<()> {
            let mut seq = 0;
            loop {
                if self.limit.is_some_and(|limit| seq >= limit) {
                    cancel.cancelled().await;
                    return Ok(());
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {
                        sink.ingest(event("counter", seq));
                        seq += 1;
                    }
                }
            }
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSource for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(self: Box<Self>, _sink: IngestSink, _cancel: CancellationToken) -> anyhow::Result<()> {
            anyhow::bail!("serial port vanished")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventSource for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(self: Box<Self>, _sink: IngestSink, _cancel: CancellationToken) -> anyhow::Result<()> {
            panic!("frame decoder bug")
        }
    }

    #[tokio::test]
    async fn ingest_reaches_subscribers_and_storage() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 16);
        pipeline.start().await;
        let mut sub = pipeline.bus().subscribe();

        let ctx = IngestContext::new("test");
        for seq in 0..3 {
            pipeline.ingest(&ctx, event("board-01", seq));
        }

        for seq in 0..3 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.metrics["seq"] as i64, seq);
        }
        pipeline.stop().await;
        assert_eq!(storage.sample_count(), 3);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_persistence() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 1);
        pipeline.start().await;
        let mut sub = pipeline.bus().subscribe();

        let ctx = IngestContext::new("test");
        for seq in 0..20 {
            pipeline.ingest(&ctx, event("board-01", seq));
        }
        pipeline.stop().await;

        assert_eq!(storage.sample_count(), 20);
        assert_eq!(sub.try_recv().map(|e| e.metrics["seq"] as i64), Some(0));
        assert!(sub.try_recv().is_none());
        assert_eq!(pipeline.bus().stats().dropped_slow.load(Ordering::Relaxed), 19);
    }

    #[tokio::test]
    async fn ingest_before_start_still_publishes() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 4);
        let mut sub = pipeline.bus().subscribe();

        pipeline.ingest(&IngestContext::new("test"), event("board-01", 0));

        assert!(sub.try_recv().is_some());
        let stats = pipeline.writer().stats();
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stop_runs_in_order_and_persists_everything_accepted() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 4);
        pipeline.start().await;
        pipeline.spawn_source(Box::new(Counter { limit: None }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        pipeline.stop().await;

        let stats = pipeline.writer().stats();
        let accepted = stats.accepted.load(Ordering::Relaxed);
        assert!(accepted > 0);
        assert_eq!(storage.sample_count() as u64, accepted);
        assert!(matches!(storage.begin().await, Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn failing_and_panicking_sources_do_not_block_shutdown() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 4);
        pipeline.start().await;
        pipeline.spawn_source(Box::new(Failing));
        pipeline.spawn_source(Box::new(Panicking));
        pipeline.spawn_source(Box::new(Counter { limit: Some(5) }));

        let stats = pipeline.writer().stats();
        let produced = tokio::time::timeout(Duration::from_secs(5), async {
            while stats.accepted.load(Ordering::Relaxed) < 5 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(produced.is_ok());

        let stopped = tokio::time::timeout(Duration::from_secs(5), pipeline.stop()).await;
        assert!(stopped.is_ok());
        assert_eq!(storage.sample_count(), 5);
    }

    #[tokio::test]
    async fn sink_carries_source_context() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 4);
        let sink = pipeline.sink(IngestContext::new("serial"));
        assert_eq!(sink.context().source, "serial");
        assert_ne!(sink.context().correlation_id, Uuid::nil());
    }

    #[tokio::test]
    async fn persisted_rows_use_the_writer_source_tag() {
        let storage = MemoryStorage::new();
        let pipeline = pipeline(&storage, 4);
        pipeline.start().await;

        pipeline.sink(IngestContext::new("serial")).ingest(event("a", 0));
        pipeline.sink(IngestContext::new("replay")).ingest(event("b", 1));
        pipeline.stop().await;

        let sources: Vec<String> = storage.samples().into_iter().map(|s| s.source).collect();
        assert_eq!(sources, vec!["test".to_string(), "test".to_string()]);
    }
}
