pub mod bus;
pub mod config;
pub mod identity;
pub mod pipeline;
pub mod simulator;
pub mod storage;
pub mod telemetry;
pub mod writer;

pub use bus::{EventBus, Subscription};
pub use pipeline::{EventSource, IngestContext, IngestSink, IngestionPipeline};
pub use telemetry::{SharedEvent, TelemetryEvent};
pub use writer::{BatchingWriter, WriterConfig, WriterPhase};
