//! Synthetic telemetry for running the pipeline without hardware.

use crate::pipeline::{EventSource, IngestSink};
use crate::telemetry::TelemetryEvent;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map as JsonMap};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PHASE_STEP: f64 = 0.08;

pub struct TelemetrySimulator {
    device_uid: String,
    interval: Duration,
    phase: f64,
}

impl TelemetrySimulator {
    pub fn new(device_uid: impl Into<String>, interval: Duration) -> Self {
        Self {
            device_uid: device_uid.into(),
            interval,
            phase: 0.0,
        }
    }

    /// Advances the signal phase and produces the next reading.
    pub fn next_event(&mut self) -> TelemetryEvent {
        self.phase += PHASE_STEP;
        let t = self.phase;
        let mut rng = rand::thread_rng();

        let voltage = 12.0 + 0.6 * t.sin() + rng.gen_range(-0.08..=0.08);
        let current = 1.5 + 0.4 * (t * 0.7).sin() + rng.gen_range(-0.05..=0.05);
        let temp_c = 35.0 + 2.0 * (t * 0.3).sin() + rng.gen_range(-0.2..=0.2);
        let rpm = 1400.0 + 120.0 * (t * 0.9).sin() + rng.gen_range(-10.0..=10.0);

        let metrics = BTreeMap::from([
            ("voltage".to_string(), round_to(voltage, 3)),
            ("current".to_string(), round_to(current, 3)),
            ("temp_c".to_string(), round_to(temp_c, 3)),
            ("rpm".to_string(), round_to(rpm, 1)),
        ]);
        let mut quality = JsonMap::new();
        quality.insert("crc_ok".to_string(), json!(true));
        quality.insert("frame_seq".to_string(), json!((t * 1000.0) as i64));

        TelemetryEvent::new(Utc::now(), self.device_uid.clone(), metrics, quality)
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[async_trait]
impl EventSource for TelemetrySimulator {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn run(self: Box<Self>, sink: IngestSink, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut sim = *self;
        tracing::info!(
            device_uid = %sim.device_uid,
            interval_ms = sim.interval.as_millis() as u64,
            "simulator started"
        );
        let mut ticker = tokio::time::interval(sim.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let event = sim.next_event();
                    sink.ingest(event);
                }
            }
        }
        tracing::info!(device_uid = %sim.device_uid, "simulator stopped");
        Ok(())
    }
}
