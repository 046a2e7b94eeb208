use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const UNKNOWN_DEVICE_UID: &str = "unknown";

/// One telemetry tick from a device. Metric and quality keys are not fixed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "device_id")]
    pub device_uid: String,
    pub metrics: BTreeMap<String, f64>,
    pub quality: JsonMap<String, JsonValue>,
}

/// Read-only handle shared by the bus subscribers and the writer queue.
pub type SharedEvent = Arc<TelemetryEvent>;

impl TelemetryEvent {
    pub fn new(
        ts: DateTime<Utc>,
        device_uid: impl Into<String>,
        metrics: BTreeMap<String, f64>,
        quality: JsonMap<String, JsonValue>,
    ) -> Self {
        let mut metrics = metrics;
        // NaN and infinities have no JSON form and would be stored as null.
        metrics.retain(|_, value| value.is_finite());
        Self {
            ts: truncate_to_micros(ts),
            device_uid: device_uid.into(),
            metrics,
            quality,
        }
    }

    pub fn crc_ok(&self) -> Option<bool> {
        self.quality.get("crc_ok").and_then(JsonValue::as_bool)
    }

    pub fn frame_seq(&self) -> Option<i64> {
        self.quality.get("frame_seq").and_then(JsonValue::as_i64)
    }

    pub fn into_shared(self) -> SharedEvent {
        Arc::new(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryParseError {
    #[error("malformed telemetry payload: {0}")]
    Json(#[from] simd_json::Error),
    #[error("telemetry payload has no metrics")]
    EmptyMetrics,
}

#[derive(Debug, Deserialize)]
struct BorrowedEvent<'a> {
    #[serde(default, borrow)]
    ts: Option<BorrowedTimestamp<'a>>,
    #[serde(default, borrow)]
    device_uid: Option<&'a str>,
    #[serde(default, borrow)]
    device_id: Option<&'a str>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    quality: Option<JsonMap<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> DateTime<Utc> {
        match self {
            BorrowedTimestamp::Str(s) => parse_timestamp(s).unwrap_or_else(Utc::now),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(ms) => millis_to_dt(ms.trunc() as i64),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Offset-less timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(ts)
}

/// Parses a producer payload. `payload` is mutated in place by simd-json.
pub fn parse_event_payload(payload: &mut [u8]) -> Result<TelemetryEvent, TelemetryParseError> {
    let raw: BorrowedEvent = simd_json::from_slice(payload)?;

    let ts = raw
        .ts
        .as_ref()
        .map(|t| t.to_datetime())
        .unwrap_or_else(Utc::now);
    let device_uid = raw
        .device_uid
        .or(raw.device_id)
        .map(str::trim)
        .filter(|uid| !uid.is_empty())
        .unwrap_or(UNKNOWN_DEVICE_UID);

    let event = TelemetryEvent::new(
        ts,
        device_uid,
        raw.metrics,
        raw.quality.unwrap_or_default(),
    );
    if event.metrics.is_empty() {
        return Err(TelemetryParseError::EmptyMetrics);
    }
    Ok(event)
}
