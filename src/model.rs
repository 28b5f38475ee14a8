/// Event, AggregateRecord, PotentialSource, MonitorError
/// core data structures and error handling
///
/// Core data types for the sensor event monitoring service.
///
/// This module defines the shared domain model imported by all other modules.
/// It contains no I/O; the only logic is bucket arithmetic and formatting,
/// which every other module needs to agree on.

use chrono::DateTime;
use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Time constants
// ---------------------------------------------------------------------------

/// Width of one aggregation bucket, in seconds.
pub const BUCKET_SECS: i64 = 60;

/// Offset applied to bucket starts before they are formatted for output.
/// Reported times have always been shifted by one hour; keep it unless the
/// run configuration overrides it.
pub const DEFAULT_UTC_OFFSET_SECS: i64 = 3600;

/// Output format for bucket times: `DD/MM/YYYY HH:MM:SS`.
pub const BUCKET_TIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Truncates a millisecond timestamp to the start of its enclosing minute,
/// in whole seconds since epoch.
///
/// Uses floor semantics so pre-epoch timestamps land in the minute that
/// contains them rather than the one after.
pub fn round_millis_to_minute(timestamp_ms: f64) -> i64 {
    let secs = (timestamp_ms / 1000.0).floor() as i64;
    round_secs_to_minute(secs)
}

/// Truncates seconds since epoch to the start of the enclosing minute.
pub fn round_secs_to_minute(secs: i64) -> i64 {
    secs - secs.rem_euclid(BUCKET_SECS)
}

/// Formats a bucket start (seconds since epoch) as `DD/MM/YYYY HH:MM:SS`
/// after shifting it by `utc_offset_secs`.
///
/// Falls back to the raw number if the shifted instant is out of chrono's
/// representable range.
pub fn format_bucket_time(bucket_start: i64, utc_offset_secs: i64) -> String {
    let shifted = bucket_start.saturating_add(utc_offset_secs);
    match DateTime::from_timestamp(shifted, 0) {
        Some(dt) => dt.format(BUCKET_TIME_FORMAT).to_string(),
        None => shifted.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// A single accepted sensor reading.
///
/// Created by `ingest::intake::IntakeFilter` once a message has passed
/// deduplication and the location check; owned by exactly one
/// `ledger::Location` afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub location_id: String,
    pub value: f64,
    pub timestamp_ms: f64,       // milliseconds since epoch, source clock
    pub time_rounded_to_minute: i64, // bucket start, seconds since epoch
}

impl Event {
    pub fn new(event_id: String, location_id: String, value: f64, timestamp_ms: f64) -> Self {
        Event {
            event_id,
            location_id,
            value,
            timestamp_ms,
            time_rounded_to_minute: round_millis_to_minute(timestamp_ms),
        }
    }
}

/// The finalized average for one location and one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketAverage {
    pub bucket_start: i64,
    pub formatted_time: String,
    pub event_count: usize,
    pub average_value: f64,
}

// ---------------------------------------------------------------------------
// Emitted records
// ---------------------------------------------------------------------------

/// Number of messages still waiting in the source, if the source could say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepth {
    Known(u64),
    Unknown,
}

impl Serialize for QueueDepth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QueueDepth::Known(n) => serializer.serialize_u64(*n),
            QueueDepth::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueDepth::Known(n) => write!(f, "{}", n),
            QueueDepth::Unknown => write!(f, "unknown"),
        }
    }
}

/// One global aggregate, emitted once per minute by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRecord {
    pub bucket_start: i64,
    pub formatted_time: String,
    pub average_value: f64,
    pub event_count: usize,
    pub queue_depth: QueueDepth,
}

impl fmt::Display for AggregateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "time: {}; average value: {:.6}; number of values: {}; queue size: {}",
            self.formatted_time, self.average_value, self.event_count, self.queue_depth
        )
    }
}

/// A scored grid cell produced during source localization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PotentialSource {
    pub x: f64,
    pub y: f64,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that abort a run.
///
/// Per-message problems never end up here; they are `IntakeOutcome`
/// rejections. Everything in this enum means the run cannot continue.
#[derive(Debug, PartialEq)]
pub enum MonitorError {
    /// The configuration file is unreadable or has invalid values.
    Config(String),
    /// The location manifest could not be loaded or failed validation.
    Manifest(String),
    /// Non-2xx HTTP response while downloading an external resource.
    Http(u16),
    /// The message source is unavailable or returned an error.
    Queue(String),
    /// Local filesystem failure (manifest, replay file, report output).
    Io(String),
    /// A document could not be deserialized or serialized.
    Parse(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Config(msg) => write!(f, "Config error: {}", msg),
            MonitorError::Manifest(msg) => write!(f, "Manifest error: {}", msg),
            MonitorError::Http(code) => write!(f, "HTTP error: {}", code),
            MonitorError::Queue(msg) => write!(f, "Queue error: {}", msg),
            MonitorError::Io(msg) => write!(f, "IO error: {}", msg),
            MonitorError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        MonitorError::Io(err.to_string())
    }
}

impl From<postgres::Error> for MonitorError {
    fn from(err: postgres::Error) -> Self {
        MonitorError::Queue(err.to_string())
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => MonitorError::Http(status.as_u16()),
            None => MonitorError::Manifest(format!("request failed: {}", err)),
        }
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        MonitorError::Parse(err.to_string())
    }
}

impl From<toml::de::Error> for MonitorError {
    fn from(err: toml::de::Error) -> Self {
        MonitorError::Config(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_millis_truncates_to_minute_start() {
        // 2024-05-01T12:00:59.999Z
        assert_eq!(round_millis_to_minute(1_714_564_859_999.0), 1_714_564_800);
        assert_eq!(round_millis_to_minute(1_714_564_800_000.0), 1_714_564_800);
        assert_eq!(round_millis_to_minute(1_714_564_860_000.0), 1_714_564_860);
    }

    #[test]
    fn test_round_millis_handles_fractional_and_pre_epoch_values() {
        assert_eq!(round_millis_to_minute(61_500.5), 60);
        // One second before the epoch belongs to the minute starting at -60.
        assert_eq!(round_millis_to_minute(-1_000.0), -60);
    }

    #[test]
    fn test_format_bucket_time_applies_offset() {
        // 2024-05-01 12:00:00 UTC shifted one hour forward.
        assert_eq!(
            format_bucket_time(1_714_564_800, DEFAULT_UTC_OFFSET_SECS),
            "01/05/2024 13:00:00"
        );
        assert_eq!(format_bucket_time(1_714_564_800, 0), "01/05/2024 12:00:00");
    }

    #[test]
    fn test_event_computes_rounded_minute() {
        let event = Event::new("e1".into(), "L1".into(), 4.0, 1_714_564_815_000.0);
        assert_eq!(event.time_rounded_to_minute, 1_714_564_800);
    }

    #[test]
    fn test_aggregate_record_display_matches_report_line() {
        let record = AggregateRecord {
            bucket_start: 0,
            formatted_time: "01/01/1970 01:00:00".to_string(),
            average_value: 6.5,
            event_count: 3,
            queue_depth: QueueDepth::Unknown,
        };
        assert_eq!(
            record.to_string(),
            "time: 01/01/1970 01:00:00; average value: 6.500000; number of values: 3; queue size: unknown"
        );
    }

    #[test]
    fn test_queue_depth_serializes_as_int_or_string() {
        assert_eq!(serde_json::to_string(&QueueDepth::Known(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&QueueDepth::Unknown).unwrap(), "\"unknown\"");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(MonitorError::Http(503).to_string(), "HTTP error: 503");
        assert_eq!(
            MonitorError::Queue("connection refused".into()).to_string(),
            "Queue error: connection refused"
        );
    }
}
