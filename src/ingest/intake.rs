/// Event intake: decoding, deduplication, and the known-location check.
///
/// The feed delivers at least once, so the same event id can arrive more
/// than once. Every message ends in an `IntakeOutcome`; nothing a single
/// message contains can abort the run.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::ledger::Ledger;
use crate::locations::Ident;
use crate::model::{round_millis_to_minute, Event};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// The body was not JSON, or a required field was missing or mistyped.
    Malformed(String),
    /// The location id is not in the manifest.
    UnknownLocation(String),
    /// The event id has already been accepted during this run.
    Duplicate(String),
    /// The event's bucket is older than the dedup retention window, so a
    /// repeat of it could no longer be recognized.
    Expired(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed(msg) => write!(f, "malformed message: {}", msg),
            RejectReason::UnknownLocation(id) => write!(f, "unknown location '{}'", id),
            RejectReason::Duplicate(id) => write!(f, "duplicate event '{}'", id),
            RejectReason::Expired(id) => write!(f, "event '{}' is older than the dedup window", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    Accepted { location_id: String, bucket_start: i64 },
    Rejected(RejectReason),
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    location_id: Ident,
    event_id: Ident,
    value: f64,
    timestamp: f64,
}

/// A decoded but not yet accepted event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_id: String,
    pub location_id: String,
    pub value: f64,
    pub timestamp_ms: f64,
}

/// Decodes a message body into an event.
///
/// The body is either the event object itself or a publish/subscribe
/// envelope whose `Message` field holds the event object as a JSON string.
pub fn decode_message(body: &str) -> Result<DecodedEvent, RejectReason> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| RejectReason::Malformed(format!("body is not JSON: {}", e)))?;

    let raw: RawEvent = match value.get("Message").and_then(|m| m.as_str()) {
        Some(inner) => serde_json::from_str(inner)
            .map_err(|e| RejectReason::Malformed(format!("envelope message: {}", e)))?,
        None => serde_json::from_value(value)
            .map_err(|e| RejectReason::Malformed(e.to_string()))?,
    };

    if !raw.value.is_finite() || !raw.timestamp.is_finite() {
        return Err(RejectReason::Malformed("non-finite value or timestamp".to_string()));
    }

    Ok(DecodedEvent {
        event_id: raw.event_id.into_key(),
        location_id: raw.location_id.into_key(),
        value: raw.value,
        timestamp_ms: raw.timestamp,
    })
}

// ---------------------------------------------------------------------------
// Dedup set
// ---------------------------------------------------------------------------

/// Event ids accepted so far.
///
/// Without a retention window membership only grows for the whole run.
/// With one, ids are also filed under their bucket start so that
/// `evict_expired` can drop everything older than the window. Buckets
/// before the eviction cutoff are then closed: `is_expired` reports them so
/// that an evicted id cannot be accepted a second time.
#[derive(Debug, Clone, Default)]
pub struct DedupSet {
    seen: HashSet<String>,
    by_bucket: BTreeMap<i64, Vec<String>>,
    retention_secs: Option<i64>,
    evicted_before: Option<i64>,
}

impl DedupSet {
    pub fn new(retention_secs: Option<i64>) -> Self {
        DedupSet {
            retention_secs,
            ..DedupSet::default()
        }
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    /// Records `event_id`; returns `false` if it was already present.
    pub fn insert(&mut self, event_id: &str, bucket_start: i64) -> bool {
        if !self.seen.insert(event_id.to_string()) {
            return false;
        }
        if self.retention_secs.is_some() {
            self.by_bucket
                .entry(bucket_start)
                .or_default()
                .push(event_id.to_string());
        }
        true
    }

    /// Whether ids for `bucket_start` have already been evicted.
    pub fn is_expired(&self, bucket_start: i64) -> bool {
        self.evicted_before.is_some_and(|cutoff| bucket_start < cutoff)
    }

    /// Forgets ids whose bucket started before `now_secs - retention`.
    /// Returns how many ids were dropped; always 0 without a retention window.
    pub fn evict_expired(&mut self, now_secs: i64) -> usize {
        let Some(retention) = self.retention_secs else {
            return 0;
        };
        let cutoff = self.evicted_before.map_or(now_secs - retention, |prev| prev.max(now_secs - retention));
        self.evicted_before = Some(cutoff);
        let kept = self.by_bucket.split_off(&cutoff);
        let expired = std::mem::replace(&mut self.by_bucket, kept);

        let mut dropped = 0;
        for id in expired.into_values().flatten() {
            if self.seen.remove(&id) {
                dropped += 1;
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Intake filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IntakeFilter {
    dedup: DedupSet,
}

impl IntakeFilter {
    pub fn new(dedup: DedupSet) -> Self {
        IntakeFilter { dedup }
    }

    /// Runs one message body through the filter and, on acceptance, appends
    /// the event to its location in `ledger`.
    ///
    /// Unknown-location rejections do not record the event id, so the id
    /// stays usable if the same reading is later sent with a valid location.
    pub fn process(&mut self, ledger: &mut Ledger, body: &str) -> IntakeOutcome {
        let decoded = match decode_message(body) {
            Ok(decoded) => decoded,
            Err(reason) => return IntakeOutcome::Rejected(reason),
        };
        self.accept(ledger, decoded)
    }

    /// Appends an admitted event to its location.
    pub fn accept(&mut self, ledger: &mut Ledger, decoded: DecodedEvent) -> IntakeOutcome {
        let event = match self.admit(ledger, decoded) {
            Ok(event) => event,
            Err(reason) => return IntakeOutcome::Rejected(reason),
        };
        let outcome = IntakeOutcome::Accepted {
            location_id: event.location_id.clone(),
            bucket_start: event.time_rounded_to_minute,
        };
        if let Some(location) = ledger.get_mut(&event.location_id) {
            location.append(event);
        }
        outcome
    }

    /// Checks a decoded event against the manifest and the dedup set and,
    /// if it passes, records its id. Appending is left to the caller.
    pub fn admit(&mut self, ledger: &Ledger, decoded: DecodedEvent) -> Result<Event, RejectReason> {
        if !ledger.contains(&decoded.location_id) {
            return Err(RejectReason::UnknownLocation(decoded.location_id));
        }
        if self.dedup.contains(&decoded.event_id) {
            return Err(RejectReason::Duplicate(decoded.event_id));
        }
        if self.dedup.is_expired(round_millis_to_minute(decoded.timestamp_ms)) {
            return Err(RejectReason::Expired(decoded.event_id));
        }

        let event = Event::new(
            decoded.event_id,
            decoded.location_id,
            decoded.value,
            decoded.timestamp_ms,
        );
        self.dedup.insert(&event.event_id, event.time_rounded_to_minute);
        Ok(event)
    }

    pub fn dedup(&self) -> &DedupSet {
        &self.dedup
    }

    pub fn dedup_mut(&mut self) -> &mut DedupSet {
        &mut self.dedup
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
