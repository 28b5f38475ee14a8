/// Windowed aggregation: the ingestion loop.
///
/// One bucket is finalized per minute, `settle_lag` seconds after the
/// bucket ends. With the default five-minute lag, the aggregate emitted at
/// 12:06:00 covers the bucket 12:00:00–12:00:59. Anything that arrives for
/// a bucket after its settle window is stored (it still counts toward the
/// location's overall average) but never enters that bucket's aggregate.
///
/// # Clock injection
/// The loop reads time only through `Clock`, so tests can step through
/// minute boundaries and the run deadline deterministically.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RunConfig;
use crate::ingest::intake::{decode_message, DedupSet, IntakeFilter, RejectReason};
use crate::ingest::queue::{MessageSource, QueueMessage};
use crate::ledger::{weighted_global_average, Ledger};
use crate::logging::{self, Component};
use crate::model::{
    format_bucket_time, round_secs_to_minute, AggregateRecord, MonitorError, QueueDepth, BUCKET_SECS,
};

/// Cadence of emissions. Equal to the bucket width: one aggregate per bucket.
pub const EMIT_INTERVAL_SECS: i64 = BUCKET_SECS;

// ---------------------------------------------------------------------------
// Window arithmetic
// ---------------------------------------------------------------------------

/// The bucket finalized by the emission scheduled at `emit_time`.
pub fn target_bucket(emit_time: i64, settle_lag_secs: i64) -> i64 {
    emit_time - settle_lag_secs - EMIT_INTERVAL_SECS
}

/// Whether an event for `bucket_start` seen at `now_secs` is still within
/// the settle lag of its bucket's end.
///
/// Exactly `settle_lag_secs` after the bucket ends is still inside the
/// window; one second more is not.
pub fn within_settle_window(bucket_start: i64, now_secs: i64, settle_lag_secs: i64) -> bool {
    now_secs - (bucket_start + EMIT_INTERVAL_SECS) <= settle_lag_secs
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub batches: usize,
    pub received: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub unknown_location: usize,
    pub malformed: usize,
    /// Rejected because their bucket fell out of the dedup retention window.
    pub expired: usize,
    /// Accepted events whose bucket had already been finalized.
    pub late_events: usize,
    pub ack_failures: usize,
    pub emitted: usize,
}

/// Everything a finished run hands back.
#[derive(Debug)]
pub struct RunOutcome {
    pub ledger: Ledger,
    pub records: Vec<AggregateRecord>,
    pub stats: RunStats,
}

/// Owns the ledger and the intake filter for the lifetime of one run.
pub struct Scheduler {
    ledger: Ledger,
    intake: IntakeFilter,
    settings: RunConfig,
    next_emit_time: i64,
    /// Latest bucket that will never be emitted again.
    finalized_through: i64,
    records: Vec<AggregateRecord>,
    stats: RunStats,
}

impl Scheduler {
    pub fn new(ledger: Ledger, settings: RunConfig) -> Self {
        let intake = IntakeFilter::new(DedupSet::new(settings.dedup_retention_secs));
        Scheduler {
            ledger,
            intake,
            settings,
            next_emit_time: 0,
            finalized_through: i64::MIN,
            records: Vec::new(),
            stats: RunStats::default(),
        }
    }

    /// Sets the emission schedule for a run starting at `start_secs`: the
    /// first emission is at the next minute boundary. Buckets older than the
    /// first target can never be emitted, so they count as already final.
    pub fn start_at(&mut self, start_secs: i64) {
        self.next_emit_time = round_secs_to_minute(start_secs) + EMIT_INTERVAL_SECS;
        self.finalized_through =
            target_bucket(self.next_emit_time, self.settings.settle_lag_secs) - BUCKET_SECS;
    }

    pub fn next_emit_time(&self) -> i64 {
        self.next_emit_time
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn records(&self) -> &[AggregateRecord] {
        &self.records
    }

    /// Whether an event for `bucket_start` received at `now_secs` is too
    /// late to count toward its bucket: either the bucket has already been
    /// emitted or its settle window has passed.
    pub fn is_late(&self, bucket_start: i64, now_secs: i64) -> bool {
        bucket_start <= self.finalized_through
            || !within_settle_window(bucket_start, now_secs, self.settings.settle_lag_secs)
    }

    /// Runs every message of one batch, received at `now_secs`, through the
    /// intake filter. Late events are stored outside their bucket.
    pub fn ingest_batch(&mut self, messages: &[QueueMessage], now_secs: i64) {
        self.stats.batches += 1;
        self.stats.received += messages.len();

        for message in messages {
            let admitted = decode_message(&message.body)
                .and_then(|decoded| self.intake.admit(&self.ledger, decoded));
            let event = match admitted {
                Ok(event) => event,
                Err(reason) => {
                    match reason {
                        RejectReason::Duplicate(_) => self.stats.duplicates += 1,
                        RejectReason::UnknownLocation(_) => self.stats.unknown_location += 1,
                        RejectReason::Malformed(_) => self.stats.malformed += 1,
                        RejectReason::Expired(_) => self.stats.expired += 1,
                    }
                    logging::debug(Component::Intake, None, &format!("rejected message {}: {}", message.id, reason));
                    continue;
                }
            };

            self.stats.accepted += 1;
            let bucket_start = event.time_rounded_to_minute;
            let late = self.is_late(bucket_start, now_secs);
            if late {
                self.stats.late_events += 1;
                logging::debug(
                    Component::Intake,
                    Some(&event.location_id),
                    &format!(
                        "event for {} arrived after its bucket settled",
                        format_bucket_time(bucket_start, self.settings.utc_offset_secs)
                    ),
                );
            }

            if let Some(location) = self.ledger.get_mut(&event.location_id) {
                if late {
                    location.append_late(event);
                } else {
                    location.append(event);
                }
            }
        }
    }

    /// Emits every aggregate whose emission time has been reached by
    /// `now_secs`, oldest first. A stalled loop catches up one minute at a
    /// time, so no bucket is skipped.
    pub fn emit_due<F>(&mut self, now_secs: i64, source: &mut dyn MessageSource, on_emit: &mut F)
    where
        F: FnMut(&AggregateRecord),
    {
        while now_secs >= self.next_emit_time {
            let bucket_start = target_bucket(self.next_emit_time, self.settings.settle_lag_secs);
            let offset = self.settings.utc_offset_secs;

            let pairs = self.ledger.finalize_all(bucket_start, offset);
            for (location, (count, average)) in self.ledger.iter().zip(&pairs) {
                logging::debug(
                    Component::Ledger,
                    Some(&location.id),
                    &format!("bucket average {:.6} over {} events", average, count),
                );
            }
            let (average_value, event_count) = weighted_global_average(&pairs);

            let queue_depth = match source.depth() {
                Ok(depth) => QueueDepth::Known(depth),
                Err(e) => {
                    logging::log_queue_failure("queue depth", &e);
                    QueueDepth::Unknown
                }
            };

            let record = AggregateRecord {
                bucket_start,
                formatted_time: format_bucket_time(bucket_start, offset),
                average_value,
                event_count,
                queue_depth,
            };
            on_emit(&record);
            self.records.push(record);

            self.stats.emitted += 1;
            self.finalized_through = bucket_start;
            let emitted_at = self.next_emit_time;
            self.next_emit_time += EMIT_INTERVAL_SECS;

            // Measured from the emission time, not `now_secs`, so a stalled
            // loop never evicts ids of buckets that have not been emitted.
            let evicted = self.intake.dedup_mut().evict_expired(emitted_at);
            if evicted > 0 {
                logging::debug(Component::Intake, None, &format!("evicted {} expired event ids", evicted));
            }
        }
    }

    /// Runs the polling loop until `run.duration_secs` have elapsed on
    /// `clock` or `cancel` is set, then hands back the ledger and results.
    ///
    /// Receive failures end the run with an error. Acknowledgment and
    /// queue-depth failures are logged and the loop carries on; an
    /// unacknowledged message is redelivered and rejected as a duplicate.
    pub fn run<F>(
        mut self,
        source: &mut dyn MessageSource,
        clock: &dyn Clock,
        cancel: Option<&AtomicBool>,
        mut on_emit: F,
    ) -> Result<RunOutcome, MonitorError>
    where
        F: FnMut(&AggregateRecord),
    {
        let start = clock.now();
        let duration_secs = i64::try_from(self.settings.duration_secs).unwrap_or(i64::MAX);
        let end = chrono::Duration::try_seconds(duration_secs)
            .and_then(|d| start.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.start_at(start.timestamp());

        let batch_size = self.settings.batch_size;
        let wait = Duration::from_secs(self.settings.wait_timeout_secs);

        logging::info(
            Component::Scheduler,
            None,
            &format!(
                "Ingesting for {}s across {} locations (settle lag {}s)",
                self.settings.duration_secs,
                self.ledger.len(),
                self.settings.settle_lag_secs
            ),
        );

        while clock.now() < end {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                logging::warn(Component::Scheduler, None, "Cancellation requested; stopping ingestion");
                break;
            }

            let messages = source.receive(batch_size, wait)?;
            if let Some(oldest) = messages.iter().filter_map(|m| m.enqueued_at).min() {
                let lag = (clock.now() - oldest).num_seconds();
                logging::debug(
                    Component::Queue,
                    None,
                    &format!("received {} messages, oldest queued {}s ago", messages.len(), lag),
                );
            }

            self.ingest_batch(&messages, clock.now().timestamp());

            if !messages.is_empty() {
                if let Err(e) = source.acknowledge(&messages) {
                    self.stats.ack_failures += 1;
                    logging::log_queue_failure("acknowledge", &e);
                }
            }

            let now_secs = clock.now().timestamp();
            self.emit_due(now_secs, source, &mut on_emit);
        }

        logging::debug(
            Component::Intake,
            None,
            &format!("{} event ids tracked for deduplication", self.intake.dedup().len()),
        );
        logging::log_run_summary(&self.stats);

        Ok(RunOutcome {
            ledger: self.ledger,
            records: self.records,
            stats: self.stats,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::replay::ReplaySource;
    use crate::locations::LocationRecord;

    const T: i64 = 1_714_564_800; // 2024-05-01 12:00:00 UTC

    fn settings() -> RunConfig {
        RunConfig::default()
    }

    fn ledger() -> Ledger {
        Ledger::from_records(&[
            LocationRecord { id: "L1".into(), x: 0.0, y: 0.0 },
            LocationRecord { id: "L2".into(), x: 10.0, y: 10.0 },
        ])
    }

    fn message(id: i64, event_id: &str, location_id: &str, value: f64, at_secs: i64) -> QueueMessage {
        QueueMessage {
            id,
            body: format!(
                r#"{{"locationId": "{}", "eventId": "{}", "value": {}, "timestamp": {}}}"#,
                location_id,
                event_id,
                value,
                at_secs * 1000
            ),
            enqueued_at: None,
        }
    }

    #[test]
    fn test_target_bucket_is_settle_lag_plus_one_minute_back() {
        assert_eq!(target_bucket(T + 360, 300), T);
    }

    #[test]
    fn test_settle_window_boundary() {
        // Bucket T ends at T + 60.
        assert!(within_settle_window(T, T + 60 + 300, 300), "exactly the settle lag is included");
        assert!(!within_settle_window(T, T + 60 + 301, 300), "one second more is excluded");
        assert!(within_settle_window(T, T + 30, 300));
    }

    #[test]
    fn test_start_schedules_next_minute_boundary() {
        let mut scheduler = Scheduler::new(ledger(), settings());
        scheduler.start_at(T + 17);
        assert_eq!(scheduler.next_emit_time(), T + 60);
    }

    #[test]
    fn test_emit_due_finalizes_settled_bucket() {
        let mut scheduler = Scheduler::new(ledger(), settings());
        scheduler.start_at(T + 300); // first emission at T + 360 targets T
        scheduler.ingest_batch(&[
            message(0, "a", "L1", 4.0, T + 5),
            message(1, "b", "L1", 6.0, T + 40),
            message(2, "c", "L2", 10.0, T + 59),
        ], T + 300);

        let mut source = ReplaySource::from_bodies(Vec::<String>::new()).non_blocking();
        let mut emitted = Vec::new();
        scheduler.emit_due(T + 359, &mut source, &mut |r: &AggregateRecord| emitted.push(r.clone()));
        assert!(emitted.is_empty(), "nothing is due before the boundary");

        scheduler.emit_due(T + 360, &mut source, &mut |r: &AggregateRecord| emitted.push(r.clone()));
        assert_eq!(emitted.len(), 1);
        let record = &emitted[0];
        assert_eq!(record.bucket_start, T);
        assert_eq!(record.formatted_time, "01/05/2024 13:00:00");
        assert_eq!(record.event_count, 3);
        assert!((record.average_value - 20.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.queue_depth, QueueDepth::Known(0));

        let l1 = scheduler.ledger().get("L1").unwrap();
        assert_eq!(l1.bucket_average(T).map(|b| b.average_value), Some(5.0));
        assert_eq!(scheduler.next_emit_time(), T + 420);
    }

    #[test]
    fn test_emit_due_catches_up_missed_minutes() {
        let mut scheduler = Scheduler::new(ledger(), settings());
        scheduler.start_at(T);
        let mut source = ReplaySource::from_bodies(Vec::<String>::new()).non_blocking();
        let mut starts = Vec::new();
        scheduler.emit_due(T + 240, &mut source, &mut |r: &AggregateRecord| starts.push(r.bucket_start));
        assert_eq!(starts, vec![T - 300, T - 240, T - 180, T - 120]);
        assert_eq!(scheduler.stats().emitted, 4);
    }

    #[test]
    fn test_event_for_finalized_bucket_is_counted_late_and_not_reopened() {
        let mut scheduler = Scheduler::new(ledger(), settings());
        scheduler.start_at(T + 300);
        let mut source = ReplaySource::from_bodies(Vec::<String>::new()).non_blocking();
        scheduler.emit_due(T + 360, &mut source, &mut |_: &AggregateRecord| {});

        scheduler.ingest_batch(&[message(0, "late", "L1", 50.0, T + 10)], T + 361);
        assert_eq!(scheduler.stats().late_events, 1);
        assert_eq!(scheduler.records()[0].event_count, 0);
        assert_eq!(
            scheduler.ledger().get("L1").unwrap().overall_average_value(),
            50.0,
            "late events still count toward the overall average"
        );
    }

    #[test]
    fn test_ingest_batch_counts_rejections() {
        let mut scheduler = Scheduler::new(ledger(), settings());
        scheduler.start_at(T);
        scheduler.ingest_batch(&[
            message(0, "a", "L1", 1.0, T),
            message(1, "a", "L1", 1.0, T),
            message(2, "b", "L7", 1.0, T),
            QueueMessage { id: 3, body: "garbage".into(), enqueued_at: None },
        ], T + 1);
        let stats = scheduler.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.unknown_location, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_stalled_loop_still_excludes_events_past_settle_window() {
        let mut scheduler = Scheduler::new(ledger(), settings());
        scheduler.start_at(T + 300);
        // Bucket T settled at T + 360, but the loop only gets to it at T + 400.
        scheduler.ingest_batch(&[message(0, "slow", "L1", 9.0, T + 30)], T + 400);
        assert_eq!(scheduler.stats().late_events, 1);

        let mut source = ReplaySource::from_bodies(Vec::<String>::new()).non_blocking();
        let mut emitted = Vec::new();
        scheduler.emit_due(T + 400, &mut source, &mut |r: &AggregateRecord| emitted.push(r.clone()));
        assert_eq!(emitted[0].bucket_start, T);
        assert_eq!(emitted[0].event_count, 0, "event past the settle window must not be counted");
        assert_eq!(scheduler.ledger().get("L1").unwrap().overall_average_value(), 9.0);
    }

    #[test]
    fn test_redelivery_after_dedup_eviction_is_not_stored_again() {
        let settings = RunConfig { dedup_retention_secs: Some(300), ..RunConfig::default() };
        let mut scheduler = Scheduler::new(ledger(), settings);
        scheduler.start_at(T);
        scheduler.ingest_batch(&[message(0, "dup", "L1", 4.0, T)], T + 1);

        let mut source = ReplaySource::from_bodies(Vec::<String>::new()).non_blocking();
        scheduler.emit_due(T + 600, &mut source, &mut |_: &AggregateRecord| {});
        scheduler.ingest_batch(&[message(1, "dup", "L1", 4.0, T)], T + 600);

        let stored = scheduler
            .ledger()
            .get("L1")
            .unwrap()
            .events()
            .iter()
            .filter(|e| e.event_id == "dup")
            .count();
        assert_eq!(stored, 1, "a redelivered event must be stored once");
        assert_eq!(scheduler.stats().expired, 1);
        assert_eq!(scheduler.stats().accepted, 1);
        assert_eq!(scheduler.ledger().get("L1").unwrap().overall_average_value(), 4.0);
    }
}
