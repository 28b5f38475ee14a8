/// Per-location event accumulation and bucket finalization.
///
/// Each `Location` keeps every accepted event in arrival order plus an index
/// from bucket start to the events in that bucket, so finalizing a minute
/// only touches that minute's events. Raw events are never dropped:
/// re-finalizing a bucket must reproduce the same average.

use std::collections::{BTreeMap, HashMap};

use crate::locations::LocationRecord;
use crate::model::{format_bucket_time, BucketAverage, Event};

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Location {
    pub id: String,
    pub x: f64,
    pub y: f64,
    events: Vec<Event>,
    bucket_index: HashMap<i64, Vec<usize>>,
    average_value_at_time: BTreeMap<i64, BucketAverage>,
    latest_average_value: f64,
    latest_event_count: usize,
    total_sum: f64,
    total_count: usize,
}

impl Location {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Location {
            id: id.into(),
            x,
            y,
            events: Vec::new(),
            bucket_index: HashMap::new(),
            average_value_at_time: BTreeMap::new(),
            latest_average_value: 0.0,
            latest_event_count: 0,
            total_sum: 0.0,
            total_count: 0,
        }
    }

    pub fn from_record(record: &LocationRecord) -> Self {
        Location::new(record.id.clone(), record.x, record.y)
    }

    /// Appends an accepted event. The caller has already checked that the
    /// event belongs here and is not a duplicate.
    pub fn append(&mut self, event: Event) {
        debug_assert_eq!(event.location_id, self.id);
        self.total_sum += event.value;
        self.total_count += 1;
        self.bucket_index
            .entry(event.time_rounded_to_minute)
            .or_default()
            .push(self.events.len());
        self.events.push(event);
    }

    /// Appends an event whose bucket has already settled. It counts toward
    /// the overall average but never toward a bucket average, even if that
    /// bucket is finalized again.
    pub fn append_late(&mut self, event: Event) {
        debug_assert_eq!(event.location_id, self.id);
        self.total_sum += event.value;
        self.total_count += 1;
        self.events.push(event);
    }

    /// Computes and records the average of the events in `bucket_start`.
    ///
    /// An empty bucket averages to 0. The result replaces any earlier entry
    /// for the same bucket, which is a no-op when no events were added to it
    /// in between.
    pub fn finalize_bucket(&mut self, bucket_start: i64, utc_offset_secs: i64) -> &BucketAverage {
        let (count, sum) = self
            .events_in_bucket(bucket_start)
            .fold((0usize, 0.0), |(count, sum), event| (count + 1, sum + event.value));

        self.latest_event_count = count;
        self.latest_average_value = if count > 0 { sum / count as f64 } else { 0.0 };

        let entry = BucketAverage {
            bucket_start,
            formatted_time: format_bucket_time(bucket_start, utc_offset_secs),
            event_count: count,
            average_value: self.latest_average_value,
        };
        self.average_value_at_time.insert(bucket_start, entry);
        &self.average_value_at_time[&bucket_start]
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events whose rounded timestamp is `bucket_start`, in arrival order.
    pub fn events_in_bucket(&self, bucket_start: i64) -> impl Iterator<Item = &Event> + '_ {
        self.bucket_index
            .get(&bucket_start)
            .into_iter()
            .flatten()
            .map(move |&i| &self.events[i])
    }

    /// Finalized bucket averages in chronological order.
    pub fn average_value_at_time(&self) -> impl Iterator<Item = &BucketAverage> + '_ {
        self.average_value_at_time.values()
    }

    pub fn bucket_average(&self, bucket_start: i64) -> Option<&BucketAverage> {
        self.average_value_at_time.get(&bucket_start)
    }

    pub fn latest_average_value(&self) -> f64 {
        self.latest_average_value
    }

    pub fn latest_event_count(&self) -> usize {
        self.latest_event_count
    }

    /// Mean of every event this location has received, 0 if none.
    pub fn overall_average_value(&self) -> f64 {
        if self.total_count > 0 {
            self.total_sum / self.total_count as f64
        } else {
            0.0
        }
    }

    pub fn event_count(&self) -> usize {
        self.total_count
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// All locations of a run, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    locations: Vec<Location>,
    index: HashMap<String, usize>,
}

impl Ledger {
    pub fn from_records(records: &[LocationRecord]) -> Self {
        let mut ledger = Ledger::default();
        for record in records {
            ledger.insert(Location::from_record(record));
        }
        ledger
    }

    /// Adds a location. A second location with an existing id replaces the
    /// first in place.
    pub fn insert(&mut self, location: Location) {
        match self.index.get(&location.id) {
            Some(&i) => self.locations[i] = location,
            None => {
                self.index.insert(location.id.clone(), self.locations.len());
                self.locations.push(location);
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Location> {
        self.index.get(id).map(|&i| &self.locations[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Location> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.locations[i]),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> + '_ {
        self.locations.iter()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Finalizes `bucket_start` on every location and returns the
    /// `(event_count, average)` pair of each, in manifest order.
    pub fn finalize_all(&mut self, bucket_start: i64, utc_offset_secs: i64) -> Vec<(usize, f64)> {
        self.locations
            .iter_mut()
            .map(|location| {
                let entry = location.finalize_bucket(bucket_start, utc_offset_secs);
                (entry.event_count, entry.average_value)
            })
            .collect()
    }
}

/// Count-weighted mean of per-location averages: `Σ(nᵢ·avgᵢ) / Σnᵢ`,
/// or 0 when no location had any events.
pub fn weighted_global_average(pairs: &[(usize, f64)]) -> (f64, usize) {
    let total_count: usize = pairs.iter().map(|(count, _)| count).sum();
    if total_count == 0 {
        return (0.0, 0);
    }
    let weighted_sum: f64 = pairs.iter().map(|&(count, avg)| count as f64 * avg).sum();
    (weighted_sum / total_count as f64, total_count)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_714_564_800; // 2024-05-01 12:00:00 UTC

    fn event(id: &str, location: &str, value: f64, bucket: i64, offset_secs: i64) -> Event {
        Event::new(
            id.to_string(),
            location.to_string(),
            value,
            ((bucket + offset_secs) * 1000) as f64,
        )
    }

    #[test]
    fn test_finalize_averages_only_matching_bucket() {
        let mut location = Location::new("L1", 0.0, 0.0);
        location.append(event("a", "L1", 4.0, T, 5));
        location.append(event("b", "L1", 6.0, T, 59));
        location.append(event("c", "L1", 100.0, T + 60, 0));

        let entry = location.finalize_bucket(T, 3600).clone();
        assert_eq!(entry.event_count, 2);
        assert_eq!(entry.average_value, 5.0);
        assert_eq!(entry.formatted_time, "01/05/2024 13:00:00");
        assert_eq!(location.latest_average_value(), 5.0);
        assert_eq!(location.latest_event_count(), 2);
    }

    #[test]
    fn test_empty_bucket_averages_to_zero() {
        let mut location = Location::new("L1", 0.0, 0.0);
        location.append(event("a", "L1", 4.0, T, 0));
        let entry = location.finalize_bucket(T + 120, 3600);
        assert_eq!(entry.event_count, 0);
        assert_eq!(entry.average_value, 0.0);
    }

    #[test]
    fn test_finalize_is_idempotent_and_leaves_other_buckets_alone() {
        let mut location = Location::new("L1", 0.0, 0.0);
        location.append(event("a", "L1", 2.0, T, 0));
        location.append(event("b", "L1", 8.0, T + 60, 0));

        let first = location.finalize_bucket(T, 3600).clone();
        let other = location.finalize_bucket(T + 60, 3600).clone();
        let again = location.finalize_bucket(T, 3600).clone();

        assert_eq!(first, again, "re-finalizing with unchanged events must not change the entry");
        assert_eq!(location.bucket_average(T + 60), Some(&other));
        assert_eq!(location.average_value_at_time().count(), 2);
        assert_eq!(location.events().len(), 2, "finalizing must not remove events");
    }

    #[test]
    fn test_history_is_chronological() {
        let mut location = Location::new("L1", 0.0, 0.0);
        location.finalize_bucket(T + 120, 0);
        location.finalize_bucket(T, 0);
        location.finalize_bucket(T + 60, 0);
        let starts: Vec<i64> = location.average_value_at_time().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![T, T + 60, T + 120]);
    }

    #[test]
    fn test_overall_average_covers_all_buckets() {
        let mut location = Location::new("L1", 0.0, 0.0);
        assert_eq!(location.overall_average_value(), 0.0);
        location.append(event("a", "L1", 1.0, T, 0));
        location.append(event("b", "L1", 2.0, T + 60, 0));
        location.append(event("c", "L1", 6.0, T + 600, 0));
        assert_eq!(location.overall_average_value(), 3.0);
        assert_eq!(location.event_count(), 3);
    }

    #[test]
    fn test_events_in_bucket_keeps_arrival_order() {
        let mut location = Location::new("L1", 0.0, 0.0);
        location.append(event("late", "L1", 1.0, T, 50));
        location.append(event("other", "L1", 2.0, T + 60, 0));
        location.append(event("early", "L1", 3.0, T, 1));
        let ids: Vec<&str> = location.events_in_bucket(T).map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["late", "early"]);
        assert_eq!(location.events_in_bucket(T - 60).count(), 0);
    }

    #[test]
    fn test_late_event_counts_overall_but_not_in_bucket() {
        let mut location = Location::new("L1", 0.0, 0.0);
        location.append(event("a", "L1", 2.0, T, 0));
        location.finalize_bucket(T, 3600);
        location.append_late(event("b", "L1", 10.0, T, 30));

        let entry = location.finalize_bucket(T, 3600).clone();
        assert_eq!(entry.event_count, 1, "late event must not reopen the bucket");
        assert_eq!(entry.average_value, 2.0);
        assert_eq!(location.events_in_bucket(T).count(), 1);
        assert_eq!(location.events().len(), 2);
        assert_eq!(location.overall_average_value(), 6.0);
    }

    #[test]
    fn test_weighted_global_average() {
        let (avg, count) = weighted_global_average(&[(2, 10.0), (3, 20.0)]);
        assert_eq!(count, 5);
        assert!((avg - 16.0).abs() < 1e-12, "expected 16.0, got {}", avg);
    }

    #[test]
    fn test_weighted_global_average_with_no_events_is_zero() {
        assert_eq!(weighted_global_average(&[(0, 0.0), (0, 0.0)]), (0.0, 0));
        assert_eq!(weighted_global_average(&[]), (0.0, 0));
    }

    #[test]
    fn test_ledger_keeps_manifest_order_and_finalizes_all() {
        let records = vec![
            LocationRecord { id: "L1".into(), x: 0.0, y: 0.0 },
            LocationRecord { id: "L2".into(), x: 10.0, y: 10.0 },
        ];
        let mut ledger = Ledger::from_records(&records);
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("L2"));
        assert!(!ledger.contains("L3"));

        ledger.get_mut("L1").unwrap().append(event("a", "L1", 4.0, T, 0));
        ledger.get_mut("L1").unwrap().append(event("b", "L1", 6.0, T, 10));
        ledger.get_mut("L2").unwrap().append(event("c", "L2", 10.0, T, 20));

        let pairs = ledger.finalize_all(T, 3600);
        assert_eq!(pairs, vec![(2, 5.0), (1, 10.0)]);
        let (global, count) = weighted_global_average(&pairs);
        assert_eq!(count, 3);
        assert!((global - 20.0 / 3.0).abs() < 1e-12);

        let ids: Vec<&str> = ledger.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "L2"]);
    }
}
