/// Development mode message replay
///
/// When no live queue is available, use this module to replay a recorded
/// feed from a file: one message body per line (JSON-lines). Blank lines
/// are skipped. Acknowledged messages are removed; unacknowledged ones are
/// redelivered on the next receive, like a queue whose visibility timeout
/// has expired.
///
/// `run_replay` plays a feed on a `ReplayClock` instead of the wall clock:
/// time jumps to the newest event of each batch and moves on by the receive
/// wait whenever the feed has nothing to deliver. The run goes as fast as the
/// machine allows and every bucket is windowed as it was when recorded.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fs;
use std::thread;
use std::time::Duration;

use crate::analysis::window::{RunOutcome, Scheduler};
use crate::clock::ReplayClock;
use crate::ingest::intake::decode_message;
use crate::ingest::queue::{MessageSource, QueueMessage};
use crate::logging::{self, Component};
use crate::model::{AggregateRecord, MonitorError};

pub struct ReplaySource {
    pending: VecDeque<QueueMessage>,
    in_flight: Vec<QueueMessage>,
    /// Sleep for the full wait when the feed is exhausted, as a real
    /// long-poll would. Tests turn this off.
    block_when_empty: bool,
}

impl ReplaySource {
    /// Builds a source from message bodies, in delivery order.
    pub fn from_bodies<I, S>(bodies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pending = bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| QueueMessage {
                id: i as i64,
                body: body.into(),
                enqueued_at: None,
            })
            .collect();
        ReplaySource {
            pending,
            in_flight: Vec::new(),
            block_when_empty: true,
        }
    }

    /// Parses JSON-lines text: one message body per non-blank line.
    pub fn from_jsonl(text: &str) -> Self {
        Self::from_bodies(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        )
    }

    pub fn open(path: &str) -> Result<Self, MonitorError> {
        let text = fs::read_to_string(path)
            .map_err(|e| MonitorError::Queue(format!("cannot read replay file {}: {}", path, e)))?;
        Ok(Self::from_jsonl(&text))
    }

    pub fn non_blocking(mut self) -> Self {
        self.block_when_empty = false;
        self
    }

    pub fn remaining(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// Timestamp of the earliest decodable event still in the feed.
    pub fn earliest_event_time(&self) -> Option<DateTime<Utc>> {
        self.pending.iter().chain(&self.in_flight).filter_map(event_time).min()
    }
}

fn event_time(message: &QueueMessage) -> Option<DateTime<Utc>> {
    let decoded = decode_message(&message.body).ok()?;
    DateTime::from_timestamp_millis(decoded.timestamp_ms.floor() as i64)
}

impl MessageSource for ReplaySource {
    fn receive(&mut self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, MonitorError> {
        // Anything handed out earlier and never acknowledged goes back first.
        for message in self.in_flight.drain(..).rev() {
            self.pending.push_front(message);
        }

        let take = max_messages.min(self.pending.len());
        let batch: Vec<QueueMessage> = self.pending.drain(..take).collect();
        if batch.is_empty() && self.block_when_empty {
            thread::sleep(wait);
        }
        self.in_flight = batch.clone();
        Ok(batch)
    }

    fn acknowledge(&mut self, messages: &[QueueMessage]) -> Result<(), MonitorError> {
        self.in_flight.retain(|m| !messages.iter().any(|acked| acked.id == m.id));
        Ok(())
    }

    fn depth(&mut self) -> Result<u64, MonitorError> {
        Ok(self.remaining() as u64)
    }
}

// ---------------------------------------------------------------------------
// Paced replay
// ---------------------------------------------------------------------------

/// A `ReplaySource` that moves a `ReplayClock` as it delivers.
struct PacedReplay<'a> {
    source: ReplaySource,
    clock: &'a ReplayClock,
}

impl MessageSource for PacedReplay<'_> {
    fn receive(&mut self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, MonitorError> {
        let batch = self.source.receive(max_messages, Duration::ZERO)?;
        match batch.iter().filter_map(event_time).max() {
            Some(newest) => self.clock.advance_to(newest),
            None => {
                // An idle poll must still move time, or the run never ends.
                let step = chrono::Duration::from_std(wait.max(Duration::from_secs(1)))
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
                self.clock.advance_by(step);
            }
        }
        Ok(batch)
    }

    fn acknowledge(&mut self, messages: &[QueueMessage]) -> Result<(), MonitorError> {
        self.source.acknowledge(messages)
    }

    fn depth(&mut self) -> Result<u64, MonitorError> {
        self.source.depth()
    }
}

/// Runs `scheduler` over a recorded feed in recorded time, starting at the
/// feed's earliest event.
pub fn run_replay<F>(scheduler: Scheduler, source: ReplaySource, on_emit: F) -> Result<RunOutcome, MonitorError>
where
    F: FnMut(&AggregateRecord),
{
    let start = match source.earliest_event_time() {
        Some(start) => start,
        None => {
            logging::warn(Component::Queue, None, "Replay feed has no decodable events; starting at the current time");
            Utc::now()
        }
    };
    logging::info(Component::Queue, None, &format!("Replaying in recorded time from {}", start.to_rfc3339()));

    let clock = ReplayClock::starting_at(start);
    let mut paced = PacedReplay { source: source.non_blocking(), clock: &clock };
    scheduler.run(&mut paced, &clock, None, on_emit)
}
