/// Message sources.
///
/// `MessageSource` is the seam between the ingestion loop and whatever
/// delivers messages. `PostgresQueue` is the production implementation: a
/// single table with visibility-timeout semantics, so a message that is
/// received but never deleted becomes visible again and is redelivered.
///
/// Schema: `sql/001_event_queue.sql`.

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};
use std::thread;
use std::time::{Duration, Instant};

use crate::logging::{self, Component};
use crate::model::MonitorError;

/// How often an empty queue is re-checked while a receive call waits.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One received message. `id` is the handle used to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: i64,
    pub body: String,
    pub enqueued_at: Option<DateTime<Utc>>,
}

pub trait MessageSource {
    /// Returns up to `max_messages` messages, blocking for at most `wait`
    /// when none are available. An empty batch is not an error.
    fn receive(&mut self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, MonitorError>;

    /// Deletes received messages from the source.
    fn acknowledge(&mut self, messages: &[QueueMessage]) -> Result<(), MonitorError>;

    /// Number of messages waiting, visible or not.
    fn depth(&mut self) -> Result<u64, MonitorError>;
}

// ---------------------------------------------------------------------------
// PostgreSQL-backed queue
// ---------------------------------------------------------------------------

const RECEIVE_SQL: &str = "
    WITH next AS (
        SELECT id
        FROM event_queue.messages
        WHERE queue_name = $1
          AND visible_at <= now()
        ORDER BY id
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    )
    UPDATE event_queue.messages m
    SET visible_at = now() + make_interval(secs => $3),
        receive_count = m.receive_count + 1
    FROM next
    WHERE m.id = next.id
    RETURNING m.id, m.body, m.enqueued_at
";

pub struct PostgresQueue {
    client: Client,
    queue_name: String,
    visibility_timeout: Duration,
}

impl PostgresQueue {
    /// Connects to the queue database and checks that the queue table exists.
    pub fn connect(
        database_url: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, MonitorError> {
        let mut client = Client::connect(database_url, NoTls)?;

        let row = client.query_one(
            "SELECT to_regclass('event_queue.messages') IS NOT NULL",
            &[],
        )?;
        let exists: bool = row.get(0);
        if !exists {
            return Err(MonitorError::Queue(
                "table event_queue.messages does not exist; apply sql/001_event_queue.sql".into(),
            ));
        }

        logging::info(
            Component::Queue,
            None,
            &format!("Connected to queue '{}'", queue_name),
        );

        Ok(PostgresQueue {
            client,
            queue_name: queue_name.to_string(),
            visibility_timeout,
        })
    }

    /// Enqueues one message body. Used by producers and tests.
    pub fn send(&mut self, body: &str) -> Result<i64, MonitorError> {
        let row = self.client.query_one(
            "INSERT INTO event_queue.messages (queue_name, body) VALUES ($1, $2) RETURNING id",
            &[&self.queue_name, &body],
        )?;
        Ok(row.get(0))
    }

    /// Deletes every message in this queue, visible or not.
    pub fn purge(&mut self) -> Result<u64, MonitorError> {
        let deleted = self.client.execute(
            "DELETE FROM event_queue.messages WHERE queue_name = $1",
            &[&self.queue_name],
        )?;
        Ok(deleted)
    }

    fn try_receive(&mut self, max_messages: usize) -> Result<Vec<QueueMessage>, MonitorError> {
        let limit = max_messages as i64;
        let visibility_secs = self.visibility_timeout.as_secs_f64();
        let rows = self.client.query(
            RECEIVE_SQL,
            &[&self.queue_name, &limit, &visibility_secs],
        )?;

        let mut messages: Vec<QueueMessage> = rows
            .iter()
            .map(|row| QueueMessage {
                id: row.get(0),
                body: row.get(1),
                enqueued_at: row.get(2),
            })
            .collect();
        // UPDATE ... RETURNING does not keep the CTE's order.
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }
}

impl MessageSource for PostgresQueue {
    fn receive(&mut self, max_messages: usize, wait: Duration) -> Result<Vec<QueueMessage>, MonitorError> {
        let deadline = Instant::now() + wait;
        loop {
            let messages = self.try_receive(max_messages)?;
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }
            thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn acknowledge(&mut self, messages: &[QueueMessage]) -> Result<(), MonitorError> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        self.client.execute(
            "DELETE FROM event_queue.messages WHERE queue_name = $1 AND id = ANY($2)",
            &[&self.queue_name, &ids],
        )?;
        Ok(())
    }

    fn depth(&mut self) -> Result<u64, MonitorError> {
        let row = self.client.query_one(
            "SELECT COUNT(*) FROM event_queue.messages WHERE queue_name = $1",
            &[&self.queue_name],
        )?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }
}
