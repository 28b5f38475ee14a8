/// Structured logging for the event monitoring service
///
/// Provides context-rich logging with component tags, optional location
/// identifiers, timestamps, and severity levels. Supports both console
/// output and file-based logging for long unattended runs.

use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use crate::analysis::window::RunStats;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Parses a level name from configuration. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<LogLevel> {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Intake,
    Ledger,
    Scheduler,
    Queue,
    Manifest,
    Localizer,
    Report,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Intake => write!(f, "INTAKE"),
            Component::Ledger => write!(f, "LEDGER"),
            Component::Scheduler => write!(f, "SCHED"),
            Component::Queue => write!(f, "QUEUE"),
            Component::Manifest => write!(f, "MANIFEST"),
            Component::Localizer => write!(f, "LOCATE"),
            Component::Report => write!(f, "REPORT"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - transient, the message will be redelivered
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) {
        let logger = Logger {
            min_level,
            log_file,
            console_timestamps,
        };

        if let Ok(mut slot) = LOGGER.lock() {
            *slot = Some(logger);
        }
    }

    fn format_entry(level: LogLevel, component: &Component, location_id: Option<&str>, message: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let location_part = location_id.map(|s| format!(" [{}]", s)).unwrap_or_default();
        format!("{} {} {}{}: {}", timestamp, level, component, location_part, message)
    }

    fn log(&self, level: LogLevel, component: &Component, location_id: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let log_entry = Self::format_entry(level, component, location_id, message);
        let location_part = location_id.map(|s| format!(" [{}]", s)).unwrap_or_default();

        // Console output
        if self.console_timestamps {
            match level {
                LogLevel::Error | LogLevel::Warning => eprintln!("{}", log_entry),
                LogLevel::Info | LogLevel::Debug => println!("{}", log_entry),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", component, location_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", component, location_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}{}: {}", component, location_part, message),
            }
        }

        // File output
        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    Logger::init(min_level, log_file.map(String::from), console_timestamps);
}

fn dispatch(level: LogLevel, component: Component, location_id: Option<&str>, message: &str) {
    if let Ok(guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_ref() {
            logger.log(level, &component, location_id, message);
        }
    }
}

/// Log a general informational message
pub fn info(component: Component, location_id: Option<&str>, message: &str) {
    dispatch(LogLevel::Info, component, location_id, message);
}

/// Log a warning message
pub fn warn(component: Component, location_id: Option<&str>, message: &str) {
    dispatch(LogLevel::Warning, component, location_id, message);
}

/// Log an error message
pub fn error(component: Component, location_id: Option<&str>, message: &str) {
    dispatch(LogLevel::Error, component, location_id, message);
}

/// Log a debug message
pub fn debug(component: Component, location_id: Option<&str>, message: &str) {
    dispatch(LogLevel::Debug, component, location_id, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a message-source failure based on the error text
pub fn classify_queue_failure(error_message: &str) -> FailureType {
    let lower = error_message.to_ascii_lowercase();

    // Lock contention and statement timeouts clear up on their own; the
    // message becomes visible again and is deduplicated on redelivery. A
    // dropped connection does not: the client has to be rebuilt.
    if lower.contains("deadlock") || lower.contains("could not obtain lock") || lower.contains("timeout") {
        FailureType::Expected
    }
    else if lower.contains("connection") || lower.contains("closed") {
        FailureType::Unexpected
    }
    else if lower.contains("does not exist") || lower.contains("permission denied") {
        FailureType::Unexpected
    }
    else {
        FailureType::Unknown
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a message-source failure with automatic classification
pub fn log_queue_failure(operation: &str, err: &dyn std::error::Error) {
    let error_msg = err.to_string();
    let failure_type = classify_queue_failure(&error_msg);

    let message = format!(
        "{} failed [{}]: {}",
        operation,
        failure_type,
        error_msg
    );

    match failure_type {
        FailureType::Expected => debug(Component::Queue, None, &message),
        FailureType::Unexpected => error(Component::Queue, None, &message),
        FailureType::Unknown => warn(Component::Queue, None, &message),
    }
}

// ---------------------------------------------------------------------------
// Run Summary Logging
// ---------------------------------------------------------------------------

/// Picks the level for a run summary: clean runs are informational, runs
/// that received nothing usable are errors, anything in between warns.
pub fn summary_level(stats: &RunStats) -> LogLevel {
    let rejected = stats.duplicates + stats.unknown_location + stats.malformed + stats.expired;
    if stats.received > 0 && stats.accepted == 0 {
        LogLevel::Error
    } else if stats.ack_failures > 0 || stats.malformed > 0 || rejected > stats.accepted {
        LogLevel::Warning
    } else {
        LogLevel::Info
    }
}

/// Log a summary of an ingestion run
pub fn log_run_summary(stats: &RunStats) {
    let message = format!(
        "Ingestion complete: {}/{} messages accepted ({} duplicate, {} unknown location, {} malformed, {} expired, {} late), {} aggregates emitted, {} ack failures",
        stats.accepted,
        stats.received,
        stats.duplicates,
        stats.unknown_location,
        stats.malformed,
        stats.expired,
        stats.late_events,
        stats.emitted,
        stats.ack_failures
    );

    match summary_level(stats) {
        LogLevel::Error => error(Component::Scheduler, None, &message),
        LogLevel::Warning => warn(Component::Scheduler, None, &message),
        _ => info(Component::Scheduler, None, &message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse(" warn "), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("loud"), None);
    }

    #[test]
    fn test_entry_format_includes_component_and_location() {
        let entry = Logger::format_entry(LogLevel::Warning, &Component::Ledger, Some("L1"), "empty bucket");
        assert!(entry.ends_with("WARN LEDGER [L1]: empty bucket"), "got {}", entry);
    }

    #[test]
    fn test_failure_classification() {
        let result = classify_queue_failure("Queue error: canceling statement due to lock timeout");
        assert_eq!(result, FailureType::Expected);

        let result = classify_queue_failure("Queue error: deadlock detected");
        assert_eq!(result, FailureType::Expected);

        let result = classify_queue_failure("Queue error: connection closed");
        assert_eq!(result, FailureType::Unexpected, "a dropped connection does not recover by itself");

        let result = classify_queue_failure("Queue error: relation \"event_queue.messages\" does not exist");
        assert_eq!(result, FailureType::Unexpected);

        let result = classify_queue_failure("something odd");
        assert_eq!(result, FailureType::Unknown);
    }

    #[test]
    fn test_summary_level() {
        let clean = RunStats { received: 10, accepted: 10, emitted: 3, ..RunStats::default() };
        assert_eq!(summary_level(&clean), LogLevel::Info);

        let with_ack_failure = RunStats { ack_failures: 1, ..clean.clone() };
        assert_eq!(summary_level(&with_ack_failure), LogLevel::Warning);

        let nothing_usable = RunStats { received: 4, malformed: 4, ..RunStats::default() };
        assert_eq!(summary_level(&nothing_usable), LogLevel::Error);

        let idle = RunStats::default();
        assert_eq!(summary_level(&idle), LogLevel::Info);
    }
}
