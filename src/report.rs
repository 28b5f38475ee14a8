//! End-of-run exports.
//!
//! - `output.csv`: per-location bucket history. Each location takes two
//!   columns (`id, x, "time", t1, t2, ...` and `"", y, "average value",
//!   v1, v2, ...`), written row by row.
//! - `grid.csv`: every scored localization cell, best first.
//! - `summary.json`: run statistics, emitted aggregates, per-location
//!   totals and the source estimate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};

use crate::analysis::localize::{Bounds, Localization};
use crate::analysis::window::{RunOutcome, RunStats};
use crate::config::OutputConfig;
use crate::ledger::Ledger;
use crate::logging::{self, Component};
use crate::model::{AggregateRecord, MonitorError, PotentialSource};

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// Quotes a CSV field when it contains a delimiter, quote, or line break.
pub fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_csv_row<W: Write>(writer: &mut W, fields: &[&str]) -> io::Result<()> {
    let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    writeln!(writer, "{}", line.join(","))
}

/// The two columns each location contributes to the series export.
pub fn series_columns(ledger: &Ledger) -> Vec<Vec<String>> {
    let mut columns = Vec::with_capacity(ledger.len() * 2);
    for location in ledger.iter() {
        let mut times = vec![location.id.clone(), location.x.to_string(), "time".to_string()];
        let mut values = vec![String::new(), location.y.to_string(), "average value".to_string()];
        for entry in location.average_value_at_time() {
            times.push(entry.formatted_time.clone());
            values.push(entry.average_value.to_string());
        }
        columns.push(times);
        columns.push(values);
    }
    columns
}

/// Writes the per-location series. Columns shorter than the longest are
/// padded with empty cells rather than truncating the others.
pub fn write_series_csv<W: Write>(ledger: &Ledger, writer: &mut W) -> io::Result<()> {
    let columns = series_columns(ledger);
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    for row in 0..rows {
        let fields: Vec<&str> = columns
            .iter()
            .map(|column| column.get(row).map(String::as_str).unwrap_or(""))
            .collect();
        write_csv_row(writer, &fields)?;
    }
    Ok(())
}

pub fn write_grid_csv<W: Write>(grid: &[PotentialSource], writer: &mut W) -> io::Result<()> {
    writeln!(writer, "x,y,value")?;
    for cell in grid {
        writeln!(writer, "{},{},{}", cell.x, cell.y, cell.value)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LocationSummary {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub event_count: usize,
    pub overall_average_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub generated_at: String,
    pub stats: RunStats,
    pub estimate: Option<PotentialSource>,
    pub bounds: Option<Bounds>,
    pub locations: Vec<LocationSummary>,
    pub aggregates: Vec<AggregateRecord>,
}

pub fn build_summary(
    outcome: &RunOutcome,
    localization: Option<&Localization>,
    generated_at: DateTime<Utc>,
) -> RunSummary {
    RunSummary {
        generated_at: generated_at.to_rfc3339(),
        stats: outcome.stats.clone(),
        estimate: localization.map(|l| l.best),
        bounds: localization.map(|l| l.bounds),
        locations: outcome
            .ledger
            .iter()
            .map(|location| LocationSummary {
                id: location.id.clone(),
                x: location.x,
                y: location.y,
                event_count: location.event_count(),
                overall_average_value: location.overall_average_value(),
            })
            .collect(),
        aggregates: outcome.records.clone(),
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn create(path: &str) -> Result<BufWriter<File>, MonitorError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| MonitorError::Io(format!("cannot create {}: {}", path, e)))
}

/// Writes every configured export for a finished run.
pub fn write_reports(
    config: &OutputConfig,
    outcome: &RunOutcome,
    localization: Option<&Localization>,
) -> Result<(), MonitorError> {
    let mut series = create(&config.series_csv)?;
    write_series_csv(&outcome.ledger, &mut series)?;
    series.flush()?;
    logging::info(Component::Report, None, &format!("Wrote location series to {}", config.series_csv));

    if let (Some(path), Some(localization)) = (&config.grid_csv, localization) {
        let mut grid = create(path)?;
        write_grid_csv(&localization.grid, &mut grid)?;
        grid.flush()?;
        logging::info(Component::Report, None, &format!("Wrote {} grid cells to {}", localization.grid.len(), path));
    }

    if let Some(path) = &config.summary_json {
        let summary = build_summary(outcome, localization, Utc::now());
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .map_err(|e| MonitorError::Io(format!("cannot write {}: {}", path, e)))?;
        logging::info(Component::Report, None, &format!("Wrote run summary to {}", path));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
