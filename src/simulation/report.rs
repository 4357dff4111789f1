//! Run summary sinks: a JSON document per run, a cumulative CSV shared by
//! several runs (one `avg_PRR,avg_latency_ms` row appended per run) and a
//! per-vehicle reception CSV rewritten by each run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use super::runner::RunSummary;
use crate::supervisor::ReceptionStats;

pub const CUMULATIVE_CSV_HEADER: &str = "avg_PRR,avg_latency_ms";
pub const VEHICLE_CSV_HEADER: &str = "vehicle_id,received,lost,prr,avg_latency_ms,max_latency_ms";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub fn write_summary_json(path: &Path, summary: &RunSummary) -> Result<(), ReportError> {
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(path, json).map_err(io_error(path))
}

/// Append one row to the cumulative CSV, writing the header first if the file is new or empty.
/// Runs without supervision data leave the fields empty.
pub fn append_cumulative_csv(path: &Path, summary: &RunSummary) -> Result<(), ReportError> {
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io_error(path))?;

    let mut rows = String::new();
    if needs_header {
        rows.push_str(CUMULATIVE_CSV_HEADER);
        rows.push('\n');
    }
    rows.push_str(&csv_row(summary));
    rows.push('\n');
    file.write_all(rows.as_bytes()).map_err(io_error(path))
}

/// Write one row per vehicle seen by the supervisor, ordered by vehicle id.
/// Without supervision only the header is written.
pub fn write_vehicle_csv(path: &Path, summary: &RunSummary) -> Result<(), ReportError> {
    let mut content = String::from(VEHICLE_CSV_HEADER);
    content.push('\n');
    for (vehicle, stats) in summary.reception.iter().flat_map(|r| r.per_vehicle.iter()) {
        content.push_str(&vehicle_row(vehicle, stats));
        content.push('\n');
    }
    fs::write(path, content).map_err(io_error(path))
}

fn field(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

fn csv_row(summary: &RunSummary) -> String {
    format!("{},{}", field(summary.avg_prr), field(summary.avg_latency_ms))
}

fn vehicle_row(vehicle: &str, stats: &ReceptionStats) -> String {
    let max_latency_ms = (stats.received > 0).then(|| stats.max_latency_us as f64 / 1000.0);
    format!(
        "{},{},{},{},{},{}",
        vehicle,
        stats.received,
        stats.lost,
        field(stats.reception_ratio()),
        field(stats.average_latency_ms()),
        field(max_latency_ms)
    )
}
