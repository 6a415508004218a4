use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::data_structures::IntersectionId;
use crate::errors::MonitoringError;
use crate::shared_data::NetworkSnapshot;

/// Hands each cycle's snapshot to something outside the controller.
/// Runs on a blocking thread, so implementations may do plain I/O.
pub trait SnapshotPublisher: Send {
    fn publish(&mut self, snapshot: &NetworkSnapshot) -> Result<(), MonitoringError>;
}

/// One CSV line per intersection per cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRow {
    pub timestamp: u64,
    pub cycle: u64,
    pub intersection: String,
    pub lights: String,
    pub active_group: Option<usize>,
    pub phase_age_secs: f64,
    pub fairness_counter: u32,
    pub vehicle_count: u32,
    pub longest_wait_secs: f64,
    pub emergency: bool,
    pub sensor_degraded: bool,
    pub winner: bool,
    pub incident: bool,
}

impl SnapshotRow {
    pub fn from_snapshot(snapshot: &NetworkSnapshot) -> Vec<SnapshotRow> {
        let winner: Option<IntersectionId> = snapshot.optimizer.last_winner;
        snapshot
            .intersections
            .iter()
            .map(|ix| SnapshotRow {
                timestamp: snapshot.timestamp,
                cycle: snapshot.cycle,
                intersection: ix.id.to_string(),
                lights: ix
                    .groups
                    .iter()
                    .map(|g| format!("{}={:?}", g.name, g.light))
                    .collect::<Vec<_>>()
                    .join(" "),
                active_group: ix.active_group,
                phase_age_secs: ix.phase_age_secs,
                fairness_counter: ix.fairness_counter,
                vehicle_count: ix.vehicle_count,
                longest_wait_secs: ix.longest_wait_secs,
                emergency: ix.emergency,
                sensor_degraded: ix.sensor_degraded,
                winner: winner == Some(ix.id),
                incident: ix.incident,
            })
            .collect()
    }
}

// Appends a record, writing the header only when the file is new.
fn log_to_csv<T: Serialize>(path: &Path, record: &T) -> Result<(), MonitoringError> {
    let file_exists = path.exists();
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);
    wtr.serialize(record)?;
    wtr.flush()?;
    Ok(())
}

/// Appends snapshots to a CSV log.
#[derive(Debug, Clone)]
pub struct CsvPublisher {
    path: PathBuf,
}

impl CsvPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotPublisher for CsvPublisher {
    fn publish(&mut self, snapshot: &NetworkSnapshot) -> Result<(), MonitoringError> {
        for row in SnapshotRow::from_snapshot(snapshot) {
            log_to_csv(&self.path, &row)?;
        }
        Ok(())
    }
}
