// src/shared_data.rs

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::data_structures::{IntersectionId, LightState, TrafficDensity};
use crate::optimizer::OptimizerStats;

/// Seconds since the Unix epoch; 0 if the system clock is before it.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub light: LightState,
}

/// Read-only view of one intersection after a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntersectionSnapshot {
    pub id: IntersectionId,
    pub name: String,
    pub groups: Vec<GroupSnapshot>,
    pub active_group: Option<usize>,
    pub phase_age_secs: f64,
    pub consecutive_green_count: u32,
    pub fairness_counter: u32,
    pub vehicle_count: u32,
    pub longest_wait_secs: f64,
    pub density: TrafficDensity,
    pub emergency: bool,
    pub incident: bool,
    pub sensor_degraded: bool,
    pub average_vehicle_count: f64,
    pub average_wait_secs: f64,
    pub last_green_secs: Option<f64>,
}

/// Intersections counted by the colour of their active group; all-red
/// intersections count as red.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalDistribution {
    pub green: usize,
    pub yellow: usize,
    pub red: usize,
}

impl SignalDistribution {
    pub fn add(&mut self, light: LightState) {
        match light {
            LightState::Green => self.green += 1,
            LightState::Yellow => self.yellow += 1,
            LightState::Red => self.red += 1,
        }
    }
}

/// What the controller publishes after each cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSnapshot {
    pub timestamp: u64,
    pub cycle: u64,
    pub intersections: Vec<IntersectionSnapshot>,
    pub distribution: SignalDistribution,
    pub optimizer: OptimizerStats,
    pub shut_down: bool,
}
