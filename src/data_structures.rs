use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::global_variables::{DENSITY_HIGH_THRESHOLD, DENSITY_MEDIUM_THRESHOLD};

/// A unique identifier for an intersection, using (row, col) coordinates.
/// Ordering is row-major, which is what every deterministic tie-break relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IntersectionId(pub u8, pub u8);

impl fmt::Display for IntersectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.0, self.1)
    }
}

/// The compass side a stream of traffic arrives from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Approach {
    North,
    South,
    East,
    West,
}

/// A set of mutually non-conflicting approaches driven by one signal head.
/// Groups at the same intersection always conflict with each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproachGroup {
    pub name: String,
    pub approaches: Vec<Approach>,
}

impl ApproachGroup {
    pub fn new(name: &str, approaches: Vec<Approach>) -> Self {
        Self {
            name: name.to_string(),
            approaches,
        }
    }

    pub fn contains(&self, approach: Approach) -> bool {
        self.approaches.contains(&approach)
    }

    /// The usual two-phase layout: vertical traffic against horizontal traffic.
    pub fn two_phase() -> Vec<ApproachGroup> {
        vec![
            ApproachGroup::new("north_south", vec![Approach::North, Approach::South]),
            ApproachGroup::new("east_west", vec![Approach::East, Approach::West]),
        ]
    }
}

/// The possible states for a signal head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightState {
    Green,
    Yellow,
    Red,
}

/// One frame's mean brightness of the red and blue channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorSample {
    pub red: f64,
    pub blue: f64,
}

impl ColorSample {
    pub fn new(red: f64, blue: f64) -> Self {
        Self { red, blue }
    }
}

/// Demand observed on a single approach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproachDemand {
    pub approach: Approach,
    pub vehicle_count: u32,
    /// Average wait of queued vehicles, in seconds.
    pub wait_secs: f64,
}

/// Coarse congestion band, kept for the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficDensity {
    Low,
    Medium,
    High,
}

impl TrafficDensity {
    pub fn classify(vehicle_count: u32) -> Self {
        if vehicle_count >= DENSITY_HIGH_THRESHOLD {
            TrafficDensity::High
        } else if vehicle_count >= DENSITY_MEDIUM_THRESHOLD {
            TrafficDensity::Medium
        } else {
            TrafficDensity::Low
        }
    }
}

/// Per-intersection demand for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandSample {
    pub intersection: IntersectionId,
    pub approaches: Vec<ApproachDemand>,
    pub emergency: bool,
    pub emergency_approach: Option<Approach>,
    /// The intersection is blocked; it is held red until the incident clears.
    #[serde(default)]
    pub incident: bool,
}

impl DemandSample {
    /// The fail-open reading used whenever a sample is missing or unusable.
    pub fn zero(intersection: IntersectionId) -> Self {
        Self {
            intersection,
            approaches: Vec::new(),
            emergency: false,
            emergency_approach: None,
            incident: false,
        }
    }

    pub fn total_vehicles(&self) -> u32 {
        self.approaches
            .iter()
            .fold(0u32, |acc, a| acc.saturating_add(a.vehicle_count))
    }

    /// Longest average wait over all approaches.
    pub fn longest_wait(&self) -> f64 {
        self.approaches
            .iter()
            .map(|a| a.wait_secs)
            .fold(0.0, f64::max)
    }

    pub fn has_demand(&self) -> bool {
        self.total_vehicles() > 0 || self.longest_wait() > 0.0
    }

    pub fn density(&self) -> TrafficDensity {
        TrafficDensity::classify(self.total_vehicles())
    }

    /// Vehicle count and longest wait restricted to one approach group.
    pub fn group_demand(&self, group: &ApproachGroup) -> (u32, f64) {
        self.approaches
            .iter()
            .filter(|a| group.contains(a.approach))
            .fold((0u32, 0.0f64), |(count, wait), a| {
                (count.saturating_add(a.vehicle_count), wait.max(a.wait_secs))
            })
    }

    /// Checks that waits are finite and non-negative and that no approach is
    /// reported twice.
    pub fn is_well_formed(&self) -> bool {
        let mut seen = HashSet::new();
        self.approaches
            .iter()
            .all(|a| a.wait_secs.is_finite() && a.wait_secs >= 0.0 && seen.insert(a.approach))
    }
}
