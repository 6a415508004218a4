use log::warn;
use std::collections::VecDeque;

use crate::config::IntersectionConfig;
use crate::control_system::signal_state::{SignalStateMachine, SignalTimings};
use crate::data_structures::{ColorSample, DemandSample, IntersectionId};
use crate::errors::SensorError;
use crate::sensors::{EmergencyDetector, SensorReading};

/// Rolling per-intersection demand window.
#[derive(Debug)]
pub struct DemandHistory {
    pub capacity: usize,
    pub vehicle_history: VecDeque<u32>,
    pub wait_history: VecDeque<f64>,
}

impl DemandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            vehicle_history: VecDeque::with_capacity(capacity),
            wait_history: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: &DemandSample) {
        while self.vehicle_history.len() >= self.capacity {
            self.vehicle_history.pop_front();
            self.wait_history.pop_front();
        }
        self.vehicle_history.push_back(sample.total_vehicles());
        self.wait_history.push_back(sample.longest_wait());
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.vehicle_history.len() > capacity {
            self.vehicle_history.pop_front();
            self.wait_history.pop_front();
        }
    }

    pub fn average_vehicle_count(&self) -> f64 {
        if self.vehicle_history.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.vehicle_history.iter().map(|&v| u64::from(v)).sum();
        sum as f64 / self.vehicle_history.len() as f64
    }

    pub fn average_wait(&self) -> f64 {
        if self.wait_history.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.wait_history.iter().sum();
        sum / self.wait_history.len() as f64
    }
}

/// One controlled intersection: its layout, its signal, and everything the
/// optimizer needs to remember about it between cycles.
#[derive(Debug)]
pub struct Intersection {
    pub layout: IntersectionConfig,
    pub signal: SignalStateMachine,
    pub fairness_counter: u32,
    pub history: DemandHistory,
    /// Set by an operator; keeps the intersection out of arbitration.
    pub incident_reported: bool,
    color_window: VecDeque<ColorSample>,
    color_capacity: usize,
    latest_reading: Option<Result<DemandSample, SensorError>>,
    last_demand: Option<DemandSample>,
    sensor_degraded: bool,
}

impl Intersection {
    pub fn new(
        layout: IntersectionConfig,
        timings: SignalTimings,
        history_capacity: usize,
        color_capacity: usize,
    ) -> Self {
        let signal = SignalStateMachine::new(layout.id, layout.groups.len(), timings);
        Self {
            layout,
            signal,
            fairness_counter: 0,
            history: DemandHistory::new(history_capacity),
            incident_reported: false,
            color_window: VecDeque::with_capacity(color_capacity),
            color_capacity,
            latest_reading: None,
            last_demand: None,
            sensor_degraded: false,
        }
    }

    pub fn id(&self) -> IntersectionId {
        self.layout.id
    }

    pub fn last_demand(&self) -> Option<&DemandSample> {
        self.last_demand.as_ref()
    }

    pub fn sensor_degraded(&self) -> bool {
        self.sensor_degraded
    }

    /// Blocked by an operator report or by the last sensor reading.
    pub fn has_incident(&self) -> bool {
        self.incident_reported || self.last_demand.as_ref().is_some_and(|d| d.incident)
    }

    pub fn color_window(&self) -> impl Iterator<Item = &ColorSample> {
        self.color_window.iter()
    }

    pub fn set_color_capacity(&mut self, capacity: usize) {
        self.color_capacity = capacity;
        while self.color_window.len() > capacity {
            self.color_window.pop_front();
        }
    }

    /// Stores a fresh reading and runs flasher detection over the colour
    /// window. Replaces any reading not yet consumed by a cycle.
    pub fn record_reading(&mut self, reading: SensorReading, detector: &EmergencyDetector) {
        for frame in reading.colors {
            if self.color_window.len() == self.color_capacity {
                self.color_window.pop_front();
            }
            self.color_window.push_back(frame);
        }
        let window: Vec<ColorSample> = self.color_window.iter().copied().collect();
        let emergency = detector.detect(&window);

        let mut demand = reading.demand;
        demand.emergency = emergency;
        demand.emergency_approach = if emergency {
            reading.emergency_approach
        } else {
            None
        };
        self.latest_reading = Some(Ok(demand));
    }

    pub fn record_failure(&mut self, err: SensorError) {
        warn!("{}", err);
        self.latest_reading = Some(Err(err));
    }

    /// Consumes the latest reading for an optimization cycle. Anything
    /// missing, failed or malformed becomes zero demand.
    pub fn take_cycle_demand(&mut self) -> DemandSample {
        let id = self.id();
        let mut demand = match self.latest_reading.take() {
            Some(Ok(sample)) if self.is_usable(&sample) => {
                self.sensor_degraded = false;
                sample
            }
            Some(Ok(_)) => {
                warn!(
                    "Malformed demand sample for intersection {}, using zero demand",
                    id
                );
                self.sensor_degraded = true;
                DemandSample::zero(id)
            }
            Some(Err(_)) => {
                // Already logged when the failure was recorded.
                self.sensor_degraded = true;
                DemandSample::zero(id)
            }
            None => {
                warn!(
                    "No demand sample for intersection {} this cycle, using zero demand",
                    id
                );
                self.sensor_degraded = true;
                DemandSample::zero(id)
            }
        };
        demand.incident |= self.incident_reported;
        self.history.push(&demand);
        self.last_demand = Some(demand.clone());
        demand
    }

    fn is_usable(&self, sample: &DemandSample) -> bool {
        let known = |a| self.layout.groups.iter().any(|g| g.contains(a));
        sample.intersection == self.id()
            && sample.is_well_formed()
            && sample.approaches.iter().all(|d| known(d.approach))
            && sample.emergency_approach.map_or(true, known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{grid_topology, TimingConfig};
    use crate::data_structures::{Approach, ApproachDemand, ApproachGroup};

    fn intersection() -> Intersection {
        Intersection::new(
            grid_topology(1, 1).remove(0),
            SignalTimings::from_config(&TimingConfig::default()),
            3,
            4,
        )
    }

    fn reading(count: u32, colors: Vec<ColorSample>) -> SensorReading {
        SensorReading {
            demand: DemandSample {
                intersection: IntersectionId(0, 0),
                approaches: vec![ApproachDemand {
                    approach: Approach::North,
                    vehicle_count: count,
                    wait_secs: 4.0,
                }],
                emergency: false,
                emergency_approach: None,
                incident: false,
            },
            colors,
            emergency_approach: Some(Approach::North),
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut history = DemandHistory::new(2);
        for count in [10, 20, 30] {
            let mut sample = DemandSample::zero(IntersectionId(0, 0));
            sample.approaches.push(ApproachDemand {
                approach: Approach::East,
                vehicle_count: count,
                wait_secs: 1.0,
            });
            history.push(&sample);
        }
        assert_eq!(history.vehicle_history.len(), 2);
        assert_eq!(history.average_vehicle_count(), 25.0);
        assert_eq!(history.average_wait(), 1.0);
    }

    #[test]
    fn flashers_set_the_emergency_flag_and_origin() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();
        ix.record_reading(
            reading(
                3,
                vec![ColorSample::new(10.0, 10.0), ColorSample::new(200.0, 200.0)],
            ),
            &detector,
        );
        let demand = ix.take_cycle_demand();
        assert!(demand.emergency);
        assert_eq!(demand.emergency_approach, Some(Approach::North));
        assert!(!ix.sensor_degraded());
    }

    #[test]
    fn origin_hint_is_dropped_without_detection() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();
        ix.record_reading(reading(3, vec![ColorSample::new(50.0, 50.0)]), &detector);
        let demand = ix.take_cycle_demand();
        assert!(!demand.emergency);
        assert_eq!(demand.emergency_approach, None);
    }

    #[test]
    fn color_window_keeps_only_recent_frames() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();
        let frames = (0..6).map(|i| ColorSample::new(i as f64, 0.0)).collect();
        ix.record_reading(reading(1, frames), &detector);
        let reds: Vec<f64> = ix.color_window().map(|c| c.red).collect();
        assert_eq!(reds, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn failed_missing_and_malformed_readings_become_zero_demand() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();

        ix.record_failure(SensorError::Unavailable {
            intersection: ix.id(),
            reason: "offline".to_string(),
        });
        assert_eq!(ix.take_cycle_demand(), DemandSample::zero(ix.id()));
        assert!(ix.sensor_degraded());

        assert_eq!(ix.take_cycle_demand(), DemandSample::zero(ix.id()));

        let mut bad = reading(5, vec![]);
        bad.demand.approaches[0].wait_secs = -1.0;
        ix.record_reading(bad, &detector);
        assert_eq!(ix.take_cycle_demand(), DemandSample::zero(ix.id()));

        ix.record_reading(reading(5, vec![]), &detector);
        assert_eq!(ix.take_cycle_demand().total_vehicles(), 5);
        assert!(!ix.sensor_degraded());
        assert_eq!(ix.history.vehicle_history.len(), 3);
    }

    #[test]
    fn reported_incident_marks_every_cycle_until_cleared() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();
        ix.incident_reported = true;
        ix.record_reading(reading(5, vec![]), &detector);
        let demand = ix.take_cycle_demand();
        assert!(demand.incident);
        assert_eq!(demand.total_vehicles(), 5);
        assert!(ix.take_cycle_demand().incident);
        assert!(ix.has_incident());

        ix.incident_reported = false;
        ix.record_reading(reading(5, vec![]), &detector);
        assert!(!ix.take_cycle_demand().incident);
        assert!(!ix.has_incident());
    }

    #[test]
    fn sensor_reported_incident_passes_through() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();
        let mut blocked = reading(2, vec![]);
        blocked.demand.incident = true;
        ix.record_reading(blocked, &detector);
        assert!(ix.take_cycle_demand().incident);
        assert!(ix.has_incident());
    }

    #[test]
    fn approaches_outside_the_layout_are_malformed() {
        let detector = EmergencyDetector::new(150.0, 100.0);
        let mut ix = intersection();
        ix.layout.groups = vec![ApproachGroup::new("only_east", vec![Approach::East])];
        ix.record_reading(reading(5, vec![]), &detector);
        assert_eq!(ix.take_cycle_demand().total_vehicles(), 0);
    }
}
