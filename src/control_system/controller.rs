use log::{info, warn};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::communication::{ManualOverride, OverrideAction};
use crate::config::{ControlConfig, IntersectionConfig};
use crate::control_system::intersection::Intersection;
use crate::control_system::signal_state::{
    log_rejection, SignalCommand, SignalStateMachine, SignalTimings,
};
use crate::data_structures::{DemandSample, IntersectionId, LightState, TrafficDensity};
use crate::errors::{ConfigError, ControlError, SensorError, SignalError};
use crate::optimizer::{CycleInput, CyclePlan, Decision, OptimizerStats, PhaseView, TrafficOptimizer};
use crate::sensors::{EmergencyDetector, SensorReading, SensorSampler};
use crate::shared_data::{
    current_timestamp, GroupSnapshot, IntersectionSnapshot, NetworkSnapshot, SignalDistribution,
};

/// Every controlled intersection plus the optimizer that arbitrates between
/// them. The control loop wraps one of these in a mutex.
pub struct SignalNetwork {
    config: ControlConfig,
    detector: EmergencyDetector,
    intersections: BTreeMap<IntersectionId, Intersection>,
    optimizer: TrafficOptimizer,
    cycle: u64,
    shut_down: bool,
}

fn phase_view(signal: &SignalStateMachine) -> PhaseView {
    PhaseView {
        active_group: signal.active_group(),
        active_light: signal.active_light(),
        phase_age_secs: signal.phase_age().as_secs_f64(),
    }
}

impl SignalNetwork {
    pub fn new(config: ControlConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let timings = SignalTimings::from_config(&config.timing);
        let intersections = config
            .intersections
            .iter()
            .map(|layout| {
                let intersection = Intersection::new(
                    layout.clone(),
                    timings,
                    config.optimization.demand_history_capacity,
                    config.detection.color_window,
                );
                (layout.id, intersection)
            })
            .collect();
        info!(
            "Signal network ready with {} intersections",
            config.intersections.len()
        );
        Ok(Self {
            detector: EmergencyDetector::from_config(&config.detection),
            optimizer: TrafficOptimizer::new(config.optimization.clone()),
            intersections,
            config,
            cycle: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn intersection(&self, id: IntersectionId) -> Option<&Intersection> {
        self.intersections.get(&id)
    }

    pub fn intersections(&self) -> impl Iterator<Item = &Intersection> {
        self.intersections.values()
    }

    pub fn optimizer_stats(&self) -> &OptimizerStats {
        self.optimizer.stats()
    }

    fn intersection_mut(&mut self, id: IntersectionId) -> Result<&mut Intersection, ControlError> {
        self.intersections
            .get_mut(&id)
            .ok_or(ControlError::UnknownIntersection(id))
    }

    /// Stores one sensor result for the next cycle.
    pub fn record_reading(
        &mut self,
        id: IntersectionId,
        reading: Result<SensorReading, SensorError>,
    ) -> Result<(), ControlError> {
        let detector = self.detector;
        let intersection = self.intersection_mut(id)?;
        match reading {
            Ok(reading) => intersection.record_reading(reading, &detector),
            Err(err) => intersection.record_failure(err),
        }
        Ok(())
    }

    /// Layouts of every intersection, for sampling without holding the
    /// network. Empty once shut down.
    pub fn layouts(&self) -> Vec<IntersectionConfig> {
        if self.shut_down {
            return Vec::new();
        }
        self.intersections
            .values()
            .map(|ix| ix.layout.clone())
            .collect()
    }

    /// Polls the sampler once for every intersection, holding `self` for
    /// the whole pass.
    pub fn sample_all(&mut self, sampler: &mut dyn SensorSampler) {
        if self.shut_down {
            return;
        }
        let detector = self.detector;
        for intersection in self.intersections.values_mut() {
            match sampler.sample(&intersection.layout) {
                Ok(reading) => intersection.record_reading(reading, &detector),
                Err(err) => intersection.record_failure(err),
            }
        }
    }

    /// One optimization cycle over a single snapshot of every intersection.
    /// Decisions are queued on the signal machines, which execute them only
    /// as fast as their timing rules allow.
    pub fn run_optimization_cycle(&mut self) -> Result<CyclePlan, ControlError> {
        if self.shut_down {
            return Err(ControlError::ShutDown);
        }

        let demands: Vec<(IntersectionId, DemandSample)> = self
            .intersections
            .values_mut()
            .map(|ix| (ix.id(), ix.take_cycle_demand()))
            .collect();

        let inputs: Vec<CycleInput> = demands
            .iter()
            .map(|(id, demand)| {
                let ix = &self.intersections[id];
                CycleInput {
                    id: *id,
                    groups: &ix.layout.groups,
                    demand,
                    phase: phase_view(&ix.signal),
                    fairness_counter: ix.fairness_counter,
                }
            })
            .collect();
        let plan = self.optimizer.optimize(&inputs);

        for decision in &plan.decisions {
            let Some(ix) = self.intersections.get_mut(&decision.intersection) else {
                continue;
            };
            ix.fairness_counter = decision.fairness_counter;
            let command = match decision.decision {
                Decision::Grant { group, emergency } => SignalCommand::Grant { group, emergency },
                Decision::Revoke => SignalCommand::Revoke,
                Decision::NoChange => continue,
            };
            if let Err(err) = ix.signal.submit(command) {
                log_rejection(&err);
            }
        }

        self.cycle += 1;
        Ok(plan)
    }

    /// Advances every signal by `dt` and checks the safety invariant.
    /// Returns the faults found; each faulted intersection is already red.
    pub fn tick(&mut self, dt: Duration) -> Vec<SignalError> {
        if self.shut_down {
            return Vec::new();
        }
        let mut faults = Vec::new();
        for intersection in self.intersections.values_mut() {
            intersection.signal.tick(dt);
            if let Err(err) = intersection.signal.verify_safety() {
                log_rejection(&err);
                faults.push(err);
            }
        }
        faults
    }

    /// Applies an operator override through the normal transition rules.
    /// The request is queued; timing rules decide when lights change.
    pub fn apply_override(&mut self, request: &ManualOverride) -> Result<(), ControlError> {
        if self.shut_down {
            return Err(ControlError::ShutDown);
        }
        let ix = self.intersection_mut(request.intersection)?;
        let signal = &mut ix.signal;
        let group = request
            .group
            .or(signal.active_group())
            .unwrap_or(0);
        let light = signal.light(group).ok_or(SignalError::UnknownGroup {
            intersection: request.intersection,
            group,
        })?;

        info!(
            "Manual override {:?} on intersection {} group {}",
            request.action, request.intersection, group
        );
        let result = match request.action {
            OverrideAction::ForceGreen => signal.submit(SignalCommand::Grant {
                group,
                emergency: false,
            }),
            OverrideAction::EmergencyOverride => signal.submit(SignalCommand::Grant {
                group,
                emergency: true,
            }),
            OverrideAction::ForceRed => match request.group {
                // A named group that is not running is already red; only a
                // grant queued for it is withdrawn.
                Some(named) if signal.active_group() != Some(named) => {
                    signal.cancel_grant_for(named);
                    Ok(())
                }
                _ => signal.submit(SignalCommand::Revoke),
            },
            OverrideAction::ForceYellow => {
                if light != LightState::Green {
                    Err(SignalError::NotGreen {
                        intersection: request.intersection,
                        group,
                        state: light,
                    })
                } else {
                    signal.submit(SignalCommand::Revoke)
                }
            }
            OverrideAction::ResetToSafe => {
                signal.clear_pending();
                signal.submit(SignalCommand::Revoke)
            }
            OverrideAction::ReportIncident => {
                warn!(
                    "Incident reported at intersection {}, holding it red",
                    request.intersection
                );
                ix.incident_reported = true;
                signal.clear_pending();
                signal.submit(SignalCommand::Revoke)
            }
            OverrideAction::ClearIncident => {
                info!("Incident cleared at intersection {}", request.intersection);
                ix.incident_reported = false;
                Ok(())
            }
        };
        result.map_err(|err| {
            log_rejection(&err);
            ControlError::from(err)
        })
    }

    /// Swaps in new weights, timings and thresholds. The topology is fixed
    /// for the lifetime of the network.
    pub fn update_config(&mut self, config: ControlConfig) -> Result<(), ControlError> {
        config.validate()?;
        if config.intersections != self.config.intersections {
            return Err(ConfigError::invalid(
                "intersections",
                "topology cannot change while the controller is running",
            )
            .into());
        }

        let timings = SignalTimings::from_config(&config.timing);
        for ix in self.intersections.values_mut() {
            ix.signal.set_timings(timings);
            ix.history.set_capacity(config.optimization.demand_history_capacity);
            ix.set_color_capacity(config.detection.color_window);
        }
        self.detector = EmergencyDetector::from_config(&config.detection);
        self.optimizer.set_config(config.optimization.clone());
        self.config = config;
        info!("Configuration updated at cycle {}", self.cycle);
        Ok(())
    }

    /// Clears every denial streak and the optimizer statistics.
    pub fn reset_fairness(&mut self) {
        for ix in self.intersections.values_mut() {
            ix.fairness_counter = 0;
        }
        self.optimizer.reset_stats();
        info!("Fairness counters and optimizer statistics reset");
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let mut distribution = SignalDistribution::default();
        let intersections = self
            .intersections
            .values()
            .map(|ix| {
                let signal = &ix.signal;
                distribution.add(signal.active_light().unwrap_or(LightState::Red));
                let demand = ix.last_demand();
                IntersectionSnapshot {
                    id: ix.id(),
                    name: ix.layout.name.clone(),
                    groups: ix
                        .layout
                        .groups
                        .iter()
                        .zip(signal.lights())
                        .map(|(group, &light)| GroupSnapshot {
                            name: group.name.clone(),
                            light,
                        })
                        .collect(),
                    active_group: signal.active_group(),
                    phase_age_secs: signal.phase_age().as_secs_f64(),
                    consecutive_green_count: signal.consecutive_green_count(),
                    fairness_counter: ix.fairness_counter,
                    vehicle_count: demand.map_or(0, |d| d.total_vehicles()),
                    longest_wait_secs: demand.map_or(0.0, |d| d.longest_wait()),
                    density: demand.map_or(TrafficDensity::Low, |d| d.density()),
                    emergency: demand.is_some_and(|d| d.emergency),
                    incident: ix.has_incident(),
                    sensor_degraded: ix.sensor_degraded(),
                    average_vehicle_count: ix.history.average_vehicle_count(),
                    average_wait_secs: ix.history.average_wait(),
                    last_green_secs: signal.last_green_duration().map(|d| d.as_secs_f64()),
                }
            })
            .collect();

        NetworkSnapshot {
            timestamp: current_timestamp(),
            cycle: self.cycle,
            intersections,
            distribution,
            optimizer: self.optimizer.stats().clone(),
            shut_down: self.shut_down,
        }
    }

    /// Forces every intersection to red and stops accepting work.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        warn!("Shutting down: forcing every intersection to red");
        for ix in self.intersections.values_mut() {
            ix.signal.force_all_red();
        }
        self.shut_down = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::grid_topology;
    use crate::data_structures::{Approach, ApproachDemand};

    const A: IntersectionId = IntersectionId(0, 0);
    const B: IntersectionId = IntersectionId(0, 1);

    fn network() -> SignalNetwork {
        let config = ControlConfig {
            intersections: grid_topology(1, 2),
            ..ControlConfig::default()
        };
        SignalNetwork::new(config).unwrap()
    }

    fn reading(id: IntersectionId, north: u32, east: u32) -> SensorReading {
        let approaches = [(Approach::North, north), (Approach::East, east)]
            .into_iter()
            .map(|(approach, vehicle_count)| ApproachDemand {
                approach,
                vehicle_count,
                wait_secs: f64::from(vehicle_count) * 2.0,
            })
            .collect();
        SensorReading::new(
            DemandSample {
                intersection: id,
                approaches,
                emergency: false,
                emergency_approach: None,
                incident: false,
            },
            vec![],
        )
    }

    fn tick_secs(net: &mut SignalNetwork, secs: u64) {
        for _ in 0..secs {
            assert!(net.tick(Duration::from_secs(1)).is_empty());
        }
    }

    fn light(net: &SignalNetwork, id: IntersectionId, group: usize) -> LightState {
        net.intersection(id).unwrap().signal.light(group).unwrap()
    }

    #[test]
    fn cycle_grants_the_busiest_intersection() {
        let mut net = network();
        net.record_reading(A, Ok(reading(A, 2, 0))).unwrap();
        net.record_reading(B, Ok(reading(B, 0, 12))).unwrap();
        let plan = net.run_optimization_cycle().unwrap();
        assert_eq!(plan.winner, Some(B));
        assert_eq!(light(&net, B, 1), LightState::Green);
        assert_eq!(net.intersection(A).unwrap().fairness_counter, 1);
        assert_eq!(net.cycle(), 1);
    }

    #[test]
    fn unknown_intersection_is_reported() {
        let mut net = network();
        let err = net
            .record_reading(IntersectionId(9, 9), Ok(reading(A, 1, 1)))
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownIntersection(_)));
    }

    #[test]
    fn force_red_goes_through_exactly_one_yellow() {
        let mut net = network();
        net.apply_override(&ManualOverride::new(A, Some(0), OverrideAction::ForceGreen))
            .unwrap();
        assert_eq!(light(&net, A, 0), LightState::Green);
        tick_secs(&mut net, 15);

        net.apply_override(&ManualOverride::new(A, None, OverrideAction::ForceRed))
            .unwrap();
        assert_eq!(light(&net, A, 0), LightState::Yellow);
        tick_secs(&mut net, 2);
        assert_eq!(light(&net, A, 0), LightState::Yellow);
        tick_secs(&mut net, 1);
        assert_eq!(light(&net, A, 0), LightState::Red);
    }

    #[test]
    fn force_red_on_a_red_group_leaves_the_green_group_alone() {
        let mut net = network();
        net.apply_override(&ManualOverride::new(A, Some(0), OverrideAction::ForceGreen))
            .unwrap();
        tick_secs(&mut net, 20);

        net.apply_override(&ManualOverride::new(A, Some(1), OverrideAction::ForceRed))
            .unwrap();
        assert_eq!(light(&net, A, 0), LightState::Green);
        assert_eq!(light(&net, A, 1), LightState::Red);
        tick_secs(&mut net, 5);
        assert_eq!(light(&net, A, 0), LightState::Green);
    }

    #[test]
    fn force_red_on_a_red_group_withdraws_its_queued_grant() {
        let mut net = network();
        net.apply_override(&ManualOverride::new(A, Some(0), OverrideAction::ForceGreen))
            .unwrap();
        net.apply_override(&ManualOverride::new(A, Some(1), OverrideAction::ForceGreen))
            .unwrap();
        assert!(net.intersection(A).unwrap().signal.pending_grant().is_some());

        net.apply_override(&ManualOverride::new(A, Some(1), OverrideAction::ForceRed))
            .unwrap();
        assert!(net.intersection(A).unwrap().signal.pending_grant().is_none());
        tick_secs(&mut net, 20);
        assert_eq!(light(&net, A, 0), LightState::Green);
        assert_eq!(light(&net, A, 1), LightState::Red);
    }

    #[test]
    fn force_yellow_requires_a_green_group() {
        let mut net = network();
        let err = net
            .apply_override(&ManualOverride::new(A, Some(1), OverrideAction::ForceYellow))
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Signal(SignalError::NotGreen {
                state: LightState::Red,
                ..
            })
        ));
    }

    #[test]
    fn override_to_missing_group_is_rejected() {
        let mut net = network();
        let err = net
            .apply_override(&ManualOverride::new(A, Some(4), OverrideAction::ForceGreen))
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Signal(SignalError::UnknownGroup { group: 4, .. })
        ));
    }

    #[test]
    fn reset_to_safe_drops_a_queued_grant() {
        let mut net = network();
        net.apply_override(&ManualOverride::new(A, Some(0), OverrideAction::ForceGreen))
            .unwrap();
        net.apply_override(&ManualOverride::new(A, Some(1), OverrideAction::ForceGreen))
            .unwrap();
        assert!(net.intersection(A).unwrap().signal.pending_grant().is_some());

        net.apply_override(&ManualOverride::new(A, None, OverrideAction::ResetToSafe))
            .unwrap();
        assert!(net.intersection(A).unwrap().signal.pending_grant().is_none());
        tick_secs(&mut net, 18);
        assert!(net.intersection(A).unwrap().signal.is_all_red());
    }

    #[test]
    fn reported_incident_holds_the_intersection_red_until_cleared() {
        let mut net = network();
        net.record_reading(A, Ok(reading(A, 30, 0))).unwrap();
        net.run_optimization_cycle().unwrap();
        assert_eq!(light(&net, A, 0), LightState::Green);
        tick_secs(&mut net, 15);

        net.apply_override(&ManualOverride::new(A, None, OverrideAction::ReportIncident))
            .unwrap();
        assert_eq!(light(&net, A, 0), LightState::Yellow);
        tick_secs(&mut net, 3);
        assert!(net.intersection(A).unwrap().signal.is_all_red());

        // Still the busiest, but blocked.
        net.record_reading(A, Ok(reading(A, 30, 0))).unwrap();
        net.record_reading(B, Ok(reading(B, 1, 0))).unwrap();
        let plan = net.run_optimization_cycle().unwrap();
        assert_eq!(plan.winner, Some(B));
        assert!(net.intersection(A).unwrap().signal.is_all_red());
        assert!(net.snapshot().intersections[0].incident);

        net.apply_override(&ManualOverride::new(A, None, OverrideAction::ClearIncident))
            .unwrap();
        net.record_reading(A, Ok(reading(A, 30, 0))).unwrap();
        let plan = net.run_optimization_cycle().unwrap();
        assert_eq!(plan.winner, Some(A));
        assert!(!net.snapshot().intersections[0].incident);
    }

    #[test]
    fn emergency_override_preempts_min_green() {
        let mut net = network();
        net.apply_override(&ManualOverride::new(A, Some(0), OverrideAction::ForceGreen))
            .unwrap();
        tick_secs(&mut net, 2);
        net.apply_override(&ManualOverride::new(
            A,
            Some(1),
            OverrideAction::EmergencyOverride,
        ))
        .unwrap();
        assert_eq!(light(&net, A, 0), LightState::Yellow);
        tick_secs(&mut net, 3);
        assert_eq!(light(&net, A, 1), LightState::Green);
    }

    #[test]
    fn shutdown_leaves_everything_red_and_refuses_work() {
        let mut net = network();
        net.record_reading(A, Ok(reading(A, 5, 5))).unwrap();
        net.run_optimization_cycle().unwrap();
        assert!(!net.intersection(A).unwrap().signal.is_all_red());

        net.shutdown();
        assert!(net.intersections().all(|ix| ix.signal.is_all_red()));
        assert!(matches!(
            net.run_optimization_cycle(),
            Err(ControlError::ShutDown)
        ));
        assert!(matches!(
            net.apply_override(&ManualOverride::new(A, Some(0), OverrideAction::ForceGreen)),
            Err(ControlError::ShutDown)
        ));
        tick_secs(&mut net, 10);
        assert!(net.snapshot().shut_down);
        assert!(net.intersections().all(|ix| ix.signal.is_all_red()));
    }

    #[test]
    fn runtime_update_rejects_topology_changes() {
        let mut net = network();
        let mut config = net.config().clone();
        config.intersections = grid_topology(2, 2);
        let err = net.update_config(config).unwrap_err();
        assert!(matches!(
            err,
            ControlError::Config(ConfigError::Invalid { .. })
        ));

        let mut config = net.config().clone();
        config.optimization.max_consecutive_green = 5;
        config.timing.yellow_time = 4;
        net.update_config(config).unwrap();
        assert_eq!(net.config().optimization.max_consecutive_green, 5);
        assert_eq!(
            net.intersection(A).unwrap().signal.timings().yellow,
            Duration::from_secs(4)
        );
    }

    #[test]
    fn invalid_runtime_update_keeps_the_old_config() {
        let mut net = network();
        let mut config = net.config().clone();
        config.optimization.wait_time_weight = f64::NAN;
        assert!(net.update_config(config).is_err());
        assert_eq!(net.config().optimization.wait_time_weight, 0.4);
    }

    #[test]
    fn snapshot_reports_lights_demand_and_distribution() {
        let mut net = network();
        net.record_reading(A, Ok(reading(A, 20, 1))).unwrap();
        net.record_reading(
            B,
            Err(SensorError::Unavailable {
                intersection: B,
                reason: "lens covered".to_string(),
            }),
        )
        .unwrap();
        net.run_optimization_cycle().unwrap();

        let snapshot = net.snapshot();
        assert_eq!(snapshot.cycle, 1);
        assert_eq!(snapshot.distribution.green, 1);
        assert_eq!(snapshot.distribution.red, 1);
        let a = &snapshot.intersections[0];
        assert_eq!(a.id, A);
        assert_eq!(a.vehicle_count, 21);
        assert_eq!(a.groups[0].light, LightState::Green);
        let b = &snapshot.intersections[1];
        assert!(b.sensor_degraded);
        assert_eq!(b.vehicle_count, 0);
        assert_eq!(snapshot.optimizer.cycles_run, 1);
    }

    #[test]
    fn reset_fairness_clears_counters_and_stats() {
        let mut net = network();
        net.record_reading(A, Ok(reading(A, 1, 0))).unwrap();
        net.record_reading(B, Ok(reading(B, 9, 0))).unwrap();
        net.run_optimization_cycle().unwrap();
        assert_eq!(net.intersection(A).unwrap().fairness_counter, 1);
        net.reset_fairness();
        assert_eq!(net.intersection(A).unwrap().fairness_counter, 0);
        assert_eq!(net.optimizer_stats().cycles_run, 0);
    }
}
