// traffic_optimizer.rs

use log::{debug, info};
use serde::Serialize;
use std::cmp::Ordering;

use crate::config::OptimizationConfig;
use crate::data_structures::{ApproachGroup, DemandSample, IntersectionId, LightState};

/// What the optimizer sees of a signal when it ranks intersections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseView {
    pub active_group: Option<usize>,
    /// Light of the active group; `None` when all groups are red.
    pub active_light: Option<LightState>,
    pub phase_age_secs: f64,
}

impl PhaseView {
    pub fn all_red() -> Self {
        Self {
            active_group: None,
            active_light: None,
            phase_age_secs: 0.0,
        }
    }

    /// All red, or already serving a green. A yellow is mid-transition and
    /// cannot take a normal grant.
    pub fn can_take_grant(&self) -> bool {
        matches!(self.active_light, None | Some(LightState::Green))
    }

    pub fn is_green(&self) -> bool {
        self.active_light == Some(LightState::Green)
    }
}

/// One intersection's slice of the cycle snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CycleInput<'a> {
    pub id: IntersectionId,
    pub groups: &'a [ApproachGroup],
    pub demand: &'a DemandSample,
    pub phase: PhaseView,
    pub fairness_counter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Grant { group: usize, emergency: bool },
    Revoke,
    NoChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub intersection: IntersectionId,
    pub wait_term: f64,
    pub count_term: f64,
    pub emergency_term: f64,
    pub fairness_boost: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleDecision {
    pub intersection: IntersectionId,
    pub decision: Decision,
    /// Denial streak after this cycle.
    pub fairness_counter: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclePlan {
    pub scores: Vec<ScoreBreakdown>,
    pub decisions: Vec<CycleDecision>,
    pub winner: Option<IntersectionId>,
    pub emergency: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub cycles_run: u64,
    pub emergency_preemptions: u64,
    pub last_winner: Option<IntersectionId>,
    pub last_scores: Vec<ScoreBreakdown>,
    pub last_decisions: Vec<CycleDecision>,
}

/// Index of the group with the most vehicles, then the longest wait; ties go
/// to the lowest index.
pub fn busiest_group(groups: &[ApproachGroup], demand: &DemandSample) -> usize {
    let mut best = 0;
    let mut best_demand = (0u32, 0.0f64);
    for (index, group) in groups.iter().enumerate() {
        let (count, wait) = demand.group_demand(group);
        let better = match count.cmp(&best_demand.0) {
            Ordering::Greater => true,
            Ordering::Equal => wait > best_demand.1,
            Ordering::Less => false,
        };
        if index == 0 || better {
            best = index;
            best_demand = (count, wait);
        }
    }
    best
}

/// Group an emergency grant should serve: the one holding the approach the
/// vehicle comes from, else the busiest.
pub fn emergency_group(groups: &[ApproachGroup], demand: &DemandSample) -> usize {
    demand
        .emergency_approach
        .and_then(|approach| groups.iter().position(|g| g.contains(approach)))
        .unwrap_or_else(|| busiest_group(groups, demand))
}

/// Fairness boost for an intersection denied `counter` cycles in a row.
/// Once one more denial would pass `max_consecutive_green`, each cycle of
/// overage is worth the full weight sum, so a starved intersection outranks
/// any unboosted one that has no emergency.
pub fn fairness_boost(config: &OptimizationConfig, counter: u32) -> f64 {
    let limit = config.max_consecutive_green;
    if counter >= limit {
        f64::from(counter - limit + 1) * config.weight_sum()
    } else {
        0.0
    }
}

pub fn next_fairness_counter(counter: u32, granted: bool, has_demand: bool) -> u32 {
    if granted {
        0
    } else if has_demand {
        counter.saturating_add(1)
    } else {
        counter
    }
}

fn normalized(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

/// Scores every intersection against the same snapshot.
pub fn score_cycle(config: &OptimizationConfig, inputs: &[CycleInput]) -> Vec<ScoreBreakdown> {
    let max_wait = inputs
        .iter()
        .map(|i| i.demand.longest_wait())
        .fold(0.0, f64::max);
    let max_count = inputs
        .iter()
        .map(|i| f64::from(i.demand.total_vehicles()))
        .fold(0.0, f64::max);

    inputs
        .iter()
        .map(|input| {
            let wait_term =
                config.wait_time_weight * normalized(input.demand.longest_wait(), max_wait);
            let count_term = config.vehicle_count_weight
                * normalized(f64::from(input.demand.total_vehicles()), max_count);
            let emergency_term = if input.demand.emergency {
                config.emergency_weight
            } else {
                0.0
            };
            let fairness_boost = if input.demand.has_demand() {
                fairness_boost(config, input.fairness_counter)
            } else {
                0.0
            };
            ScoreBreakdown {
                intersection: input.id,
                wait_term,
                count_term,
                emergency_term,
                fairness_boost,
                total: wait_term + count_term + emergency_term + fairness_boost,
            }
        })
        .collect()
}

/// Lower denial streak first, then lower id.
fn tie_break(a: &CycleInput, b: &CycleInput) -> Ordering {
    a.fairness_counter
        .cmp(&b.fairness_counter)
        .then(a.id.cmp(&b.id))
}

/// Plans one cycle. Pure: the same inputs always give the same plan, in
/// ascending intersection order.
pub fn plan_cycle(config: &OptimizationConfig, inputs: &[CycleInput]) -> CyclePlan {
    let mut inputs: Vec<CycleInput> = inputs.to_vec();
    inputs.sort_by_key(|i| i.id);
    let scores = score_cycle(config, &inputs);

    // A blocked intersection is never granted, even for an emergency.
    let emergency_winner = inputs
        .iter()
        .filter(|i| i.demand.emergency && !i.demand.incident)
        .min_by(|a, b| tie_break(a, b));

    let winner: Option<(IntersectionId, usize, bool)> = match emergency_winner {
        Some(input) => Some((input.id, emergency_group(input.groups, input.demand), true)),
        None => inputs
            .iter()
            .zip(&scores)
            .filter(|(input, score)| {
                !input.demand.incident && input.phase.can_take_grant() && score.total > 0.0
            })
            .min_by(|(a, sa), (b, sb)| sb.total.total_cmp(&sa.total).then(tie_break(a, b)))
            .map(|(input, _)| (input.id, busiest_group(input.groups, input.demand), false)),
    };

    let decisions = inputs
        .iter()
        .map(|input| {
            let (decision, granted) = match winner {
                Some((id, group, emergency)) if id == input.id => {
                    (Decision::Grant { group, emergency }, true)
                }
                _ if input.demand.incident && input.phase.is_green() => (Decision::Revoke, false),
                Some(_) if input.phase.is_green() => (Decision::Revoke, false),
                _ => (Decision::NoChange, false),
            };
            // Held red for an incident is not a denial.
            let competing = input.demand.has_demand() && !input.demand.incident;
            CycleDecision {
                intersection: input.id,
                decision,
                fairness_counter: next_fairness_counter(
                    input.fairness_counter,
                    granted,
                    competing,
                ),
            }
        })
        .collect();

    CyclePlan {
        scores,
        decisions,
        winner: winner.map(|(id, _, _)| id),
        emergency: emergency_winner.is_some(),
    }
}

/// Runs cycles and keeps statistics for the dashboard.
#[derive(Debug, Clone)]
pub struct TrafficOptimizer {
    config: OptimizationConfig,
    stats: OptimizerStats,
}

impl TrafficOptimizer {
    pub fn new(config: OptimizationConfig) -> Self {
        Self {
            config,
            stats: OptimizerStats::default(),
        }
    }

    pub fn config(&self) -> &OptimizationConfig {
        &self.config
    }

    /// Expects an already validated config.
    pub fn set_config(&mut self, config: OptimizationConfig) {
        info!(
            "Optimization parameters updated: wait {} / count {} / emergency {} / max consecutive {}",
            config.wait_time_weight,
            config.vehicle_count_weight,
            config.emergency_weight,
            config.max_consecutive_green
        );
        self.config = config;
    }

    pub fn stats(&self) -> &OptimizerStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = OptimizerStats::default();
    }

    pub fn optimize(&mut self, inputs: &[CycleInput]) -> CyclePlan {
        let plan = plan_cycle(&self.config, inputs);

        self.stats.cycles_run += 1;
        if plan.emergency {
            self.stats.emergency_preemptions += 1;
        }
        self.stats.last_winner = plan.winner;
        self.stats.last_scores = plan.scores.clone();
        self.stats.last_decisions = plan.decisions.clone();

        match plan.winner {
            Some(id) if plan.emergency => info!("Cycle {}: emergency priority to {}", self.stats.cycles_run, id),
            Some(id) => debug!("Cycle {}: green allocated to {}", self.stats.cycles_run, id),
            None => debug!("Cycle {}: no demand, no grant", self.stats.cycles_run),
        }
        plan
    }
}
