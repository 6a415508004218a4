pub mod traffic_optimizer;

pub use traffic_optimizer::{
    plan_cycle, CycleDecision, CycleInput, CyclePlan, Decision, OptimizerStats, PhaseView,
    ScoreBreakdown, TrafficOptimizer,
};
