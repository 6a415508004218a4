pub mod controller;
pub mod intersection;
pub mod signal_state;

pub use controller::SignalNetwork;
pub use intersection::{DemandHistory, Intersection};
pub use signal_state::{
    ChangeReason, PendingGrant, SignalChange, SignalCommand, SignalStateMachine, SignalTimings,
};
