//! Error types for the signal control core.
//!
//! Propagation follows one rule: sensor and optimizer-input problems are
//! absorbed where they happen (fail open to zero demand), while signal errors
//! are never absorbed: the offending request is rejected or the intersection
//! is forced to red.

use thiserror::Error;

use crate::data_structures::{IntersectionId, LightState};

/// Invalid weights, timings or topology. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A sensor could not deliver a reading this cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("sensor at intersection {intersection} unavailable: {reason}")]
    Unavailable {
        intersection: IntersectionId,
        reason: String,
    },
}

/// Rejections and faults raised by a signal state machine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignalError {
    #[error("intersection {intersection}: unknown approach group {group}")]
    UnknownGroup {
        intersection: IntersectionId,
        group: usize,
    },

    #[error(
        "intersection {intersection}: illegal transition {from:?} -> {to:?} on group {group}"
    )]
    IllegalTransition {
        intersection: IntersectionId,
        group: usize,
        from: LightState,
        to: LightState,
    },

    #[error("intersection {intersection}: group {group} conflicts with non-red group {active}")]
    ConflictingGreen {
        intersection: IntersectionId,
        group: usize,
        active: usize,
    },

    #[error("intersection {intersection}: min green not reached on group {group} ({elapsed_secs:.1}s)")]
    MinGreenNotReached {
        intersection: IntersectionId,
        group: usize,
        elapsed_secs: f64,
    },

    #[error("intersection {intersection}: yellow not finished on group {group} ({elapsed_secs:.1}s)")]
    YellowNotFinished {
        intersection: IntersectionId,
        group: usize,
        elapsed_secs: f64,
    },

    #[error("intersection {intersection}: group {group} is {state:?}, expected Green")]
    NotGreen {
        intersection: IntersectionId,
        group: usize,
        state: LightState,
    },

    #[error("intersection {intersection}: safety fault: {message}")]
    SafetyFault {
        intersection: IntersectionId,
        message: String,
    },
}

impl SignalError {
    /// Everything except a safety fault is a rejected request.
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(self, SignalError::SafetyFault { .. })
    }
}

/// Errors surfaced to the override and config-update callers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown intersection {0}")]
    UnknownIntersection(IntersectionId),

    #[error("override rejected: {0}")]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("controller is shut down")]
    ShutDown,
}

/// Failures in the publishers and the override queue listener. Logged, never
/// fatal to the control loop.
#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error("amqp error: {0}")]
    Amqp(#[from] amiquip::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("publisher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
