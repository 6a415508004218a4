pub mod emergency_detector;
pub mod sampler;

pub use emergency_detector::EmergencyDetector;
pub use sampler::{ScriptedSampler, SensorReading, SensorSampler, SyntheticSampler};
