//! Controller configuration: timings, optimizer weights, detection thresholds
//! and the static intersection topology.
//!
//! Values are validated once at load time and rejected, never clamped.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::data_structures::{ApproachGroup, IntersectionId};
use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Seconds.
    pub min_green_time: u64,
    pub max_green_time: u64,
    pub yellow_time: u64,
    pub optimization_interval: u64,
    pub camera_analysis_interval: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_green_time: 15,
            max_green_time: 90,
            yellow_time: 3,
            optimization_interval: 5,
            camera_analysis_interval: 2,
        }
    }
}

impl TimingConfig {
    pub fn min_green(&self) -> Duration {
        Duration::from_secs(self.min_green_time)
    }

    pub fn max_green(&self) -> Duration {
        Duration::from_secs(self.max_green_time)
    }

    pub fn yellow(&self) -> Duration {
        Duration::from_secs(self.yellow_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub wait_time_weight: f64,
    pub vehicle_count_weight: f64,
    pub emergency_weight: f64,
    pub max_consecutive_green: u32,
    /// Number of cycles of demand kept per intersection.
    pub demand_history_capacity: usize,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            wait_time_weight: 0.4,
            vehicle_count_weight: 0.3,
            emergency_weight: 0.3,
            max_consecutive_green: 3,
            demand_history_capacity: 10,
        }
    }
}

impl OptimizationConfig {
    pub fn weight_sum(&self) -> f64 {
        self.wait_time_weight + self.vehicle_count_weight + self.emergency_weight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub emergency_peak_threshold: f64,
    pub emergency_pulse_threshold: f64,
    /// Colour samples kept per intersection for flasher detection.
    pub color_window: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            emergency_peak_threshold: 200.0,
            emergency_pulse_threshold: 40.0,
            color_window: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionConfig {
    pub id: IntersectionId,
    pub name: String,
    pub groups: Vec<ApproachGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub timing: TimingConfig,
    pub optimization: OptimizationConfig,
    pub detection: DetectionConfig,
    pub intersections: Vec<IntersectionConfig>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            optimization: OptimizationConfig::default(),
            detection: DetectionConfig::default(),
            intersections: grid_topology(2, 2),
        }
    }
}

/// A rows x cols grid of two-phase intersections named "Intersection rc".
pub fn grid_topology(rows: u8, cols: u8) -> Vec<IntersectionConfig> {
    let mut intersections = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            intersections.push(IntersectionConfig {
                id: IntersectionId(row, col),
                name: format!("Intersection {}{}", row, col),
                groups: ApproachGroup::two_phase(),
            });
        }
    }
    intersections
}

impl ControlConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Loads `path`, or writes the defaults there when it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        info!("Created default configuration file: {}", path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Returns the first rule the configuration breaks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timing(&self.timing)?;
        validate_optimization(&self.optimization)?;
        validate_detection(&self.detection)?;
        validate_topology(&self.intersections)?;
        Ok(())
    }
}

fn positive_secs(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be > 0 seconds"));
    }
    Ok(())
}

fn validate_timing(timing: &TimingConfig) -> Result<(), ConfigError> {
    positive_secs("timing.min_green_time", timing.min_green_time)?;
    positive_secs("timing.max_green_time", timing.max_green_time)?;
    positive_secs("timing.yellow_time", timing.yellow_time)?;
    positive_secs("timing.optimization_interval", timing.optimization_interval)?;
    positive_secs(
        "timing.camera_analysis_interval",
        timing.camera_analysis_interval,
    )?;
    if timing.min_green_time > timing.max_green_time {
        return Err(ConfigError::invalid(
            "timing.min_green_time",
            format!(
                "min_green_time ({}) must not exceed max_green_time ({})",
                timing.min_green_time, timing.max_green_time
            ),
        ));
    }
    Ok(())
}

fn validate_optimization(opt: &OptimizationConfig) -> Result<(), ConfigError> {
    let weights = [
        ("optimization.wait_time_weight", opt.wait_time_weight),
        ("optimization.vehicle_count_weight", opt.vehicle_count_weight),
        ("optimization.emergency_weight", opt.emergency_weight),
    ];
    for (field, weight) in weights {
        if !weight.is_finite() || weight < 0.0 {
            return Err(ConfigError::invalid(
                field,
                format!("weight must be finite and >= 0, got {}", weight),
            ));
        }
    }
    if opt.weight_sum() <= 0.0 {
        return Err(ConfigError::invalid(
            "optimization",
            "weights must sum to a positive value",
        ));
    }
    if opt.max_consecutive_green == 0 {
        return Err(ConfigError::invalid(
            "optimization.max_consecutive_green",
            "must be > 0",
        ));
    }
    if opt.demand_history_capacity == 0 {
        return Err(ConfigError::invalid(
            "optimization.demand_history_capacity",
            "must be > 0",
        ));
    }
    Ok(())
}

fn validate_detection(det: &DetectionConfig) -> Result<(), ConfigError> {
    let thresholds = [
        ("detection.emergency_peak_threshold", det.emergency_peak_threshold),
        ("detection.emergency_pulse_threshold", det.emergency_pulse_threshold),
    ];
    for (field, value) in thresholds {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::invalid(
                field,
                format!("threshold must be > 0, got {}", value),
            ));
        }
    }
    if det.color_window < 2 {
        return Err(ConfigError::invalid(
            "detection.color_window",
            "at least 2 samples are needed to measure a range",
        ));
    }
    Ok(())
}

fn validate_topology(intersections: &[IntersectionConfig]) -> Result<(), ConfigError> {
    if intersections.is_empty() {
        return Err(ConfigError::invalid(
            "intersections",
            "at least one intersection is required",
        ));
    }
    let mut ids = HashSet::new();
    for intersection in intersections {
        let field = format!("intersections[{}]", intersection.id);
        if !ids.insert(intersection.id) {
            return Err(ConfigError::invalid(field, "duplicate intersection id"));
        }
        if intersection.groups.is_empty() {
            return Err(ConfigError::invalid(field, "no approach groups"));
        }
        let mut approaches = HashSet::new();
        for group in &intersection.groups {
            if group.approaches.is_empty() {
                return Err(ConfigError::invalid(
                    format!("{}.{}", field, group.name),
                    "approach group has no approaches",
                ));
            }
            for approach in &group.approaches {
                if !approaches.insert(*approach) {
                    return Err(ConfigError::invalid(
                        format!("{}.{}", field, group.name),
                        format!("{:?} belongs to more than one group", approach),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::Approach;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::Invalid { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.intersections.len(), 4);
        assert_eq!(config.timing.yellow(), Duration::from_secs(3));
    }

    #[test]
    fn zero_timing_is_rejected() {
        let mut config = ControlConfig::default();
        config.timing.yellow_time = 0;
        assert_eq!(field_of(config.validate().unwrap_err()), "timing.yellow_time");
    }

    #[test]
    fn min_green_above_max_green_is_rejected() {
        let mut config = ControlConfig::default();
        config.timing.min_green_time = 120;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "timing.min_green_time"
        );
    }

    #[test]
    fn negative_weight_is_rejected_not_clamped() {
        let mut config = ControlConfig::default();
        config.optimization.vehicle_count_weight = -0.1;
        assert_eq!(
            field_of(config.validate().unwrap_err()),
            "optimization.vehicle_count_weight"
        );
        assert_eq!(config.optimization.vehicle_count_weight, -0.1);
    }

    #[test]
    fn all_zero_weights_are_rejected() {
        let mut config = ControlConfig::default();
        config.optimization.wait_time_weight = 0.0;
        config.optimization.vehicle_count_weight = 0.0;
        config.optimization.emergency_weight = 0.0;
        assert_eq!(field_of(config.validate().unwrap_err()), "optimization");
    }

    #[test]
    fn overlapping_groups_are_rejected() {
        let mut config = ControlConfig::default();
        config.intersections[0].groups = vec![
            ApproachGroup::new("a", vec![Approach::North, Approach::East]),
            ApproachGroup::new("b", vec![Approach::East]),
        ];
        assert!(field_of(config.validate().unwrap_err()).starts_with("intersections[(0,0)]"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = ControlConfig::default();
        config.intersections[1].id = config.intersections[0].id;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{ "timing": { "min_green_time": 10 } }"#;
        let config = ControlConfig::from_json(json).unwrap();
        assert_eq!(config.timing.min_green_time, 10);
        assert_eq!(config.timing.max_green_time, 90);
        assert_eq!(config.optimization.max_consecutive_green, 3);
    }

    #[test]
    fn invalid_json_values_fail_at_load() {
        let json = r#"{ "detection": { "emergency_peak_threshold": 0.0 } }"#;
        assert!(matches!(
            ControlConfig::from_json(json),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            ControlConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_or_create_writes_defaults_then_reads_them_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_config.json");
        let created = ControlConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = ControlConfig::load(&path).unwrap();
        assert_eq!(created, loaded);
    }
}
