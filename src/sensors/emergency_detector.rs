use crate::config::DetectionConfig;
use crate::data_structures::ColorSample;

/// Flags emergency-vehicle flashers from a window of red/blue brightness
/// samples: both channels must reach a bright peak and both must swing by
/// more than the pulse threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmergencyDetector {
    pub peak_threshold: f64,
    pub pulse_threshold: f64,
}

impl EmergencyDetector {
    pub fn new(peak_threshold: f64, pulse_threshold: f64) -> Self {
        Self {
            peak_threshold,
            pulse_threshold,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(
            config.emergency_peak_threshold,
            config.emergency_pulse_threshold,
        )
    }

    pub fn detect(&self, samples: &[ColorSample]) -> bool {
        // A single sample has no range.
        if samples.len() < 2 {
            return false;
        }

        let (red_min, red_max) = channel_bounds(samples.iter().map(|s| s.red));
        let (blue_min, blue_max) = channel_bounds(samples.iter().map(|s| s.blue));

        let has_peaks = red_max > self.peak_threshold && blue_max > self.peak_threshold;
        let pulsing = (red_max - red_min) > self.pulse_threshold
            && (blue_max - blue_min) > self.pulse_threshold;

        has_peaks && pulsing
    }
}

fn channel_bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}
