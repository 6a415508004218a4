use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};

use crate::config::IntersectionConfig;
use crate::data_structures::{Approach, ApproachDemand, ColorSample, DemandSample, IntersectionId};
use crate::errors::SensorError;

/// What a sensor delivers for one intersection on one sampling tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Counts and waits. The emergency flag is left for the detector to set.
    pub demand: DemandSample,
    /// Colour frames captured since the previous reading.
    pub colors: Vec<ColorSample>,
    /// Approach the flashers were seen on, if the sensor can tell.
    pub emergency_approach: Option<Approach>,
}

impl SensorReading {
    pub fn new(demand: DemandSample, colors: Vec<ColorSample>) -> Self {
        Self {
            demand,
            colors,
            emergency_approach: None,
        }
    }
}

/// Source of per-intersection demand. Acquisition is the only step of the
/// control loop allowed to fail.
pub trait SensorSampler: Send {
    fn sample(&mut self, intersection: &IntersectionConfig) -> Result<SensorReading, SensorError>;
}

#[derive(Debug, Clone, Copy)]
struct FlasherEpisode {
    frames_left: u32,
    approach: Approach,
}

/// Clamps to `[0, 1]`; NaN and infinities disable the event.
fn probability_or_zero(probability: f64) -> f64 {
    if probability.is_finite() {
        probability.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Generates plausible traffic when no camera is attached: random queues per
/// approach, occasional emergency flasher episodes, occasional dropouts.
/// Seeded, so a run can be replayed.
pub struct SyntheticSampler {
    rng: SmallRng,
    max_vehicles_per_approach: u32,
    max_wait_secs: f64,
    emergency_probability: f64,
    failure_probability: f64,
    episode_frames: u32,
    episodes: HashMap<IntersectionId, FlasherEpisode>,
}

impl SyntheticSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            max_vehicles_per_approach: 20,
            max_wait_secs: 60.0,
            emergency_probability: 0.02,
            failure_probability: 0.01,
            episode_frames: 8,
            episodes: HashMap::new(),
        }
    }

    pub fn with_max_vehicles(mut self, max_vehicles_per_approach: u32) -> Self {
        self.max_vehicles_per_approach = max_vehicles_per_approach;
        self
    }

    pub fn with_emergency_probability(mut self, probability: f64) -> Self {
        self.emergency_probability = probability_or_zero(probability);
        self
    }

    pub fn with_failure_probability(mut self, probability: f64) -> Self {
        self.failure_probability = probability_or_zero(probability);
        self
    }

    fn approach_demand(&mut self, approach: Approach) -> ApproachDemand {
        let vehicle_count = self.rng.random_range(0..=self.max_vehicles_per_approach);
        let wait_secs = if vehicle_count == 0 {
            0.0
        } else {
            self.rng.random_range(0.0..self.max_wait_secs)
        };
        ApproachDemand {
            approach,
            vehicle_count,
            wait_secs,
        }
    }

    fn color_frame(&mut self, id: IntersectionId, approaches: &[Approach]) -> (ColorSample, Option<Approach>) {
        if !self.episodes.contains_key(&id)
            && !approaches.is_empty()
            && self.rng.random_bool(self.emergency_probability)
        {
            let approach = approaches[self.rng.random_range(0..approaches.len())];
            self.episodes.insert(
                id,
                FlasherEpisode {
                    frames_left: self.episode_frames,
                    approach,
                },
            );
        }

        match self.episodes.get_mut(&id) {
            Some(episode) => {
                // Red and blue bars alternate on consecutive frames.
                let frame = if episode.frames_left % 2 == 0 {
                    ColorSample::new(self.rng.random_range(220.0..255.0), 30.0)
                } else {
                    ColorSample::new(30.0, self.rng.random_range(220.0..255.0))
                };
                let approach = episode.approach;
                episode.frames_left -= 1;
                if episode.frames_left == 0 {
                    self.episodes.remove(&id);
                }
                (frame, Some(approach))
            }
            None => {
                let frame = ColorSample::new(
                    self.rng.random_range(20.0..90.0),
                    self.rng.random_range(20.0..90.0),
                );
                (frame, None)
            }
        }
    }
}

impl SensorSampler for SyntheticSampler {
    fn sample(&mut self, intersection: &IntersectionConfig) -> Result<SensorReading, SensorError> {
        if self.rng.random_bool(self.failure_probability) {
            return Err(SensorError::Unavailable {
                intersection: intersection.id,
                reason: "synthetic dropout".to_string(),
            });
        }

        let approaches: Vec<Approach> = intersection
            .groups
            .iter()
            .flat_map(|g| g.approaches.iter().copied())
            .collect();
        let demand = approaches
            .iter()
            .map(|&a| self.approach_demand(a))
            .collect();
        let (frame, emergency_approach) = self.color_frame(intersection.id, &approaches);

        Ok(SensorReading {
            demand: DemandSample {
                intersection: intersection.id,
                approaches: demand,
                emergency: false,
                emergency_approach: None,
                incident: false,
            },
            colors: vec![frame],
            emergency_approach,
        })
    }
}

/// Replays prepared readings per intersection. Once an intersection's script
/// runs out, its last good reading is repeated; with no good reading at all
/// the sensor reports itself unavailable.
#[derive(Default)]
pub struct ScriptedSampler {
    scripts: HashMap<IntersectionId, VecDeque<Result<SensorReading, SensorError>>>,
    last_good: HashMap<IntersectionId, SensorReading>,
}

impl ScriptedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reading: SensorReading) {
        self.scripts
            .entry(reading.demand.intersection)
            .or_default()
            .push_back(Ok(reading));
    }

    pub fn push_failure(&mut self, intersection: IntersectionId, reason: &str) {
        self.scripts
            .entry(intersection)
            .or_default()
            .push_back(Err(SensorError::Unavailable {
                intersection,
                reason: reason.to_string(),
            }));
    }
}

impl SensorSampler for ScriptedSampler {
    fn sample(&mut self, intersection: &IntersectionConfig) -> Result<SensorReading, SensorError> {
        let next = self
            .scripts
            .get_mut(&intersection.id)
            .and_then(|script| script.pop_front());
        match next {
            Some(Ok(reading)) => {
                self.last_good.insert(intersection.id, reading.clone());
                Ok(reading)
            }
            Some(Err(err)) => Err(err),
            None => self
                .last_good
                .get(&intersection.id)
                .cloned()
                .ok_or_else(|| SensorError::Unavailable {
                    intersection: intersection.id,
                    reason: "no reading scripted".to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::grid_topology;
    use crate::sensors::emergency_detector::EmergencyDetector;

    #[test]
    fn synthetic_sampler_is_reproducible_for_a_seed() {
        let layout = &grid_topology(1, 1)[0];
        let mut a = SyntheticSampler::new(7);
        let mut b = SyntheticSampler::new(7);
        for _ in 0..20 {
            assert_eq!(a.sample(layout), b.sample(layout));
        }
    }

    #[test]
    fn synthetic_readings_cover_every_configured_approach() {
        let layout = &grid_topology(1, 1)[0];
        let mut sampler = SyntheticSampler::new(1).with_failure_probability(0.0);
        let reading = sampler.sample(layout).unwrap();
        assert_eq!(reading.demand.approaches.len(), 4);
        assert!(reading.demand.is_well_formed());
        assert_eq!(reading.colors.len(), 1);
    }

    #[test]
    fn synthetic_flashers_trip_the_detector() {
        let layout = &grid_topology(1, 1)[0];
        let mut sampler = SyntheticSampler::new(3)
            .with_failure_probability(0.0)
            .with_emergency_probability(1.0);
        let detector = EmergencyDetector::new(200.0, 40.0);
        let mut window = Vec::new();
        let mut hint = None;
        for _ in 0..4 {
            let reading = sampler.sample(layout).unwrap();
            window.extend(reading.colors);
            hint = hint.or(reading.emergency_approach);
        }
        assert!(detector.detect(&window));
        assert!(hint.is_some());
    }

    #[test]
    fn failure_probability_one_always_fails() {
        let layout = &grid_topology(1, 1)[0];
        let mut sampler = SyntheticSampler::new(3).with_failure_probability(1.0);
        assert!(matches!(
            sampler.sample(layout),
            Err(SensorError::Unavailable { .. })
        ));
    }

    #[test]
    fn non_finite_probabilities_disable_the_event() {
        let layout = &grid_topology(1, 1)[0];
        let mut sampler = SyntheticSampler::new(5)
            .with_failure_probability(f64::NAN)
            .with_emergency_probability(f64::INFINITY);
        for _ in 0..50 {
            let reading = sampler.sample(layout).unwrap();
            assert_eq!(reading.emergency_approach, None);
        }
    }

    #[test]
    fn scripted_sampler_replays_then_repeats_last_good() {
        let layout = &grid_topology(1, 1)[0];
        let mut sampler = ScriptedSampler::new();
        assert!(sampler.sample(layout).is_err());

        let reading = SensorReading::new(DemandSample::zero(layout.id), vec![]);
        sampler.push(reading.clone());
        sampler.push_failure(layout.id, "lens covered");

        assert_eq!(sampler.sample(layout), Ok(reading.clone()));
        assert!(sampler.sample(layout).is_err());
        assert_eq!(sampler.sample(layout), Ok(reading));
    }
}
