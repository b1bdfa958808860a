use super::time_estimate::TimeEstimate;

/// Weight of the running average relative to a new sample.
const OLD_WEIGHT: f64 = 3.0;

/// Exponentially decaying estimator: every new sample counts for a quarter.
///
/// The initial value is meant to be a pessimistic guess. It carries a large
/// variance so early scheduling is biased away from unproven nodes while
/// still leaving room to try them.
#[derive(Debug, Clone)]
pub struct DecayingEstimator {
    average: f64,
    variance: f64,
    samples: u64,
}

impl DecayingEstimator {
    pub fn new(initial: f64) -> Self {
        Self {
            average: initial,
            variance: initial * initial,
            samples: 0,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        if !value.is_finite() {
            tracing::debug!("Ignoring non-finite estimator sample {}", value);
            return;
        }
        if !self.average.is_finite() || self.samples == 0 {
            // First real observation replaces the guess, keeping some doubt.
            let deviation = if self.average.is_finite() {
                value - self.average
            } else {
                value
            };
            self.average = value;
            self.variance = deviation * deviation / (OLD_WEIGHT + 1.0);
        } else {
            let deviation = value - self.average;
            self.average = (OLD_WEIGHT * self.average + value) / (OLD_WEIGHT + 1.0);
            self.variance =
                (OLD_WEIGHT * self.variance + deviation * deviation) / (OLD_WEIGHT + 1.0);
        }
        self.samples += 1;
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn estimate(&self) -> TimeEstimate {
        if !self.average.is_finite() {
            return TimeEstimate::INFINITE;
        }
        TimeEstimate::new(self.average, self.variance)
    }

    pub fn likely_value(&self) -> f64 {
        self.estimate().likely_value()
    }

    /// Marks the estimated quantity as unreachable (e.g. a failed task type).
    pub fn set_infinite(&mut self) {
        self.average = f64::INFINITY;
        self.variance = 0.0;
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}

/// Time-weighted average: the older an observation, the less it counts.
///
/// The weight of the running value halves every `half_life` seconds of
/// elapsed time between samples.
#[derive(Debug, Clone)]
pub struct TimeDecayingEstimator {
    average: f64,
    half_life: f64,
    last_sample: Option<f64>,
}

impl TimeDecayingEstimator {
    pub fn new(initial: f64, half_life: f64) -> Self {
        Self {
            average: initial,
            half_life: half_life.max(f64::EPSILON),
            last_sample: None,
        }
    }

    pub fn add_sample(&mut self, value: f64, now: f64) {
        if !value.is_finite() {
            return;
        }
        match self.last_sample {
            None => self.average = value,
            Some(last) => {
                let elapsed = (now - last).max(0.0);
                let keep = 0.5f64.powf(elapsed / self.half_life);
                self.average = keep * self.average + (1.0 - keep) * value;
            }
        }
        self.last_sample = Some(now);
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn estimate(&self) -> TimeEstimate {
        TimeEstimate::exact(self.average)
    }
}
