use serde::{Deserialize, Serialize};
use std::fmt;

/// An estimated duration in seconds, carried as a mean and a variance.
///
/// Estimates compose: queueing + transmission + compute + downstream completion
/// are summed with `add_independent`, so the uncertainty of each part is kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    pub mean: f64,
    pub variance: f64,
}

impl TimeEstimate {
    pub const ZERO: TimeEstimate = TimeEstimate {
        mean: 0.0,
        variance: 0.0,
    };

    pub const INFINITE: TimeEstimate = TimeEstimate {
        mean: f64::INFINITY,
        variance: 0.0,
    };

    pub fn new(mean: f64, variance: f64) -> Self {
        Self {
            mean,
            variance: variance.max(0.0),
        }
    }

    /// An estimate with no uncertainty.
    pub fn exact(mean: f64) -> Self {
        Self::new(mean, 0.0)
    }

    /// Sum of two independent durations.
    pub fn add_independent(&self, other: &TimeEstimate) -> TimeEstimate {
        TimeEstimate {
            mean: self.mean + other.mean,
            variance: self.variance + other.variance,
        }
    }

    /// Sum of `n` independent copies of this duration.
    pub fn multiply(&self, n: f64) -> TimeEstimate {
        if n <= 0.0 {
            return TimeEstimate::ZERO;
        }
        TimeEstimate {
            mean: self.mean * n,
            variance: self.variance * n,
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Pessimistic point estimate: the mean plus one standard deviation.
    pub fn likely_value(&self) -> f64 {
        self.mean + self.std_dev()
    }

    pub fn is_infinite(&self) -> bool {
        self.mean.is_infinite()
    }

    /// Returns whichever of the two estimates has the lower likely value.
    pub fn min_likely(a: TimeEstimate, b: TimeEstimate) -> TimeEstimate {
        if b.likely_value() < a.likely_value() {
            b
        } else {
            a
        }
    }
}

impl Default for TimeEstimate {
    fn default() -> Self {
        TimeEstimate::ZERO
    }
}

impl fmt::Display for TimeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "infinite")
        } else {
            write!(f, "{:.3}s±{:.3}s", self.mean, self.std_dev())
        }
    }
}
