//! Descriptive statistics over level notionals

/// Fewer samples than this yield no statistical threshold
pub const MIN_SAMPLES: usize = 10;

/// Multiplier for both the z-score and the Tukey fence bounds
pub const OUTLIER_FACTOR: f64 = 3.0;

/// Summary of one snapshot's notional distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotionalStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
}

impl NotionalStats {
    /// Compute the summary; `None` below [`MIN_SAMPLES`]
    pub fn compute(samples: &[f64]) -> Option<Self> {
        if samples.len() < MIN_SAMPLES {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        Some(Self {
            count: sorted.len(),
            mean: mean(&sorted),
            std_dev: sample_std_dev(&sorted),
            q1: percentile(&sorted, 25.0),
            q3: percentile(&sorted, 75.0),
        })
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }

    /// The stricter of `mean + 3σ` and `Q3 + 3·IQR`
    pub fn threshold(&self) -> f64 {
        let z_bound = self.mean + OUTLIER_FACTOR * self.std_dev;
        let tukey_bound = self.q3 + OUTLIER_FACTOR * self.iqr();
        z_bound.min(tukey_bound)
    }
}

/// Statistical threshold for `samples`, infinite when there are too few
pub fn statistical_threshold(samples: &[f64]) -> f64 {
    NotionalStats::compute(samples)
        .map(|s| s.threshold())
        .unwrap_or(f64::INFINITY)
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Standard deviation with the `n - 1` denominator
pub fn sample_std_dev(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let variance = samples.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}

/// Percentile of an ascending slice using the `(n + 1)·p` position rule
///
/// Positions below the first sample clamp to the minimum, positions at or past
/// the last clamp to the maximum, anything between is linearly interpolated.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let pos = p * (n as f64 + 1.0) / 100.0;
    if pos < 1.0 {
        return sorted[0];
    }
    if pos >= n as f64 {
        return sorted[n - 1];
    }
    let floor = pos.floor();
    let fraction = pos - floor;
    let lower = sorted[floor as usize - 1];
    let upper = sorted[floor as usize];
    lower + fraction * (upper - lower)
}
