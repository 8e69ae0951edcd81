//! Automatic thresholding.
//!
//! Histogram-based methods work on the finite voxel values trimmed to the
//! [0.05, 99.5] percentile range, which keeps isolated outliers from
//! dominating the bin layout.

use ndarray::Array3;
use std::cmp::Ordering;

const TRIM_LOW_PCT: f64 = 0.05;
const TRIM_HIGH_PCT: f64 = 99.5;
const HISTOGRAM_BINS: usize = 256;

/// How a threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdRule {
    /// A fraction in (0, 1) read as a histogram percentile.
    Percentile(f64),
    /// An absolute intensity.
    Absolute(f64),
    /// Otsu's method scaled by a factor.
    Otsu {
        /// Multiplier applied to the computed threshold.
        factor: f64,
    },
    /// Two-Gaussian fit scaled by a factor.
    Gaussian {
        /// Multiplier applied to the computed threshold.
        factor: f64,
    },
}

impl ThresholdRule {
    /// Interprets a user value: (0, 1) is a percentile, anything else absolute.
    #[must_use]
    pub fn from_value(value: f64) -> Self {
        if value > 0.0 && value < 1.0 {
            Self::Percentile(value)
        } else {
            Self::Absolute(value)
        }
    }

    /// Computes the threshold for a map.
    #[must_use]
    pub fn compute(&self, data: &Array3<f64>) -> f64 {
        match *self {
            Self::Percentile(fraction) => percentile(&sorted_finite(data), fraction * 100.0),
            Self::Absolute(value) => value,
            Self::Otsu { factor } => otsu_threshold(&trimmed_values(data), HISTOGRAM_BINS) * factor,
            Self::Gaussian { factor } => gaussian_threshold(&trimmed_values(data)) * factor,
        }
    }
}

fn sorted_finite(data: &Array3<f64>) -> Vec<f64> {
    let mut values: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    values
}

/// Linear-interpolated percentile of sorted values; `pct` in [0, 100].
#[must_use]
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] * (1.0 - weight) + sorted[upper] * weight
        }
    }
}

/// Finite values within the [0.05, 99.5] percentile range, sorted.
#[must_use]
pub fn trimmed_values(data: &Array3<f64>) -> Vec<f64> {
    let sorted = sorted_finite(data);
    let lo = percentile(&sorted, TRIM_LOW_PCT);
    let hi = percentile(&sorted, TRIM_HIGH_PCT);
    sorted.into_iter().filter(|v| *v >= lo && *v <= hi).collect()
}

/// Otsu's method: the bin edge maximising inter-class variance.
#[must_use]
pub fn otsu_threshold(values: &[f64], num_bins: usize) -> f64 {
    if values.is_empty() || num_bins == 0 {
        return 0.0;
    }

    let min_val = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max_val = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if (max_val - min_val).abs() < 1e-12 {
        return min_val;
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let mut histogram = vec![0usize; num_bins];
    for &v in values {
        let bin = (((v - min_val) / bin_width).floor() as usize).min(num_bins - 1);
        histogram[bin] += 1;
    }

    let total = values.len() as f64;
    let sum_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut best_variance = 0.0;
    let mut best_bin = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }

        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_total - sum_background) / weight_foreground;
        let variance =
            weight_background * weight_foreground * (mean_background - mean_foreground).powi(2);

        if variance > best_variance {
            best_variance = variance;
            best_bin = t;
        }
    }

    // upper edge of the last background bin
    min_val + (best_bin + 1) as f64 * bin_width
}

struct Mode {
    weight: f64,
    mean: f64,
    sd: f64,
}

impl Mode {
    fn fit(values: &[f64]) -> Option<Self> {
        if values.len() < 2 {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let sd = var.sqrt();
        (sd > 0.0).then_some(Self { weight: n, mean, sd })
    }
}

/// Two-Gaussian threshold.
///
/// The values are split at the Otsu threshold; each side is fitted by its
/// weight, mean and standard deviation. The threshold is the intersection
/// of the two weighted densities between the means, on the ascending side
/// of the high mode. Falls back to Otsu when no intersection exists there.
#[must_use]
pub fn gaussian_threshold(values: &[f64]) -> f64 {
    let split = otsu_threshold(values, HISTOGRAM_BINS);
    let (low, high): (Vec<f64>, Vec<f64>) = values.iter().partition(|v| **v < split);
    let (Some(lo), Some(hi)) = (Mode::fit(&low), Mode::fit(&high)) else {
        return split;
    };

    let (v1, v2) = (lo.sd.powi(2), hi.sd.powi(2));
    let a = 1.0 / (2.0 * v2) - 1.0 / (2.0 * v1);
    let b = lo.mean / v1 - hi.mean / v2;
    let c = hi.mean.powi(2) / (2.0 * v2) - lo.mean.powi(2) / (2.0 * v1)
        + (lo.weight / lo.sd).ln()
        - (hi.weight / hi.sd).ln();

    // stable form: q = -(b + sign(b)·√disc)/2, roots q/a and c/q
    let disc = b * b - 4.0 * a * c;
    let roots: Vec<f64> = if disc < 0.0 {
        Vec::new()
    } else {
        let q = -0.5 * (b + b.signum() * disc.sqrt());
        let mut roots = Vec::with_capacity(2);
        if q != 0.0 {
            roots.push(c / q);
        }
        if a != 0.0 {
            roots.push(q / a);
        }
        roots
    };

    roots
        .into_iter()
        .filter(|x| *x > lo.mean && *x < hi.mean)
        .fold(None, |best: Option<f64>, x| Some(best.map_or(x, |b| b.max(x))))
        .unwrap_or(split)
}

/// Voxels strictly above the threshold become 1.
#[must_use]
pub fn binarize(data: &Array3<f64>, threshold: f64) -> Array3<u8> {
    data.mapv(|v| u8::from(v.is_finite() && v > threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bimodal() -> Array3<f64> {
        // low cluster around 0.2, high cluster around 0.8
        Array3::from_shape_fn((10, 10, 10), |(i, j, k)| {
            let jitter = ((i * 7 + j * 3 + k) % 10) as f64 * 0.01;
            if i < 5 {
                0.15 + jitter
            } else {
                0.75 + jitter
            }
        })
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&sorted, 50.0) - 2.0).abs() < 1e-12);
        assert!((percentile(&sorted, 12.5) - 0.5).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_otsu_between_clusters() {
        let t = ThresholdRule::Otsu { factor: 1.0 }.compute(&bimodal());
        assert!(t >= 0.24 && t < 0.75, "threshold {t} should separate the clusters");
    }

    #[test]
    fn test_otsu_factor_scales() {
        let data = bimodal();
        let base = ThresholdRule::Otsu { factor: 1.0 }.compute(&data);
        let scaled = ThresholdRule::Otsu { factor: 1.7 }.compute(&data);
        assert!((scaled - base * 1.7).abs() < 1e-12);
    }

    #[test]
    fn test_otsu_constant_and_empty() {
        assert_eq!(otsu_threshold(&[], 256), 0.0);
        assert_eq!(otsu_threshold(&[5.0; 10], 256), 5.0);
    }

    #[test]
    fn test_gaussian_between_clusters() {
        let t = ThresholdRule::Gaussian { factor: 1.0 }.compute(&bimodal());
        assert!(t > 0.24 && t < 0.75, "threshold {t} should separate the clusters");
    }

    #[test]
    fn test_value_interpretation() {
        assert_eq!(ThresholdRule::from_value(0.3), ThresholdRule::Percentile(0.3));
        assert_eq!(ThresholdRule::from_value(40.0), ThresholdRule::Absolute(40.0));
        assert_eq!(ThresholdRule::Absolute(40.0).compute(&bimodal()), 40.0);

        let median = ThresholdRule::Percentile(0.5).compute(&bimodal());
        assert!(median > 0.15 && median < 0.85);
    }

    #[test]
    fn test_binarize() {
        let data = bimodal();
        let mask = binarize(&data, 0.5);
        assert_eq!(mask.iter().filter(|v| **v == 1).count(), 500);
        assert_eq!(mask[[0, 0, 0]], 0);
        assert_eq!(mask[[9, 9, 9]], 1);
    }
}
