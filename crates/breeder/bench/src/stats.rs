//! Bootstrap confidence intervals over per-sample scores.

use breeder_types::ConfidenceInterval;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How intervals are computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub resamples: usize,
    /// Two-sided confidence level, e.g. 0.95.
    pub confidence: f64,
    /// At or above this many samples the normal approximation is used.
    pub normal_threshold: usize,
    /// Fixed seed for reproducible intervals; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            resamples: 100_000,
            confidence: 0.95,
            normal_threshold: 200,
            seed: None,
        }
    }
}

pub fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Interval of the mean of `scores`, or `None` below two samples.
pub fn bootstrap_ci(scores: &[f64], config: &BootstrapConfig) -> Option<ConfidenceInterval> {
    let n = scores.len();
    if n < 2 {
        return None;
    }
    let confidence = config.confidence.clamp(0.5, 0.999_999);
    let (lower, median, upper) = if n >= config.normal_threshold {
        normal_interval(scores, confidence)
    } else {
        percentile_interval(scores, confidence, config)
    };
    let clamp = |v: f64| v.clamp(0.0, 1.0);
    ConfidenceInterval::new(clamp(lower), clamp(median), clamp(upper))
}

/// [`bootstrap_ci`] on the blocking pool, off the async executor.
pub async fn bootstrap_ci_blocking(
    scores: Vec<f64>,
    config: BootstrapConfig,
) -> Option<ConfidenceInterval> {
    match tokio::task::spawn_blocking(move || bootstrap_ci(&scores, &config)).await {
        Ok(ci) => ci,
        Err(e) => {
            warn!(error = %e, "bootstrap task failed");
            None
        }
    }
}

fn percentile_interval(scores: &[f64], confidence: f64, config: &BootstrapConfig) -> (f64, f64, f64) {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let n = scores.len();
    let resamples = config.resamples.max(1);
    let mut means: Vec<f64> = (0..resamples)
        .map(|_| {
            let total: f64 = (0..n).map(|_| scores[rng.gen_range(0..n)]).sum();
            total / n as f64
        })
        .collect();
    means.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (
        quantile(&means, (1.0 - confidence) / 2.0),
        quantile(&means, 0.5),
        quantile(&means, (1.0 + confidence) / 2.0),
    )
}

fn normal_interval(scores: &[f64], confidence: f64) -> (f64, f64, f64) {
    let n = scores.len() as f64;
    let m = mean(scores);
    let variance = scores.iter().map(|s| (s - m).powi(2)).sum::<f64>() / (n - 1.0);
    let half_width = normal_quantile((1.0 + confidence) / 2.0) * (variance / n).sqrt();
    (m - half_width, m, m + half_width)
}

/// Linear-interpolated quantile of sorted data.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let weight = position - below as f64;
    if sorted[below] == sorted[above] {
        return sorted[below];
    }
    sorted[below] * (1.0 - weight) + sorted[above] * weight
}

/// Inverse standard normal CDF (Acklam's rational approximation).
fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const LOW: f64 = 0.024_25;

    let p = p.clamp(1e-12, 1.0 - 1e-12);
    if p < LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -normal_quantile(1.0 - p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seeded(resamples: usize) -> BootstrapConfig {
        BootstrapConfig {
            resamples,
            seed: Some(42),
            ..BootstrapConfig::default()
        }
    }

    #[test]
    fn fewer_than_two_samples_has_no_interval() {
        assert!(bootstrap_ci(&[], &seeded(100)).is_none());
        assert!(bootstrap_ci(&[1.0], &seeded(100)).is_none());
    }

    #[test]
    fn constant_scores_collapse_to_a_point() {
        let ci = bootstrap_ci(&[1.0; 10], &seeded(1_000)).unwrap();
        assert_eq!(ci, ConfidenceInterval::point(1.0));
    }

    #[test]
    fn percentile_interval_brackets_the_mean() {
        let scores: Vec<f64> = (0..50).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let ci = bootstrap_ci(&scores, &seeded(5_000)).unwrap();
        assert!((ci.median - 0.5).abs() < 0.05, "{ci:?}");
        assert!(ci.lower < 0.45 && ci.lower > 0.25, "{ci:?}");
        assert!(ci.upper > 0.55 && ci.upper < 0.75, "{ci:?}");
    }

    #[test]
    fn large_samples_use_the_normal_approximation() {
        let scores: Vec<f64> = (0..400).map(|i| if i % 4 == 0 { 1.0 } else { 0.0 }).collect();
        let ci = bootstrap_ci(&scores, &seeded(10)).unwrap();
        assert_eq!(ci.median, 0.25);
        let expected = 1.959_964 * (0.25f64 * 0.75 * 400.0 / 399.0 / 400.0).sqrt();
        assert!((ci.upper - 0.25 - expected).abs() < 1e-4, "{ci:?}");
    }

    #[test]
    fn normal_quantile_matches_tables() {
        assert!((normal_quantile(0.975) - 1.959_964).abs() < 1e-5);
        assert!(normal_quantile(0.5).abs() < 1e-9);
        assert!((normal_quantile(0.01) + 2.326_348).abs() < 1e-5);
    }

    #[tokio::test]
    async fn blocking_variant_matches() {
        let scores = vec![1.0, 0.0, 1.0, 1.0];
        let a = bootstrap_ci_blocking(scores.clone(), seeded(2_000)).await;
        let b = bootstrap_ci(&scores, &seeded(2_000));
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn intervals_are_ordered_and_bounded(
            scores in proptest::collection::vec(0.0f64..=1.0, 2..300)
        ) {
            let ci = bootstrap_ci(&scores, &seeded(200)).unwrap();
            prop_assert!(ci.lower <= ci.median && ci.median <= ci.upper);
            prop_assert!(ci.lower >= 0.0 && ci.upper <= 1.0);
        }
    }
}
