use statrs::statistics::{Data, Distribution};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("no data: the sample set is empty")]
    NoData,
}

/// Client-side summary of one phase's samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

pub fn compute(samples: &[f64]) -> Result<SampleStats, StatsError> {
    if samples.is_empty() {
        return Err(StatsError::NoData);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let data = Data::new(sorted.clone());
    let mean = data.mean().unwrap_or(f64::NAN);
    let median = median_of_sorted(&sorted);
    let cuts = quantiles_exclusive(&sorted, 100);

    Ok(SampleStats {
        count: sorted.len(),
        mean,
        median,
        p50: median,
        p95: cuts[94],
        p99: cuts[98],
    })
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Cut points dividing `sorted` into `n` equal-probability intervals.
///
/// Exclusive method: positions are taken on `len + 1`, the lower index is clamped to
/// `1..=len-1` and the value is interpolated with exact integer weights. A single
/// sample yields `n - 1` copies of itself.
pub fn quantiles_exclusive(sorted: &[f64], n: usize) -> Vec<f64> {
    let len = sorted.len();
    if len == 0 || n < 2 {
        return Vec::new();
    }
    if len == 1 {
        return vec![sorted[0]; n - 1];
    }

    let m = (len + 1) as i64;
    let n = n as i64;
    let last = len as i64 - 1;
    (1..n)
        .map(|i| {
            let j = (i * m / n).clamp(1, last);
            let delta = i * m - j * n;
            let lower = sorted[(j - 1) as usize];
            let upper = sorted[j as usize];
            (lower * (n - delta) as f64 + upper * delta as f64) / n as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn assert_f64_eq(a: f64, b: f64, msg: &str) {
        assert!((a - b).abs() < EPSILON, "{} | {} vs {}", msg, a, b);
    }

    #[test]
    fn test_compute_empty_is_no_data() {
        assert_eq!(compute(&[]), Err(StatsError::NoData));
    }

    #[test]
    fn test_compute_single_value() {
        let stats = compute(&[7.0]).unwrap();
        assert_eq!(stats.count, 1);
        assert_f64_eq(stats.mean, 7.0, "mean");
        assert_f64_eq(stats.median, 7.0, "median");
        assert_f64_eq(stats.p95, 7.0, "p95");
        assert_f64_eq(stats.p99, 7.0, "p99");
    }

    #[test]
    fn test_compute_one_to_hundred() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let stats = compute(&values).unwrap();
        assert_f64_eq(stats.mean, 50.5, "mean");
        assert_f64_eq(stats.median, 50.5, "median");
        assert_f64_eq(stats.p95, 95.95, "p95");
        assert_f64_eq(stats.p99, 99.99, "p99");
    }

    #[test]
    fn test_p50_equals_median_for_unsorted_input() {
        let values = [9.0, 1.0, 4.0, 100.0, 3.0, 3.0, 12.5];
        let stats = compute(&values).unwrap();
        assert_eq!(stats.p50, stats.median);
        assert_f64_eq(stats.median, 4.0, "median");

        let even = [4.0, 1.0, 3.0, 2.0];
        let stats = compute(&even).unwrap();
        assert_eq!(stats.p50, stats.median);
        assert_f64_eq(stats.median, 2.5, "even median");
    }

    #[test]
    fn test_quantiles_exclusive_small_set_clamps() {
        // len=3: upper cut points extrapolate past the last pair, lower ones before the first.
        let sorted = [10.0, 20.0, 30.0];
        let cuts = quantiles_exclusive(&sorted, 100);
        assert_eq!(cuts.len(), 99);
        // i=1: j=clamp(4/100=0 -> 1), delta=4-100=-96 -> (10*196 + 20*-96)/100
        assert_f64_eq(cuts[0], 0.4, "first cut");
        // i=95: j=clamp(380/100=3 -> 2), delta=380-200=180 -> (20*-80 + 30*180)/100
        assert_f64_eq(cuts[94], 38.0, "p95");
        // i=99: j=2, delta=396-200=196 -> (20*-96 + 30*196)/100
        assert_f64_eq(cuts[98], 39.6, "p99");
    }

    #[test]
    fn test_quantiles_exclusive_quartiles() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let cuts = quantiles_exclusive(&sorted, 4);
        assert_eq!(cuts, vec![2.75, 5.5, 8.25]);
    }

    #[test]
    fn test_quantiles_exclusive_degenerate() {
        assert!(quantiles_exclusive(&[], 100).is_empty());
        assert_eq!(quantiles_exclusive(&[5.0], 4), vec![5.0, 5.0, 5.0]);
    }
}
