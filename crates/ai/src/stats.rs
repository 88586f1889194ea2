//! Small deterministic statistics helpers.

/// Consistency constant making MAD an estimator of the normal standard deviation.
pub const MAD_SCALE: f64 = 1.4826;

/// sqrt(pi / 2): scales mean absolute deviation to the normal standard deviation.
pub const MEAN_AD_SCALE: f64 = 1.2533;

pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / (xs.len() as f64)
}

/// Median of a slice (0.0 for empty input).
pub fn median(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation around `center` (unscaled).
pub fn mad(xs: &[f64], center: f64) -> f64 {
    let deviations: Vec<f64> = xs.iter().map(|x| (x - center).abs()).collect();
    median(&deviations)
}

/// Robust spread estimate: scaled MAD, falling back to the scaled mean
/// absolute deviation when more than half the window sits on the median.
pub fn robust_spread(xs: &[f64], center: f64) -> f64 {
    let spread = MAD_SCALE * mad(xs, center);
    if spread > f64::EPSILON {
        return spread;
    }
    let mean_ad = mean(&xs.iter().map(|x| (x - center).abs()).collect::<Vec<_>>());
    MEAN_AD_SCALE * mean_ad
}

/// Sample standard deviation (n-1).
pub fn stddev_sample(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / ((xs.len() - 1) as f64);
    var.sqrt()
}

/// Inverse of the standard normal CDF (Acklam's rational approximation,
/// relative error below 1.2e-9). `p` must be in (0, 1).
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// Half-width multiplier of a two-sided normal interval at `confidence_level`.
pub fn two_sided_z(confidence_level: f64) -> f64 {
    normal_quantile(0.5 + confidence_level / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn spread_falls_back_when_mad_is_zero() {
        let xs = [10.0, 10.0, 10.0, 10.0, 50.0];
        assert_eq!(mad(&xs, 10.0), 0.0);
        let spread = robust_spread(&xs, 10.0);
        assert!((spread - MEAN_AD_SCALE * 8.0).abs() < 1e-9);
        assert_eq!(robust_spread(&[7.0, 7.0, 7.0], 7.0), 0.0);
    }

    #[test]
    fn quantiles_match_reference_values() {
        assert!(normal_quantile(0.5).abs() < 1e-9);
        assert!((normal_quantile(0.975) - 1.959_963_985).abs() < 1e-6);
        assert!((normal_quantile(0.025) + 1.959_963_985).abs() < 1e-6);
        assert!((normal_quantile(0.9) - 1.281_551_566).abs() < 1e-6);
        assert!((normal_quantile(0.001) + 3.090_232_306).abs() < 1e-6);
        assert!((two_sided_z(0.8) - 1.281_551_566).abs() < 1e-6);
    }

    #[test]
    fn sample_stddev() {
        let sd = stddev_sample(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((sd - 2.138_089_935).abs() < 1e-6);
    }
}
