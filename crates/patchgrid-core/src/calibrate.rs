//! Threshold calibration from the score distribution of the normal set.

/// Mean and population standard deviation, accumulated in f64.
///
/// Population (not sample) variance is used everywhere a deviation is
/// needed, so a threshold re-derived from the same scores can never
/// disagree with the one stored at build time.
pub fn mean_std(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

/// Decision threshold `mean + 2 * std` over the image-level scores the
/// normal images obtain against their own freshly built bank.
///
/// A heuristic bound assuming roughly normally distributed scores, not a
/// guaranteed false-positive rate. Returns 0 for an empty slice; the
/// builder never passes one.
pub fn calibrate_threshold(scores: &[f32]) -> f32 {
    let (mean, std) = mean_std(scores);
    (mean + 2.0 * std) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_std_simple() {
        let (mean, std) = mean_std(&[1.0, 2.0, 3.0]);
        assert!((mean - 2.0).abs() < 1e-12);
        assert!((std - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn threshold_is_mean_plus_two_std() {
        let t = calibrate_threshold(&[1.0, 2.0, 3.0]);
        let expected = 2.0 + 2.0 * (2.0f64 / 3.0).sqrt();
        assert!((t as f64 - expected).abs() < 1e-6);
    }

    #[test]
    fn zero_variance_threshold_equals_common_score() {
        // All-zero scores collapse the bound onto the score itself.
        let t = calibrate_threshold(&[0.0; 10]);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn empty_scores_yield_zero() {
        assert_eq!(calibrate_threshold(&[]), 0.0);
    }

    #[test]
    fn threshold_nonnegative_and_finite_for_nonnegative_scores() {
        let t = calibrate_threshold(&[0.5, 0.75, 0.6, 0.9]);
        assert!(t.is_finite());
        assert!(t >= 0.0);
    }
}
