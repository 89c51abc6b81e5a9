// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Conventional EMA with span P:
//   multiplier = 2 / (P + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first P closes, so the series
// is undefined until P bars exist.
// =============================================================================

/// Compute the EMA series for `closes` with look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            // Stop producing values once the series is broken; downstream
            // consumers must not trust anything past a non-finite input.
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// The latest EMA value and, when present, the value one bar earlier.
/// The previous value is what the exit rule's cross detection compares
/// against.
pub fn last_two(closes: &[f64], period: usize) -> (Option<f64>, Option<f64>) {
    let series = calculate_ema(closes, period);
    let last = series.last().copied();
    let prev = series.len().checked_sub(2).and_then(|i| series.get(i)).copied();
    (last, prev)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn period_equals_length_yields_sma_seed() {
        let ema = calculate_ema(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn known_values() {
        // 5-period EMA of 1..=10: seed SMA = 3.0, multiplier = 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        let mut expected_vec = vec![expected];
        for &c in &closes[5..] {
            expected = c * mult + expected * (1.0 - mult);
            expected_vec.push(expected);
        }
        for (a, b) in ema.iter().zip(expected_vec.iter()) {
            assert!((a - b).abs() < 1e-10, "got {a}, expected {b}");
        }
    }

    #[test]
    fn nan_breaks_the_series() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 1);
    }

    #[test]
    fn last_two_returns_latest_and_previous() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let series = calculate_ema(&closes, 5);
        let (last, prev) = last_two(&closes, 5);
        assert_eq!(last, series.last().copied());
        assert_eq!(prev, Some(series[series.len() - 2]));
    }

    #[test]
    fn last_two_with_single_value() {
        let (last, prev) = last_two(&[2.0, 4.0, 6.0], 3);
        assert!(last.is_some());
        assert_eq!(prev, None);
    }

    #[test]
    fn last_two_insufficient_data() {
        let (last, prev) = last_two(&[1.0], 5);
        assert_eq!(last, None);
        assert_eq!(prev, None);
    }
}
