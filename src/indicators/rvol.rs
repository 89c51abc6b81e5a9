// =============================================================================
// Relative volume (RVOL)
// =============================================================================
//
// The current bar's volume against the mean of the preceding `window` bars'
// volumes (exclusive of the current bar), expressed as a percentage.
// Undefined with fewer than window + 1 bars or a non-positive mean.
// =============================================================================

use crate::market_data::Bar;

pub fn rvol(bars: &[Bar], window: usize) -> Option<f64> {
    if window == 0 || bars.len() < window + 1 {
        return None;
    }

    let current = bars[bars.len() - 1].volume as f64;
    let previous = &bars[bars.len() - 1 - window..bars.len() - 1];
    let mean: f64 = previous.iter().map(|b| b.volume as f64).sum::<f64>() / window as f64;

    if mean <= 0.0 {
        return None;
    }

    Some(current / mean * 100.0)
}
