// =============================================================================
// Volume-weighted average price, cumulative since session open
// =============================================================================
//
//   VWAP = Σ((H + L + C) / 3 · V) / Σ V
//
// Division by zero (no volume yet) maps to unknown, never to zero.
// =============================================================================

use crate::market_data::Bar;

/// Cumulative VWAP over `bars` (assumed to span the session so far).
pub fn vwap(bars: &[Bar]) -> Option<f64> {
    let mut pv_sum = 0.0;
    let mut volume_sum = 0u64;

    for bar in bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        pv_sum += typical * bar.volume as f64;
        volume_sum += bar.volume;
    }

    if volume_sum == 0 {
        return None;
    }

    let value = pv_sum / volume_sum as f64;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(minute: u32, high: f64, low: f64, close: f64, volume: u64) -> Bar {
        let ts = NaiveDate::from_ymd_opt(2025, 7, 14)
            .unwrap()
            .and_hms_opt(9, minute, 0)
            .unwrap();
        Bar {
            ts,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn empty_or_zero_volume_is_unknown() {
        assert_eq!(vwap(&[]), None);
        assert_eq!(vwap(&[bar(0, 10.0, 8.0, 9.0, 0)]), None);
    }

    #[test]
    fn single_bar_is_typical_price() {
        let v = vwap(&[bar(0, 12.0, 9.0, 9.0, 500)]).unwrap();
        assert!((v - 10.0).abs() < 1e-10);
    }

    #[test]
    fn weights_by_volume() {
        // Typical prices 10 and 20, volumes 100 and 300 => 17.5.
        let bars = vec![
            bar(0, 11.0, 9.0, 10.0, 100),
            bar(1, 21.0, 19.0, 20.0, 300),
        ];
        let v = vwap(&bars).unwrap();
        assert!((v - 17.5).abs() < 1e-10);
    }

    #[test]
    fn zero_volume_bars_do_not_poison() {
        let bars = vec![
            bar(0, 11.0, 9.0, 10.0, 100),
            bar(1, 99.0, 99.0, 99.0, 0),
        ];
        let v = vwap(&bars).unwrap();
        assert!((v - 10.0).abs() < 1e-10);
    }
}
