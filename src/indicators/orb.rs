// =============================================================================
// Opening-Range Breakout levels
// =============================================================================
//
// The high/low of the bars whose timestamps fall in
// [session_open, session_open + window) define the day's opening range. Both
// levels are unknown until at least one bar lands inside the window.
// =============================================================================

use chrono::{Duration, NaiveTime};

use crate::market_data::Bar;

/// Opening-range high and low for one symbol-day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbLevels {
    pub orh: f64,
    pub orl: f64,
}

/// Scan `bars` for the opening-range window and return its high/low.
///
/// The window is half-open: a bar stamped exactly at the window end is
/// excluded. Returns `None` when no bar falls inside the window.
pub fn opening_range(bars: &[Bar], session_open: NaiveTime, window_minutes: u32) -> Option<OrbLevels> {
    let window_end = session_open + Duration::minutes(i64::from(window_minutes));

    let mut orh = f64::NEG_INFINITY;
    let mut orl = f64::INFINITY;
    let mut seen = false;

    for bar in bars {
        let t = bar.ts.time();
        if t >= session_open && t < window_end {
            orh = orh.max(bar.high);
            orl = orl.min(bar.low);
            seen = true;
        }
    }

    seen.then_some(OrbLevels { orh, orl })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(hour: u32, minute: u32, high: f64, low: f64) -> Bar {
        let ts = NaiveDate::from_ymd_opt(2025, 7, 14)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap();
        Bar {
            ts,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 100,
        }
    }

    fn nine_am() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn empty_window_is_unknown() {
        assert_eq!(opening_range(&[], nine_am(), 15), None);
        // Bars exist but all lie after the window.
        let bars = vec![bar(9, 20, 105.0, 95.0)];
        assert_eq!(opening_range(&bars, nine_am(), 15), None);
    }

    #[test]
    fn high_low_over_the_window() {
        let bars = vec![
            bar(9, 0, 10_050.0, 9_970.0),
            bar(9, 5, 10_000.0, 9_950.0),
            bar(9, 14, 9_990.0, 9_900.0),
            // Outside the 15-minute window; must not widen the range.
            bar(9, 15, 11_000.0, 9_000.0),
        ];
        let levels = opening_range(&bars, nine_am(), 15).unwrap();
        assert_eq!(levels.orh, 10_050.0);
        assert_eq!(levels.orl, 9_900.0);
    }

    #[test]
    fn window_end_is_exclusive() {
        let bars = vec![bar(9, 15, 123.0, 100.0)];
        assert_eq!(opening_range(&bars, nine_am(), 15), None);
        // But minute 14 is in.
        let bars = vec![bar(9, 14, 123.0, 100.0)];
        assert!(opening_range(&bars, nine_am(), 15).is_some());
    }

    #[test]
    fn pre_open_bars_excluded() {
        let bars = vec![bar(8, 55, 999.0, 1.0), bar(9, 1, 100.0, 90.0)];
        let levels = opening_range(&bars, nine_am(), 15).unwrap();
        assert_eq!(levels.orh, 100.0);
        assert_eq!(levels.orl, 90.0);
    }
}
