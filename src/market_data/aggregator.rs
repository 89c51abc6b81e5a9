// =============================================================================
// Candle aggregator — folds trade ticks into one-minute OHLCV bars
// =============================================================================
//
// One in-progress bucket per symbol at most. A tick for a later minute
// freezes the bucket into a completed Bar (the caller appends it to the frame
// store and runs the strategy on it) and opens a new bucket. Minute
// boundaries come from the tick's own event time, never from the wall clock.
// =============================================================================

use std::collections::HashMap;

use chrono::{NaiveDateTime, Timelike};
use parking_lot::RwLock;
use tracing::debug;

use crate::market_data::Bar;

/// Mutable in-progress bar for one symbol.
#[derive(Debug, Clone, Copy)]
struct PartialBar {
    minute: NaiveDateTime,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

impl PartialBar {
    fn start(minute: NaiveDateTime, price: f64, volume: u64) -> Self {
        Self {
            minute,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn freeze(self) -> Bar {
        Bar {
            ts: self.minute,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

fn truncate_to_minute(at: NaiveDateTime) -> NaiveDateTime {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Thread-safe aggregator holding one optional in-progress bucket per symbol.
pub struct CandleAggregator {
    current: RwLock<HashMap<String, PartialBar>>,
}

impl CandleAggregator {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one tick. Returns the completed bar when this tick rolls the
    /// symbol over to a new minute.
    ///
    /// Ticks with a non-positive price or zero volume are ignored, as are
    /// ticks older than the current bucket's minute (the completed bar for
    /// that minute has already been emitted — re-emitting would duplicate
    /// it).
    pub fn on_tick(
        &self,
        symbol: &str,
        price: f64,
        volume: u64,
        at: NaiveDateTime,
    ) -> Option<Bar> {
        if price <= 0.0 || volume == 0 {
            return None;
        }

        let minute = truncate_to_minute(at);
        let mut map = self.current.write();

        if let Some(partial) = map.get_mut(symbol) {
            if partial.minute == minute {
                partial.high = partial.high.max(price);
                partial.low = partial.low.min(price);
                partial.close = price;
                partial.volume += volume;
                return None;
            }
            if minute > partial.minute {
                let completed = partial.freeze();
                *partial = PartialBar::start(minute, price, volume);
                return Some(completed);
            }
            debug!(symbol, tick_minute = %minute, bucket = %partial.minute, "stale tick ignored");
            return None;
        }

        map.insert(symbol.to_string(), PartialBar::start(minute, price, volume));
        None
    }

    /// Finalize and return the in-progress bar for one symbol, if any.
    /// Used when a symbol is dropped or the engine shuts down.
    pub fn flush(&self, symbol: &str) -> Option<Bar> {
        self.current.write().remove(symbol).map(PartialBar::freeze)
    }

    /// Finalize every in-progress bar (engine shutdown).
    pub fn flush_all(&self) -> Vec<(String, Bar)> {
        self.current
            .write()
            .drain()
            .map(|(symbol, partial)| (symbol, partial.freeze()))
            .collect()
    }

    pub fn drop_symbol(&self, symbol: &str) {
        self.current.write().remove(symbol);
    }
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 14)
            .unwrap()
            .and_hms_opt(9, min, sec)
            .unwrap()
    }

    #[test]
    fn first_tick_opens_bucket_without_emitting() {
        let agg = CandleAggregator::new();
        assert!(agg.on_tick("005930", 100.0, 5, at(0, 3)).is_none());
        let bar = agg.flush("005930").unwrap();
        assert_eq!(bar.ts, at(0, 0));
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.volume, 5);
    }

    #[test]
    fn same_minute_folds_ohlcv() {
        let agg = CandleAggregator::new();
        agg.on_tick("005930", 100.0, 5, at(0, 1));
        agg.on_tick("005930", 104.0, 2, at(0, 20));
        agg.on_tick("005930", 98.0, 3, at(0, 45));
        agg.on_tick("005930", 101.0, 1, at(0, 59));

        let bar = agg.flush("005930").unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 104.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 101.0);
        assert_eq!(bar.volume, 11);
    }

    #[test]
    fn minute_rollover_emits_completed_bar() {
        let agg = CandleAggregator::new();
        agg.on_tick("005930", 100.0, 5, at(0, 10));
        let completed = agg.on_tick("005930", 102.0, 1, at(1, 0)).unwrap();
        assert_eq!(completed.ts, at(0, 0));
        assert_eq!(completed.close, 100.0);

        // New bucket carries the rollover tick.
        let next = agg.flush("005930").unwrap();
        assert_eq!(next.ts, at(1, 0));
        assert_eq!(next.open, 102.0);
        assert_eq!(next.volume, 1);
    }

    #[test]
    fn minute_gap_emits_previous_without_gap_filling() {
        // B1: a jump of more than one minute still emits exactly one bar.
        let agg = CandleAggregator::new();
        agg.on_tick("005930", 100.0, 5, at(0, 10));
        let completed = agg.on_tick("005930", 103.0, 2, at(4, 30)).unwrap();
        assert_eq!(completed.ts, at(0, 0));

        let next = agg.flush("005930").unwrap();
        assert_eq!(next.ts, at(4, 0));
    }

    #[test]
    fn stale_tick_does_not_re_emit() {
        // L1: re-feeding a tick for an already-emitted minute produces no
        // second completed bar.
        let agg = CandleAggregator::new();
        agg.on_tick("005930", 100.0, 5, at(0, 10));
        assert!(agg.on_tick("005930", 101.0, 1, at(1, 0)).is_some());
        assert!(agg.on_tick("005930", 100.0, 5, at(0, 10)).is_none());
        // The current bucket is untouched by the stale tick.
        let bar = agg.flush("005930").unwrap();
        assert_eq!(bar.ts, at(1, 0));
        assert_eq!(bar.volume, 1);
    }

    #[test]
    fn zero_volume_and_bad_price_ignored() {
        let agg = CandleAggregator::new();
        assert!(agg.on_tick("005930", 0.0, 5, at(0, 0)).is_none());
        assert!(agg.on_tick("005930", -10.0, 5, at(0, 0)).is_none());
        assert!(agg.on_tick("005930", 100.0, 0, at(0, 0)).is_none());
        assert!(agg.flush("005930").is_none());
    }

    #[test]
    fn symbols_are_independent() {
        let agg = CandleAggregator::new();
        agg.on_tick("005930", 100.0, 1, at(0, 0));
        agg.on_tick("035720", 50.0, 1, at(2, 0));
        // Rolling one symbol over does not touch the other.
        assert!(agg.on_tick("005930", 101.0, 1, at(1, 0)).is_some());
        assert_eq!(agg.flush("035720").unwrap().ts, at(2, 0));
    }

    #[test]
    fn flush_all_drains_every_bucket() {
        let agg = CandleAggregator::new();
        agg.on_tick("005930", 100.0, 1, at(0, 0));
        agg.on_tick("035720", 50.0, 1, at(0, 0));
        let mut flushed = agg.flush_all();
        flushed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].0, "005930");
        assert!(agg.flush("005930").is_none());
    }
}
