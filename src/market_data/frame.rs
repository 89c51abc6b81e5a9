// =============================================================================
// Frame store — per-symbol ring of completed one-minute bars
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A completed one-minute OHLCV bar. `ts` is the bar's open minute, truncated
/// to the minute, in the broker's local timezone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Thread-safe store of completed bars, keyed by symbol. Each symbol's ring
/// holds at most `max_bars` entries; a bar whose timestamp matches the last
/// stored bar overwrites it (late corrections), otherwise it is appended.
pub struct FrameStore {
    frames: RwLock<HashMap<String, VecDeque<Bar>>>,
    max_bars: usize,
}

impl FrameStore {
    pub fn new(max_bars: usize) -> Self {
        Self {
            frames: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Append `bar`, or replace the last bar when the timestamp matches.
    ///
    /// Timestamps are expected in ascending order per symbol; an out-of-order
    /// bar older than the current tail is dropped rather than spliced in.
    pub fn append_or_replace(&self, symbol: &str, bar: Bar) {
        let mut map = self.frames.write();
        let ring = map
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        match ring.back().map(|last| last.ts) {
            Some(tail) if tail == bar.ts => {
                *ring.back_mut().expect("ring is non-empty") = bar;
            }
            Some(tail) if tail > bar.ts => {
                debug!(symbol, ts = %bar.ts, %tail, "dropping out-of-order bar");
            }
            _ => {
                ring.push_back(bar);
                while ring.len() > self.max_bars {
                    ring.pop_front();
                }
            }
        }
    }

    /// Seed a symbol's frame from a history fetch. Rows are applied through
    /// the same append-or-replace path as live bars, so loading history in
    /// one or several chunks yields the same frame.
    pub fn load_history(&self, symbol: &str, bars: impl IntoIterator<Item = Bar>) {
        for bar in bars {
            self.append_or_replace(symbol, bar);
        }
    }

    /// Snapshot of a symbol's bars, oldest first.
    pub fn bars(&self, symbol: &str) -> Vec<Bar> {
        self.frames
            .read()
            .get(symbol)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.frames.read().get(symbol).map_or(0, VecDeque::len)
    }

    pub fn last_close(&self, symbol: &str) -> Option<f64> {
        self.frames
            .read()
            .get(symbol)
            .and_then(|ring| ring.back().map(|b| b.close))
    }

    /// Drop the symbol's frame entirely (called when a symbol is
    /// unsubscribed).
    pub fn drop_symbol(&self, symbol: &str) {
        self.frames.write().remove(symbol);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(minute: u32, close: f64) -> Bar {
        let ts = NaiveDate::from_ymd_opt(2025, 7, 14)
            .unwrap()
            .and_hms_opt(9, minute, 0)
            .unwrap();
        Bar {
            ts,
            open: close,
            high: close + 10.0,
            low: close - 10.0,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn append_then_read_back() {
        let store = FrameStore::new(10);
        store.append_or_replace("005930", bar(0, 100.0));
        store.append_or_replace("005930", bar(1, 101.0));
        let bars = store.bars("005930");
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 100.0);
        assert_eq!(bars[1].close, 101.0);
    }

    #[test]
    fn same_timestamp_overwrites() {
        let store = FrameStore::new(10);
        store.append_or_replace("005930", bar(0, 100.0));
        store.append_or_replace("005930", bar(0, 105.0));
        let bars = store.bars("005930");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 105.0);
    }

    #[test]
    fn ring_trims_to_capacity() {
        let store = FrameStore::new(3);
        for m in 0..5 {
            store.append_or_replace("005930", bar(m, 100.0 + m as f64));
        }
        let bars = store.bars("005930");
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 102.0);
        assert_eq!(bars[2].close, 104.0);
    }

    #[test]
    fn out_of_order_bar_is_dropped() {
        let store = FrameStore::new(10);
        store.append_or_replace("005930", bar(5, 100.0));
        store.append_or_replace("005930", bar(2, 90.0));
        let bars = store.bars("005930");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 100.0);
    }

    #[test]
    fn history_load_is_chunk_invariant() {
        // Loading N bars equals loading the first k then the remaining N-k.
        let all: Vec<Bar> = (0..8).map(|m| bar(m, 100.0 + m as f64)).collect();

        let one_shot = FrameStore::new(100);
        one_shot.load_history("005930", all.clone());

        let chunked = FrameStore::new(100);
        chunked.load_history("005930", all[..3].to_vec());
        chunked.load_history("005930", all[3..].to_vec());

        assert_eq!(one_shot.bars("005930"), chunked.bars("005930"));
    }

    #[test]
    fn history_then_live_equals_all_live() {
        // L2: N historical bars + K live bars == all N+K applied in order.
        let all: Vec<Bar> = (0..6).map(|m| bar(m, 200.0 + m as f64)).collect();

        let mixed = FrameStore::new(100);
        mixed.load_history("005930", all[..4].to_vec());
        for b in &all[4..] {
            mixed.append_or_replace("005930", *b);
        }

        let live_only = FrameStore::new(100);
        for b in &all {
            live_only.append_or_replace("005930", *b);
        }

        assert_eq!(mixed.bars("005930"), live_only.bars("005930"));
    }

    #[test]
    fn drop_symbol_clears_frame() {
        let store = FrameStore::new(10);
        store.append_or_replace("005930", bar(0, 100.0));
        store.drop_symbol("005930");
        assert_eq!(store.len("005930"), 0);
        assert_eq!(store.last_close("005930"), None);
    }
}
