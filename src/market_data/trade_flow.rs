// =============================================================================
// Trade-side counters — per-symbol buy/sell volume over a rolling minute
// =============================================================================
//
// The trade feed signs each volume by initiator (positive = buyer-initiated).
// The accumulators feed the trade-strength indicator and reset whenever a
// tick arrives more than 60 seconds past the window start, keyed on event
// time rather than wall clock.
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDateTime;
use parking_lot::RwLock;

/// Window length before the accumulators reset.
const WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy)]
struct SideVolumes {
    buy_volume: u64,
    sell_volume: u64,
    window_start: NaiveDateTime,
}

/// Thread-safe per-symbol signed-volume accumulator.
pub struct TradeFlowTracker {
    windows: RwLock<HashMap<String, SideVolumes>>,
}

impl TradeFlowTracker {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Record one tick's signed volume. Zero volumes are ignored.
    pub fn record(&self, symbol: &str, signed_volume: i64, at: NaiveDateTime) {
        if signed_volume == 0 {
            return;
        }

        let mut map = self.windows.write();
        let entry = map.entry(symbol.to_string()).or_insert(SideVolumes {
            buy_volume: 0,
            sell_volume: 0,
            window_start: at,
        });

        if (at - entry.window_start).num_seconds() > WINDOW_SECS {
            entry.buy_volume = 0;
            entry.sell_volume = 0;
            entry.window_start = at;
        }

        if signed_volume > 0 {
            entry.buy_volume += signed_volume as u64;
        } else {
            entry.sell_volume += signed_volume.unsigned_abs();
        }
    }

    /// Current (buy, sell) accumulated volumes, if any tick has been seen.
    pub fn volumes(&self, symbol: &str) -> Option<(u64, u64)> {
        self.windows
            .read()
            .get(symbol)
            .map(|w| (w.buy_volume, w.sell_volume))
    }

    pub fn drop_symbol(&self, symbol: &str) {
        self.windows.write().remove(symbol);
    }
}

impl Default for TradeFlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
