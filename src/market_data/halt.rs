// =============================================================================
// Volatility-halt tracker — per-symbol halt flag from the halt feed
// =============================================================================
//
// The strategy treats an active halt as a hard block on new entries and as a
// forced-exit signal on open positions.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

pub struct HaltTracker {
    halted: RwLock<HashMap<String, bool>>,
}

impl HaltTracker {
    pub fn new() -> Self {
        Self {
            halted: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, symbol: &str, active: bool) {
        let previous = self
            .halted
            .write()
            .insert(symbol.to_string(), active)
            .unwrap_or(false);
        if previous != active {
            info!(symbol, active, "volatility halt state changed");
        }
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        self.halted.read().get(symbol).copied().unwrap_or(false)
    }

    pub fn drop_symbol(&self, symbol: &str) {
        self.halted.write().remove(symbol);
    }
}

impl Default for HaltTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_not_halted() {
        let tracker = HaltTracker::new();
        assert!(!tracker.is_halted("005930"));
    }

    #[test]
    fn activation_and_release() {
        let tracker = HaltTracker::new();
        tracker.set("005930", true);
        assert!(tracker.is_halted("005930"));
        tracker.set("005930", false);
        assert!(!tracker.is_halted("005930"));
    }

    #[test]
    fn drop_symbol_resets_state() {
        let tracker = HaltTracker::new();
        tracker.set("005930", true);
        tracker.drop_symbol("005930");
        assert!(!tracker.is_halted("005930"));
    }
}
