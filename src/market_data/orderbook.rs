// =============================================================================
// Order-book cache — latest aggregate depth per symbol
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

/// Latest aggregate resting volumes for one symbol. The book feed reports the
/// totals directly; no per-level state is kept.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BookTotals {
    pub total_bid_volume: i64,
    pub total_ask_volume: i64,
}

/// Thread-safe cache of the latest book totals per symbol.
pub struct BookCache {
    books: RwLock<HashMap<String, BookTotals>>,
}

impl BookCache {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, symbol: &str, total_bid_volume: i64, total_ask_volume: i64) {
        self.books.write().insert(
            symbol.to_string(),
            BookTotals {
                total_bid_volume,
                total_ask_volume,
            },
        );
    }

    pub fn totals(&self, symbol: &str) -> Option<BookTotals> {
        self.books.read().get(symbol).copied()
    }

    pub fn drop_symbol(&self, symbol: &str) {
        self.books.write().remove(symbol);
    }
}

impl Default for BookCache {
    fn default() -> Self {
        Self::new()
    }
}
