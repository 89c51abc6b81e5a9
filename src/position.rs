// =============================================================================
// Position ledger — per-symbol state machine for pending and open trades
// =============================================================================
//
// Life-cycle:
//   PendingEntry -> InPosition -> PendingExit -> Closed
//   PendingEntry -> (cancel, no fills) -> removed
//   PendingEntry -> (cancel after partial fill) -> InPosition (reduced size)
//   InPosition   -> PendingExit (partial TP) -> InPosition (reduced size)
//
// The ledger never talks to the broker. It is mutated by the execution
// reconciler, the strategy path, and the kill switch — always from the
// owning symbol's worker task, which is what serializes access per symbol.
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExitSignal;

/// Risk thresholds captured from the live strategy configuration when the
/// position is opened. They never change afterwards, even if the dashboard
/// rewrites the live configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockedRisk {
    pub target_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub partial_profit_pct: Option<f64>,
    pub partial_profit_ratio: f64,
}

/// Position state. `Searching` is the implicit resting state — the ledger
/// only holds entries from `PendingEntry` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Searching,
    PendingEntry,
    InPosition,
    PendingExit,
    Closed,
    ErrorExitOrder,
    ErrorLiquidation,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Searching => write!(f, "Searching"),
            Self::PendingEntry => write!(f, "PendingEntry"),
            Self::InPosition => write!(f, "InPosition"),
            Self::PendingExit => write!(f, "PendingExit"),
            Self::Closed => write!(f, "Closed"),
            Self::ErrorExitOrder => write!(f, "ErrorExitOrder"),
            Self::ErrorLiquidation => write!(f, "ErrorLiquidation"),
        }
    }
}

/// A single tracked position for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub state: PositionState,
    /// Unset until the first entry fill.
    pub entry_price: Option<f64>,
    /// Current net long quantity.
    pub size: u64,
    pub entry_time: Option<NaiveDateTime>,
    /// Broker order id of the in-flight order, set iff state is pending.
    pub pending_order_id: Option<String>,
    /// Quantity requested by the pending entry order.
    pub original_order_qty: u64,
    /// Fill accumulators for the in-flight order.
    pub filled_qty: u64,
    pub filled_value: f64,
    /// Unfilled quantity seen on the most recent order update, used to reject
    /// duplicate fill events (only forward progress is accepted).
    pub last_unfilled_qty: Option<u64>,
    /// Reason for the current exit attempt.
    pub exit_signal: Option<ExitSignal>,
    pub original_size_before_exit: u64,
    pub size_to_sell: u64,
    /// Sticky: once a partial exit has fully filled, stays true for the rest
    /// of the position's lifetime.
    pub partial_profit_taken: bool,
    pub risk: LockedRisk,
}

impl Position {
    /// A freshly accepted entry order.
    pub fn pending_entry(
        symbol: impl Into<String>,
        order_id: impl Into<String>,
        quantity: u64,
        risk: LockedRisk,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            state: PositionState::PendingEntry,
            entry_price: None,
            size: 0,
            entry_time: None,
            pending_order_id: Some(order_id.into()),
            original_order_qty: quantity,
            filled_qty: 0,
            filled_value: 0.0,
            last_unfilled_qty: None,
            exit_signal: None,
            original_size_before_exit: 0,
            size_to_sell: 0,
            partial_profit_taken: false,
            risk,
        }
    }

    /// A holding discovered on the remote ledger with no local counterpart
    /// (created by the balance reconciler).
    pub fn adopted(
        symbol: impl Into<String>,
        size: u64,
        avg_price: f64,
        entry_time: NaiveDateTime,
        risk: LockedRisk,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            state: PositionState::InPosition,
            entry_price: Some(avg_price),
            size,
            entry_time: Some(entry_time),
            pending_order_id: None,
            original_order_qty: size,
            filled_qty: size,
            filled_value: avg_price * size as f64,
            last_unfilled_qty: None,
            exit_signal: None,
            original_size_before_exit: 0,
            size_to_sell: 0,
            partial_profit_taken: false,
            risk,
        }
    }

    /// Profit percentage at `price` relative to the entry price.
    pub fn profit_pct(&self, price: f64) -> Option<f64> {
        let entry = self.entry_price?;
        if entry <= 0.0 {
            return None;
        }
        Some((price - entry) / entry * 100.0)
    }

    /// Transition into `PendingExit` for an accepted sell order.
    pub fn arm_exit(&mut self, order_id: impl Into<String>, signal: ExitSignal, size_to_sell: u64) {
        self.state = PositionState::PendingExit;
        self.pending_order_id = Some(order_id.into());
        self.exit_signal = Some(signal);
        self.original_size_before_exit = self.size;
        self.size_to_sell = size_to_sell;
        self.filled_qty = 0;
        self.filled_value = 0.0;
        self.last_unfilled_qty = None;
    }

    /// Clear every in-flight-order field after the order resolves.
    pub fn clear_pending(&mut self) {
        self.pending_order_id = None;
        self.exit_signal = None;
        self.size_to_sell = 0;
        self.filled_qty = 0;
        self.filled_value = 0.0;
        self.last_unfilled_qty = None;
    }

    /// True while an entry or exit order is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            PositionState::PendingEntry | PositionState::PendingExit
        )
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Thread-safe mapping symbol -> position. The only authoritative in-process
/// record of exposure; the dashboard only ever sees cloned snapshots.
pub struct PositionLedger {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, position: Position) {
        info!(
            symbol = %position.symbol,
            state = %position.state,
            order_id = position.pending_order_id.as_deref().unwrap_or("-"),
            "position tracked"
        );
        self.positions
            .write()
            .insert(position.symbol.clone(), position);
    }

    pub fn remove(&self, symbol: &str) -> Option<Position> {
        self.positions.write().remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    /// Mutate a position in place. Returns false when the symbol has no
    /// ledger entry.
    pub fn apply<F: FnOnce(&mut Position)>(&self, symbol: &str, f: F) -> bool {
        match self.positions.write().get_mut(symbol) {
            Some(pos) => {
                f(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every tracked position.
    pub fn snapshot(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.positions.read().values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    /// Symbols with any live ledger entry — these must stay subscribed.
    pub fn symbols(&self) -> Vec<String> {
        self.positions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.positions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.read().is_empty()
    }

    /// Number of positions currently in `InPosition`.
    pub fn in_position_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.state == PositionState::InPosition)
            .count()
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLedger")
            .field("tracked", &self.positions.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn risk() -> LockedRisk {
        LockedRisk {
            target_profit_pct: 2.5,
            stop_loss_pct: -1.0,
            partial_profit_pct: Some(1.5),
            partial_profit_ratio: 0.4,
        }
    }

    #[test]
    fn pending_entry_starts_empty() {
        let pos = Position::pending_entry("005930", "ORD1", 99, risk());
        assert_eq!(pos.state, PositionState::PendingEntry);
        assert_eq!(pos.size, 0);
        assert_eq!(pos.entry_price, None);
        assert_eq!(pos.pending_order_id.as_deref(), Some("ORD1"));
        assert!(pos.is_pending());
        assert!(!pos.partial_profit_taken);
    }

    #[test]
    fn profit_pct_requires_entry_price() {
        let mut pos = Position::pending_entry("005930", "ORD1", 99, risk());
        assert_eq!(pos.profit_pct(10_000.0), None);
        pos.entry_price = Some(10_050.0);
        let pct = pos.profit_pct(10_301.25).unwrap();
        assert!((pct - 2.5).abs() < 1e-9);
    }

    #[test]
    fn arm_exit_sets_bookkeeping() {
        let mut pos = Position::adopted(
            "005930",
            99,
            10_050.0,
            chrono::NaiveDateTime::default(),
            risk(),
        );
        pos.arm_exit("ORD2", ExitSignal::PartialTakeProfit, 40);
        assert_eq!(pos.state, PositionState::PendingExit);
        assert_eq!(pos.original_size_before_exit, 99);
        assert_eq!(pos.size_to_sell, 40);
        assert_eq!(pos.filled_qty, 0);
        assert_eq!(pos.exit_signal, Some(ExitSignal::PartialTakeProfit));
    }

    #[test]
    fn ledger_insert_get_remove() {
        let ledger = PositionLedger::new();
        ledger.insert(Position::pending_entry("005930", "ORD1", 10, risk()));
        assert!(ledger.contains("005930"));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.in_position_count(), 0);

        ledger.apply("005930", |p| {
            p.state = PositionState::InPosition;
            p.size = 10;
            p.entry_price = Some(100.0);
        });
        assert_eq!(ledger.in_position_count(), 1);

        let removed = ledger.remove("005930").unwrap();
        assert_eq!(removed.size, 10);
        assert!(ledger.is_empty());
    }

    #[test]
    fn apply_on_missing_symbol_is_noop() {
        let ledger = PositionLedger::new();
        assert!(!ledger.apply("005930", |p| p.size = 1));
    }

    #[test]
    fn snapshot_is_sorted_and_detached() {
        let ledger = PositionLedger::new();
        ledger.insert(Position::pending_entry("035720", "A", 1, risk()));
        ledger.insert(Position::pending_entry("005930", "B", 1, risk()));
        let mut snap = ledger.snapshot();
        assert_eq!(snap[0].symbol, "005930");
        assert_eq!(snap[1].symbol, "035720");
        // Mutating the snapshot must not touch the ledger.
        snap[0].size = 999;
        assert_eq!(ledger.get("005930").unwrap().size, 0);
    }
}
