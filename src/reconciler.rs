// =============================================================================
// Execution & balance reconciler
// =============================================================================
//
// Applies the broker's asynchronous order-update and holdings-update messages
// to the position ledger. This is the only component allowed to adopt remote
// truth over local state, and it does so conservatively: order updates are
// keyed by the pending order id, balance updates never touch the entry price,
// and duplicate fill events are rejected by requiring forward progress in the
// reported unfilled quantity.
//
// The functions are synchronous: they mutate the ledger and append to the
// trade journal, and hand any subscription changes back to the caller as
// actions (the symbol worker forwards them to the subscription manager).
// =============================================================================

use chrono::Local;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::gateway::events::{BalanceUpdate, OrderUpdate};
use crate::journal::TradeRecord;
use crate::position::{Position, PositionState};
use crate::types::{ExitSignal, OrderStatus};

/// Subscription change requested by a reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// A remote holding appeared with no local position; its feeds must be
    /// registered and its history seeded.
    Subscribe(String),
    /// The symbol no longer has a position; unsubscribe unless it is still a
    /// screening candidate.
    Release(String),
}

// =============================================================================
// Order updates
// =============================================================================

pub fn apply_order_update(state: &AppState, upd: &OrderUpdate) -> Vec<ReconcileAction> {
    let Some(pos) = state.ledger.get(&upd.symbol) else {
        // Late update for a position already closed: a no-op by design.
        debug!(symbol = %upd.symbol, order_id = %upd.order_id, "order update without position");
        return Vec::new();
    };

    if pos.pending_order_id.as_deref() != Some(upd.order_id.as_str()) {
        debug!(
            symbol = %upd.symbol,
            order_id = %upd.order_id,
            pending = pos.pending_order_id.as_deref().unwrap_or("-"),
            "order update does not match pending order"
        );
        return Vec::new();
    }

    match pos.state {
        PositionState::PendingEntry => apply_entry_update(state, pos, upd),
        PositionState::PendingExit => apply_exit_update(state, pos, upd),
        _ => {
            debug!(symbol = %upd.symbol, state = %pos.state, "order update in non-pending state ignored");
            Vec::new()
        }
    }
}

/// Duplicate fills must not double-count: only accept an update whose
/// unfilled quantity has moved forward (L3 — filled_qty never decreases).
fn is_duplicate_fill(pos: &Position, upd: &OrderUpdate) -> bool {
    match pos.last_unfilled_qty {
        Some(prev) => upd.unfilled_qty >= prev,
        None => false,
    }
}

fn apply_entry_update(state: &AppState, pos: Position, upd: &OrderUpdate) -> Vec<ReconcileAction> {
    let symbol = pos.symbol.clone();

    match upd.status {
        OrderStatus::Accepted => {
            state.ledger.apply(&symbol, |p| {
                p.last_unfilled_qty = Some(upd.unfilled_qty);
            });
            Vec::new()
        }
        OrderStatus::Fill | OrderStatus::PartialFill if upd.exec_qty > 0 => {
            if is_duplicate_fill(&pos, upd) {
                debug!(symbol, order_id = %upd.order_id, "duplicate entry fill dropped");
                return Vec::new();
            }

            let filled_qty = pos.filled_qty + upd.exec_qty;
            let filled_value = pos.filled_value + upd.exec_qty as f64 * upd.exec_price;
            let complete = upd.unfilled_qty == 0 || filled_qty >= pos.original_order_qty;

            state.ledger.apply(&symbol, |p| {
                p.filled_qty = filled_qty;
                p.filled_value = filled_value;
                p.last_unfilled_qty = Some(upd.unfilled_qty);

                if complete {
                    let entry_price = filled_value / filled_qty as f64;
                    p.state = PositionState::InPosition;
                    p.size = filled_qty;
                    p.entry_price = Some(entry_price);
                    p.entry_time = Some(Local::now().naive_local());
                    p.partial_profit_taken = false;
                    p.clear_pending();
                }
            });

            if complete {
                info!(symbol, qty = filled_qty, "entry filled, position open");
            } else {
                debug!(symbol, filled = filled_qty, of = pos.original_order_qty, "partial entry fill");
            }
            state.increment_version();
            Vec::new()
        }
        status if status.is_terminal_without_fill() => {
            if pos.filled_qty == 0 {
                // Rejected before any fill: the entry never existed.
                info!(symbol, order_id = %upd.order_id, ?status, "entry order ended unfilled, dropping");
                state.ledger.remove(&symbol);
                state.increment_version();
                return vec![ReconcileAction::Release(symbol)];
            }

            // Partial fill then cancel: keep what we actually bought.
            let filled_qty = pos.filled_qty;
            let entry_price = pos.filled_value / filled_qty as f64;
            state.ledger.apply(&symbol, |p| {
                p.state = PositionState::InPosition;
                p.size = filled_qty;
                p.entry_price = Some(entry_price);
                p.entry_time = Some(Local::now().naive_local());
                p.partial_profit_taken = false;
                p.clear_pending();
            });
            warn!(symbol, size = filled_qty, "entry cancelled after partial fill, holding remainder");
            state.increment_version();
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn apply_exit_update(state: &AppState, pos: Position, upd: &OrderUpdate) -> Vec<ReconcileAction> {
    let symbol = pos.symbol.clone();
    let signal = pos.exit_signal.unwrap_or(ExitSignal::TakeProfit);
    let is_partial = signal == ExitSignal::PartialTakeProfit;

    match upd.status {
        OrderStatus::Accepted => {
            state.ledger.apply(&symbol, |p| {
                p.last_unfilled_qty = Some(upd.unfilled_qty);
            });
            Vec::new()
        }
        OrderStatus::Fill | OrderStatus::PartialFill if upd.exec_qty > 0 => {
            if is_duplicate_fill(&pos, upd) {
                debug!(symbol, order_id = %upd.order_id, "duplicate exit fill dropped");
                return Vec::new();
            }

            let filled_qty = pos.filled_qty + upd.exec_qty;
            let filled_value = pos.filled_value + upd.exec_qty as f64 * upd.exec_price;
            let target = if is_partial {
                pos.size_to_sell
            } else {
                pos.original_size_before_exit
            };
            let complete = upd.unfilled_qty == 0 || filled_qty >= target;

            if !complete {
                state.ledger.apply(&symbol, |p| {
                    p.filled_qty = filled_qty;
                    p.filled_value = filled_value;
                    p.last_unfilled_qty = Some(upd.unfilled_qty);
                });
                debug!(symbol, filled = filled_qty, of = target, "partial exit fill");
                state.increment_version();
                return Vec::new();
            }

            let remaining = pos.original_size_before_exit.saturating_sub(filled_qty);

            if is_partial && remaining > 0 {
                state.ledger.apply(&symbol, |p| {
                    p.state = PositionState::InPosition;
                    p.size = remaining;
                    p.partial_profit_taken = true;
                    p.clear_pending();
                });
                record_exit(state, &pos, signal, filled_qty, filled_value);
                info!(symbol, sold = filled_qty, remaining, "partial take-profit complete");
                state.increment_version();
                return Vec::new();
            }

            // Full liquidation (or a partial that consumed everything).
            record_exit(state, &pos, signal, filled_qty, filled_value);
            state.ledger.remove(&symbol);
            info!(symbol, sold = filled_qty, %signal, "position closed");
            state.increment_version();
            vec![ReconcileAction::Release(symbol)]
        }
        status if status.is_terminal_without_fill() => {
            let remaining = pos.original_size_before_exit.saturating_sub(pos.filled_qty);
            if remaining > 0 {
                state.ledger.apply(&symbol, |p| {
                    p.state = PositionState::InPosition;
                    p.size = remaining;
                    p.clear_pending();
                });
                warn!(symbol, ?status, remaining, "exit order ended early, back in position");
                state.increment_version();
                return Vec::new();
            }

            // Everything sold before the cancel landed; close out.
            record_exit(state, &pos, signal, pos.filled_qty, pos.filled_value);
            state.ledger.remove(&symbol);
            state.increment_version();
            vec![ReconcileAction::Release(symbol)]
        }
        _ => Vec::new(),
    }
}

fn record_exit(
    state: &AppState,
    pos: &Position,
    signal: ExitSignal,
    sold_qty: u64,
    exit_value: f64,
) {
    // One journal line per exit cycle. original_size is the size the exit
    // order was placed against, so the journal's fill sum matches it (P3).
    let record = TradeRecord {
        symbol: pos.symbol.clone(),
        entry_time: pos.entry_time,
        entry_price: pos.entry_price.unwrap_or(0.0),
        exit_value,
        original_size: if signal == ExitSignal::PartialTakeProfit {
            sold_qty
        } else {
            pos.original_size_before_exit
        },
        exit_signal: signal,
        closed_at: Local::now().naive_local(),
    };
    if let Err(e) = state.journal.append(&record) {
        warn!(symbol = %pos.symbol, error = %e, "failed to append trade journal record");
    }
    let pnl = record.realized_pnl();
    state.push_log(format!(
        "{} exit {} qty={} pnl={:.0}",
        pos.symbol, signal, sold_qty, pnl
    ));
}

// =============================================================================
// Balance updates
// =============================================================================

/// Holdings reconciliation. Lower priority than the order stream: it adjusts
/// sizes and creates/closes entries, but never rewrites an entry price.
pub fn apply_balance_update(state: &AppState, upd: &BalanceUpdate) -> Vec<ReconcileAction> {
    let Some(pos) = state.ledger.get(&upd.symbol) else {
        if upd.held_size > 0 {
            // Remote knows about a holding we do not: adopt it.
            let risk = state.strategy().locked_risk();
            warn!(
                symbol = %upd.symbol,
                size = upd.held_size,
                avg_price = upd.avg_price,
                "adopting remote holding with no local position"
            );
            state.ledger.insert(Position::adopted(
                upd.symbol.clone(),
                upd.held_size,
                upd.avg_price,
                Local::now().naive_local(),
                risk,
            ));
            state.increment_version();
            return vec![ReconcileAction::Subscribe(upd.symbol.clone())];
        }
        return Vec::new();
    };

    match pos.state {
        // The entry fill stream is authoritative while the order is live.
        PositionState::PendingEntry => Vec::new(),
        _ if upd.held_size == 0 && pos.size > 0 => {
            warn!(symbol = %upd.symbol, local_size = pos.size, "remote reports zero holdings, closing position");
            state.ledger.remove(&upd.symbol);
            state.push_log(format!("{} closed by balance reconciliation", upd.symbol));
            state.increment_version();
            vec![ReconcileAction::Release(upd.symbol.clone())]
        }
        PositionState::InPosition | PositionState::PendingExit
            if upd.held_size > 0 && pos.size != upd.held_size =>
        {
            warn!(
                symbol = %upd.symbol,
                local_size = pos.size,
                remote_size = upd.held_size,
                "size drift, adopting remote holdings"
            );
            state.ledger.apply(&upd.symbol, |p| {
                p.size = upd.held_size;
            });
            state.increment_version();
            Vec::new()
        }
        _ => Vec::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::position::LockedRisk;
    use crate::types::OrderSide;

    fn test_state(name: &str) -> AppState {
        let mut config = Config::default();
        config.engine.journal_path = std::env::temp_dir()
            .join(format!("mg-recon-{name}-{}.jsonl", std::process::id()))
            .to_string_lossy()
            .to_string();
        let _ = std::fs::remove_file(&config.engine.journal_path);
        AppState::new(&config)
    }

    fn risk() -> LockedRisk {
        LockedRisk {
            target_profit_pct: 2.5,
            stop_loss_pct: -1.0,
            partial_profit_pct: Some(1.5),
            partial_profit_ratio: 0.4,
        }
    }

    fn fill(order_id: &str, symbol: &str, exec_qty: u64, price: f64, unfilled: u64) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side: Some(OrderSide::Buy),
            status: OrderStatus::Fill,
            exec_qty,
            exec_price: price,
            unfilled_qty: unfilled,
            original_qty: 0,
        }
    }

    fn terminal(order_id: &str, symbol: &str, status: OrderStatus) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side: None,
            status,
            exec_qty: 0,
            exec_price: 0.0,
            unfilled_qty: 0,
            original_qty: 0,
        }
    }

    #[test]
    fn entry_full_fill_opens_position() {
        // S1: 99 shares fill at 10,050.
        let state = test_state("entry-fill");
        state
            .ledger
            .insert(Position::pending_entry("005930", "ORD1", 99, risk()));

        apply_order_update(&state, &fill("ORD1", "005930", 99, 10_050.0, 0));

        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::InPosition);
        assert_eq!(pos.size, 99);
        assert!((pos.entry_price.unwrap() - 10_050.0).abs() < 1e-9);
        assert_eq!(pos.pending_order_id, None);
        assert!(!pos.partial_profit_taken);
    }

    #[test]
    fn entry_partial_fills_accumulate_weighted_price() {
        let state = test_state("entry-partial");
        state
            .ledger
            .insert(Position::pending_entry("005930", "ORD1", 100, risk()));

        apply_order_update(&state, &fill("ORD1", "005930", 40, 10_000.0, 60));
        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::PendingEntry);
        assert_eq!(pos.filled_qty, 40);

        apply_order_update(&state, &fill("ORD1", "005930", 60, 10_100.0, 0));
        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::InPosition);
        assert_eq!(pos.size, 100);
        let expected = (40.0 * 10_000.0 + 60.0 * 10_100.0) / 100.0;
        assert!((pos.entry_price.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn duplicate_fill_is_not_double_counted() {
        // L3: a replayed update with the same unfilled quantity is dropped.
        let state = test_state("dup-fill");
        state
            .ledger
            .insert(Position::pending_entry("005930", "ORD1", 100, risk()));

        apply_order_update(&state, &fill("ORD1", "005930", 40, 10_000.0, 60));
        apply_order_update(&state, &fill("ORD1", "005930", 40, 10_000.0, 60));

        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.filled_qty, 40);
    }

    #[test]
    fn entry_cancel_without_fill_drops_position() {
        let state = test_state("entry-cancel");
        state
            .ledger
            .insert(Position::pending_entry("005930", "ORD1", 100, risk()));

        let actions =
            apply_order_update(&state, &terminal("ORD1", "005930", OrderStatus::Cancelled));
        assert!(!state.ledger.contains("005930"));
        assert_eq!(actions, vec![ReconcileAction::Release("005930".to_string())]);
    }

    #[test]
    fn entry_cancel_after_partial_fill_holds_remainder() {
        // S5: buy 100, fill 30, broker cancels the rest.
        let state = test_state("entry-cancel-partial");
        state
            .ledger
            .insert(Position::pending_entry("005930", "ORD1", 100, risk()));

        apply_order_update(&state, &fill("ORD1", "005930", 30, 10_000.0, 70));
        apply_order_update(&state, &terminal("ORD1", "005930", OrderStatus::Cancelled));

        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::InPosition);
        assert_eq!(pos.size, 30);
        assert!((pos.entry_price.unwrap() - 10_000.0).abs() < 1e-9);
    }

    fn open_position(state: &AppState, symbol: &str, size: u64, entry: f64) {
        let mut pos = Position::pending_entry(symbol, "SEED", size, risk());
        pos.state = PositionState::InPosition;
        pos.size = size;
        pos.entry_price = Some(entry);
        pos.entry_time = Some(Local::now().naive_local());
        pos.pending_order_id = None;
        state.ledger.insert(pos);
    }

    #[test]
    fn partial_exit_reduces_size_and_sets_flag() {
        // S2: size 99, partial take-profit sells 40.
        let state = test_state("exit-partial");
        open_position(&state, "005930", 99, 10_050.0);
        state.ledger.apply("005930", |p| {
            p.arm_exit("ORD2", ExitSignal::PartialTakeProfit, 40);
        });

        let actions = apply_order_update(&state, &fill("ORD2", "005930", 40, 10_205.0, 0));
        assert!(actions.is_empty());

        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::InPosition);
        assert_eq!(pos.size, 59);
        assert!(pos.partial_profit_taken);
        assert_eq!(pos.pending_order_id, None);

        // B2: fills matched size_to_sell exactly; no accidental full close.
        assert!(state.ledger.contains("005930"));
        let records = state.journal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_size, 40);
    }

    #[test]
    fn full_exit_closes_and_journals() {
        let state = test_state("exit-full");
        open_position(&state, "005930", 59, 10_050.0);
        state.ledger.apply("005930", |p| {
            p.arm_exit("ORD3", ExitSignal::TakeProfit, 59);
        });

        let actions = apply_order_update(&state, &fill("ORD3", "005930", 59, 10_301.0, 0));
        assert_eq!(actions, vec![ReconcileAction::Release("005930".to_string())]);
        assert!(!state.ledger.contains("005930"));

        let records = state.journal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_size, 59);
        assert_eq!(records[0].exit_signal, ExitSignal::TakeProfit);
        assert!(records[0].realized_pnl() > 0.0);
    }

    #[test]
    fn exit_cancel_restores_remainder() {
        let state = test_state("exit-cancel");
        open_position(&state, "005930", 50, 10_000.0);
        state.ledger.apply("005930", |p| {
            p.arm_exit("ORD4", ExitSignal::StopLoss, 50);
        });

        apply_order_update(&state, &fill("ORD4", "005930", 20, 9_900.0, 30));
        apply_order_update(&state, &terminal("ORD4", "005930", OrderStatus::Rejected));

        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.state, PositionState::InPosition);
        assert_eq!(pos.size, 30);
    }

    #[test]
    fn cancellation_after_all_fills_is_noop() {
        // B4: the position is already closed; a late cancel changes nothing.
        let state = test_state("late-cancel");
        open_position(&state, "005930", 10, 10_000.0);
        state.ledger.apply("005930", |p| {
            p.arm_exit("ORD5", ExitSignal::TakeProfit, 10);
        });
        apply_order_update(&state, &fill("ORD5", "005930", 10, 10_300.0, 0));
        assert!(!state.ledger.contains("005930"));

        let actions =
            apply_order_update(&state, &terminal("ORD5", "005930", OrderStatus::Cancelled));
        assert!(actions.is_empty());
        assert_eq!(state.journal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn order_update_for_unmatched_order_ignored() {
        let state = test_state("unmatched");
        open_position(&state, "005930", 10, 10_000.0);
        let actions = apply_order_update(&state, &fill("GHOST", "005930", 10, 10_300.0, 0));
        assert!(actions.is_empty());
        assert_eq!(state.ledger.get("005930").unwrap().size, 10);
    }

    #[test]
    fn balance_zero_closes_drifted_position() {
        // S3: local size 50, remote reports 0, no pending exit.
        let state = test_state("drift-close");
        open_position(&state, "005930", 50, 10_000.0);

        let actions = apply_balance_update(
            &state,
            &BalanceUpdate {
                symbol: "005930".to_string(),
                held_size: 0,
                avg_price: 0.0,
            },
        );
        assert_eq!(actions, vec![ReconcileAction::Release("005930".to_string())]);
        assert!(!state.ledger.contains("005930"));
        // No order was placed and nothing was journaled.
        assert!(state.journal.read_all().unwrap().is_empty());
    }

    #[test]
    fn balance_size_drift_adopts_remote() {
        // P4: the ledger converges to the most recent held size.
        let state = test_state("drift-size");
        open_position(&state, "005930", 50, 10_000.0);

        apply_balance_update(
            &state,
            &BalanceUpdate {
                symbol: "005930".to_string(),
                held_size: 45,
                avg_price: 10_111.0,
            },
        );
        let pos = state.ledger.get("005930").unwrap();
        assert_eq!(pos.size, 45);
        // Entry price is never rewritten from a balance update.
        assert!((pos.entry_price.unwrap() - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_holding_is_adopted_and_subscribed() {
        let state = test_state("adopt");
        let actions = apply_balance_update(
            &state,
            &BalanceUpdate {
                symbol: "035720".to_string(),
                held_size: 7,
                avg_price: 52_000.0,
            },
        );
        assert_eq!(
            actions,
            vec![ReconcileAction::Subscribe("035720".to_string())]
        );
        let pos = state.ledger.get("035720").unwrap();
        assert_eq!(pos.state, PositionState::InPosition);
        assert_eq!(pos.size, 7);
        assert!((pos.entry_price.unwrap() - 52_000.0).abs() < 1e-9);
    }

    #[test]
    fn balance_during_pending_entry_is_ignored() {
        let state = test_state("pending-entry-balance");
        state
            .ledger
            .insert(Position::pending_entry("005930", "ORD1", 100, risk()));
        let actions = apply_balance_update(
            &state,
            &BalanceUpdate {
                symbol: "005930".to_string(),
                held_size: 40,
                avg_price: 10_000.0,
            },
        );
        assert!(actions.is_empty());
        assert_eq!(state.ledger.get("005930").unwrap().size, 0);
    }
}
