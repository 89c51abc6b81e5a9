// =============================================================================
// Strategy evaluator — ORB breakout entries, prioritized exit rules
// =============================================================================
//
// Runs once per completed one-minute bar per symbol, on that symbol's worker.
//
// Entry (all must hold): candidate symbol, exposure below the concurrent
// cap, no volatility halt, close above the opening-range high plus buffer,
// RVOL / OBI / trade-strength above thresholds, and the short EMA above the
// long EMA. "Defined" matters: an unknown indicator never passes a filter.
//
// Exit, first match wins: halt stop, time stop, take profit, stop loss, EMA
// dead-cross, VWAP break, partial take profit. Profit thresholds come from
// the risk parameters the position locked at entry, not the live config.
// =============================================================================

use tracing::{debug, info};

use crate::app_state::AppState;
use crate::config::StrategyConfig;
use crate::indicators::ema;
use crate::indicators::obi::order_book_imbalance;
use crate::indicators::orb::{opening_range, OrbLevels};
use crate::indicators::rvol::rvol;
use crate::indicators::strength::trade_strength;
use crate::indicators::vwap::vwap;
use crate::market_data::Bar;
use crate::position::Position;
use crate::types::ExitSignal;

/// Everything the rules need, computed once per completed bar.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSnapshot {
    pub orb: Option<OrbLevels>,
    pub vwap: Option<f64>,
    pub prev_vwap: Option<f64>,
    pub prev_close: Option<f64>,
    pub ema_short: Option<f64>,
    pub prev_ema_short: Option<f64>,
    pub ema_long: Option<f64>,
    pub prev_ema_long: Option<f64>,
    pub rvol: Option<f64>,
    pub obi: Option<f64>,
    pub strength: Option<f64>,
}

/// What the evaluator wants done for this bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Enter { quantity: u64 },
    Exit { signal: ExitSignal, quantity: u64 },
    Hold,
}

// =============================================================================
// Indicator computation
// =============================================================================

/// Compute the indicator snapshot from the symbol's frame and realtime
/// caches. The completed bar is expected to already be in the frame store.
pub fn compute_indicators(
    state: &AppState,
    symbol: &str,
    cfg: &StrategyConfig,
) -> IndicatorSnapshot {
    let bars = state.frames.bars(symbol);
    if bars.is_empty() {
        return IndicatorSnapshot::default();
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let (ema_short, prev_ema_short) = ema::last_two(&closes, cfg.ema_short_period);
    let (ema_long, prev_ema_long) = ema::last_two(&closes, cfg.ema_long_period);

    let obi = state
        .book
        .totals(symbol)
        .and_then(|t| order_book_imbalance(t.total_bid_volume, t.total_ask_volume));
    let strength = state
        .trade_flow
        .volumes(symbol)
        .and_then(|(buy, sell)| trade_strength(buy, sell));

    IndicatorSnapshot {
        orb: opening_range(&bars, cfg.session_open(), cfg.orb_minutes),
        vwap: vwap(&bars),
        prev_vwap: vwap(&bars[..bars.len() - 1]),
        prev_close: bars.len().checked_sub(2).map(|i| bars[i].close),
        ema_short,
        prev_ema_short,
        ema_long,
        prev_ema_long,
        rvol: rvol(&bars, cfg.rvol_period),
        obi,
        strength,
    }
}

// =============================================================================
// Decision
// =============================================================================

pub fn decide(
    state: &AppState,
    symbol: &str,
    bar: &Bar,
    ind: &IndicatorSnapshot,
    cfg: &StrategyConfig,
) -> Decision {
    match state.ledger.get(symbol) {
        None => evaluate_entry(state, symbol, bar, ind, cfg),
        Some(pos) if pos.state == crate::position::PositionState::InPosition => {
            evaluate_exit(state, &pos, bar, ind, cfg)
        }
        // Pending or errored entries: an order is already in flight (or the
        // position needs operator attention); nothing to decide this bar.
        Some(_) => Decision::Hold,
    }
}

fn evaluate_entry(
    state: &AppState,
    symbol: &str,
    bar: &Bar,
    ind: &IndicatorSnapshot,
    cfg: &StrategyConfig,
) -> Decision {
    let t = bar.ts.time();
    if t < cfg.session_open() || t >= cfg.time_stop() {
        return Decision::Hold;
    }

    if !state.candidates.read().iter().any(|c| c == symbol) {
        return Decision::Hold;
    }
    if state.ledger.in_position_count() >= cfg.max_concurrent_positions {
        return Decision::Hold;
    }
    if state.halts.is_halted(symbol) {
        return Decision::Hold;
    }

    let Some(orb) = ind.orb else {
        return Decision::Hold;
    };
    let trigger = orb.orh * (1.0 + cfg.breakout_buffer_pct / 100.0);
    if bar.close <= trigger {
        return Decision::Hold;
    }

    let rvol_ok = ind.rvol.is_some_and(|v| v >= cfg.rvol_threshold);
    let obi_ok = ind.obi.is_some_and(|v| v >= cfg.obi_threshold);
    let strength_ok = ind.strength.is_some_and(|v| v >= cfg.strength_threshold);
    let momentum_ok = matches!(
        (ind.ema_short, ind.ema_long),
        (Some(short), Some(long)) if short > long
    );

    if !(rvol_ok && obi_ok && strength_ok && momentum_ok) {
        debug!(
            symbol,
            close = bar.close,
            trigger,
            rvol_ok,
            obi_ok,
            strength_ok,
            momentum_ok,
            "breakout without filter confirmation"
        );
        return Decision::Hold;
    }

    let quantity = (cfg.investment_amount / bar.close).floor() as u64;
    if quantity == 0 {
        return Decision::Hold;
    }

    info!(symbol, close = bar.close, trigger, quantity, "entry signal confirmed");
    Decision::Enter { quantity }
}

fn evaluate_exit(
    state: &AppState,
    pos: &Position,
    bar: &Bar,
    ind: &IndicatorSnapshot,
    cfg: &StrategyConfig,
) -> Decision {
    let signal = exit_signal(state, pos, bar, ind, cfg);
    let Some(signal) = signal else {
        return Decision::Hold;
    };

    if signal == ExitSignal::PartialTakeProfit {
        let size_to_sell = (pos.size as f64 * pos.risk.partial_profit_ratio).ceil() as u64;
        if size_to_sell == 0 {
            return Decision::Hold;
        }
        if size_to_sell >= pos.size {
            // A partial that would consume the whole position is a full exit.
            return Decision::Exit {
                signal: ExitSignal::TakeProfit,
                quantity: pos.size,
            };
        }
        return Decision::Exit {
            signal,
            quantity: size_to_sell,
        };
    }

    Decision::Exit {
        signal,
        quantity: pos.size,
    }
}

fn exit_signal(
    state: &AppState,
    pos: &Position,
    bar: &Bar,
    ind: &IndicatorSnapshot,
    cfg: &StrategyConfig,
) -> Option<ExitSignal> {
    // (a) Volatility halt forces the position out.
    if state.halts.is_halted(&pos.symbol) {
        return Some(ExitSignal::HaltStop);
    }

    // (b) Time stop.
    if bar.ts.time() >= cfg.time_stop() {
        return Some(ExitSignal::TimeStop);
    }

    let profit_pct = pos.profit_pct(bar.close);

    // (c) Take profit / (d) stop loss against the locked thresholds.
    if let Some(profit) = profit_pct {
        if profit >= pos.risk.target_profit_pct {
            return Some(ExitSignal::TakeProfit);
        }
        if profit <= pos.risk.stop_loss_pct {
            return Some(ExitSignal::StopLoss);
        }
    }

    // (e) EMA dead-cross: short dips below long on this bar specifically.
    if let (Some(short), Some(long), Some(prev_short), Some(prev_long)) = (
        ind.ema_short,
        ind.ema_long,
        ind.prev_ema_short,
        ind.prev_ema_long,
    ) {
        if short < long && prev_short >= prev_long {
            return Some(ExitSignal::EmaCrossSell);
        }
    }

    // (f) VWAP break: close crosses below VWAP on this bar specifically.
    if let (Some(cur_vwap), Some(prev_vwap), Some(prev_close)) =
        (ind.vwap, ind.prev_vwap, ind.prev_close)
    {
        if bar.close < cur_vwap && prev_close >= prev_vwap {
            return Some(ExitSignal::VwapBreakSell);
        }
    }

    // (g) Partial take profit, once per position lifetime.
    if let (Some(partial_pct), Some(profit)) = (pos.risk.partial_profit_pct, profit_pct) {
        if !pos.partial_profit_taken && profit >= partial_pct {
            return Some(ExitSignal::PartialTakeProfit);
        }
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
