// =============================================================================
// Screener — volume-surge ranking into a candidate watchlist
// =============================================================================
//
// The ranking RPC pre-filters coarsely on the broker side; price and surge
// thresholds are re-applied in-process, then the top N by surge rate become
// the candidate set. Selection is deterministic for identical RPC output
// (ties break on the symbol code).
// =============================================================================

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::app_state::AppState;
use crate::config::StrategyConfig;
use crate::gateway::BrokerClient;

/// One row of the volume-surge ranking RPC.
#[derive(Debug, Clone, Serialize)]
pub struct RankingRow {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub surge_rate: f64,
}

/// Filter and rank RPC rows into the candidate list.
pub fn select_candidates(mut rows: Vec<RankingRow>, cfg: &StrategyConfig) -> Vec<String> {
    rows.retain(|r| r.price >= cfg.screening_min_price && r.surge_rate >= cfg.screening_min_surge_rate);
    rows.sort_by(|a, b| {
        b.surge_rate
            .partial_cmp(&a.surge_rate)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    let mut candidates = Vec::with_capacity(cfg.max_target_stocks);
    for row in rows {
        if !candidates.contains(&row.symbol) {
            candidates.push(row.symbol);
        }
        if candidates.len() >= cfg.max_target_stocks {
            break;
        }
    }
    candidates
}

/// One screening pass: call the ranking RPC, select candidates, publish the
/// result to shared state. Returns the new candidate list.
pub async fn run_screening(state: &AppState, client: &BrokerClient) -> Result<Vec<String>> {
    let cfg = state.strategy();

    let rows = client
        .fetch_volume_surge_rank(&cfg)
        .await
        .context("volume-surge ranking call failed")?;

    let candidates = select_candidates(rows, &cfg);
    info!(count = candidates.len(), candidates = ?candidates, "screening complete");
    state.push_log(format!("screening: {} candidates", candidates.len()));

    *state.candidates.write() = candidates.clone();
    state.increment_version();
    Ok(candidates)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(symbol: &str, price: f64, surge: f64) -> RankingRow {
        RankingRow {
            symbol: symbol.to_string(),
            name: format!("name-{symbol}"),
            price,
            surge_rate: surge,
        }
    }

    fn cfg() -> StrategyConfig {
        let mut cfg = StrategyConfig::default();
        cfg.screening_min_price = 1_000.0;
        cfg.screening_min_surge_rate = 200.0;
        cfg.max_target_stocks = 3;
        cfg
    }

    #[test]
    fn filters_by_price_and_surge() {
        let rows = vec![
            row("A", 5_000.0, 300.0),
            row("B", 500.0, 900.0),  // too cheap
            row("C", 2_000.0, 150.0), // surge too low
        ];
        assert_eq!(select_candidates(rows, &cfg()), vec!["A".to_string()]);
    }

    #[test]
    fn sorts_by_surge_desc_and_caps_at_max() {
        let rows = vec![
            row("A", 5_000.0, 250.0),
            row("B", 5_000.0, 800.0),
            row("C", 5_000.0, 400.0),
            row("D", 5_000.0, 600.0),
        ];
        assert_eq!(
            select_candidates(rows, &cfg()),
            vec!["B".to_string(), "D".to_string(), "C".to_string()]
        );
    }

    #[test]
    fn deterministic_for_identical_input() {
        // L4: equal surge rates tie-break on symbol, so two passes over the
        // same rows always agree.
        let rows = vec![
            row("B", 5_000.0, 300.0),
            row("A", 5_000.0, 300.0),
            row("C", 5_000.0, 300.0),
        ];
        let first = select_candidates(rows.clone(), &cfg());
        let second = select_candidates(rows, &cfg());
        assert_eq!(first, second);
        assert_eq!(first, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    #[test]
    fn duplicate_symbols_collapse() {
        let rows = vec![row("A", 5_000.0, 900.0), row("A", 5_000.0, 880.0)];
        assert_eq!(select_candidates(rows, &cfg()), vec!["A".to_string()]);
    }

    #[test]
    fn empty_input_yields_empty_list() {
        assert!(select_candidates(Vec::new(), &cfg()).is_empty());
    }
}
