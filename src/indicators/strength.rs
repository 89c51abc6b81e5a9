// =============================================================================
// Trade strength
// =============================================================================
//
// 100 · cumulative buyer-initiated volume / cumulative seller-initiated
// volume over the rolling window kept by the trade-flow tracker. 100 means
// buyers and sellers are matched; above 100 buyers dominate.
// =============================================================================

use crate::indicators::EXTREME_IMBALANCE;

pub fn trade_strength(cumulative_buy: u64, cumulative_sell: u64) -> Option<f64> {
    if cumulative_sell == 0 {
        if cumulative_buy > 0 {
            return Some(EXTREME_IMBALANCE);
        }
        return None;
    }

    Some(cumulative_buy as f64 / cumulative_sell as f64 * 100.0)
}
