// =============================================================================
// Order-book imbalance (OBI)
// =============================================================================
//
// Ratio of total resting bid volume to total resting ask volume. An empty ask
// side with live bids reads as an extreme buy imbalance (the sentinel), while
// a fully empty book is unknown.
// =============================================================================

use crate::indicators::EXTREME_IMBALANCE;

pub fn order_book_imbalance(total_bid_volume: i64, total_ask_volume: i64) -> Option<f64> {
    if total_ask_volume <= 0 {
        if total_bid_volume > 0 {
            return Some(EXTREME_IMBALANCE);
        }
        return None;
    }

    Some(total_bid_volume.max(0) as f64 / total_ask_volume as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_ratio() {
        let obi = order_book_imbalance(3_000, 1_500).unwrap();
        assert!((obi - 2.0).abs() < 1e-10);
    }

    #[test]
    fn empty_ask_side_is_extreme_sentinel() {
        assert_eq!(order_book_imbalance(500, 0), Some(EXTREME_IMBALANCE));
        assert_eq!(order_book_imbalance(500, -1), Some(EXTREME_IMBALANCE));
    }

    #[test]
    fn empty_book_is_unknown() {
        assert_eq!(order_book_imbalance(0, 0), None);
    }

    #[test]
    fn empty_bid_side_is_zero_not_unknown() {
        assert_eq!(order_book_imbalance(0, 1_000), Some(0.0));
    }
}
