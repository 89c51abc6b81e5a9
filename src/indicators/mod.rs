// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// trading engine. Every public function returns `Option<T>` so callers are
// forced to handle insufficient-data and numerical-edge-case scenarios —
// "unknown" is never silently zero.

pub mod ema;
pub mod obi;
pub mod orb;
pub mod rvol;
pub mod strength;
pub mod vwap;

/// Sentinel returned by OBI and trade strength when the denominator side is
/// empty but the numerator side is active: an extreme buy imbalance, distinct
/// from the unknown (`None`) case.
pub const EXTREME_IMBALANCE: f64 = 1000.0;
