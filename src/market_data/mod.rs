pub mod aggregator;
pub mod frame;
pub mod halt;
pub mod orderbook;
pub mod trade_flow;

// Re-export the Bar struct for convenient access (e.g. `use crate::market_data::Bar`).
pub use aggregator::CandleAggregator;
pub use frame::{Bar, FrameStore};
pub use halt::HaltTracker;
pub use orderbook::BookCache;
pub use trade_flow::TradeFlowTracker;
