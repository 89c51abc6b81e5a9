// =============================================================================
// Subscription manager — realtime feed registration diffs
// =============================================================================
//
// Keeps `subscribed` equal to the required set: screening candidates plus
// every symbol with a ledger entry. Adding a symbol registers its three
// per-symbol feeds (trade, book, halt) and seeds the frame store with a
// one-shot minute-chart fetch; removing a symbol unregisters the feeds and
// drops all per-symbol caches. The two account-global feeds (order updates,
// holdings) are registered once at startup and kept until shutdown.
//
// Per-symbol registration failures are logged but non-fatal; only the
// account-feeds registration gates engine startup.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::gateway::events::{FEED_BALANCE, FEED_BOOK, FEED_HALT, FEED_ORDER_UPDATE, FEED_TRADE};
use crate::gateway::{BrokerClient, RealtimeTransport};

/// Feeds registered per watched symbol.
pub const PER_SYMBOL_FEEDS: [&str; 3] = [FEED_TRADE, FEED_BOOK, FEED_HALT];

/// Account-wide feeds registered once at startup (empty item key).
pub const ACCOUNT_FEEDS: [&str; 2] = [FEED_ORDER_UPDATE, FEED_BALANCE];

/// Compute the add/remove diff between the required and subscribed sets.
/// Results are sorted so registration batches are deterministic.
pub fn diff(required: &HashSet<String>, subscribed: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut to_add: Vec<String> = required.difference(subscribed).cloned().collect();
    let mut to_remove: Vec<String> = subscribed.difference(required).cloned().collect();
    to_add.sort();
    to_remove.sort();
    (to_add, to_remove)
}

pub struct SubscriptionManager {
    state: Arc<AppState>,
    client: Arc<BrokerClient>,
    transport: Arc<RealtimeTransport>,
}

impl SubscriptionManager {
    pub fn new(
        state: Arc<AppState>,
        client: Arc<BrokerClient>,
        transport: Arc<RealtimeTransport>,
    ) -> Self {
        Self {
            state,
            client,
            transport,
        }
    }

    /// Register the order-update and holdings feeds. The acknowledgement
    /// flips the startup readiness flag via the dispatcher.
    pub async fn register_account_feeds(&self) -> Result<()> {
        let pairs: Vec<(&str, &str)> = ACCOUNT_FEEDS.iter().map(|feed| (*feed, "")).collect();
        self.transport
            .register(&pairs)
            .await
            .context("account feed registration failed")
    }

    /// Bring the subscribed set in line with candidates ∪ positions.
    pub async fn sync(&self) -> Result<()> {
        let required = self.required_set();
        let subscribed = self.state.subscribed.read().clone();
        let (to_add, to_remove) = diff(&required, &subscribed);

        if !to_add.is_empty() || !to_remove.is_empty() {
            info!(add = ?to_add, remove = ?to_remove, "subscription diff");
        }

        for symbol in to_add {
            if let Err(e) = self.subscribe_symbol(&symbol).await {
                warn!(symbol = %symbol, error = %e, "symbol subscription failed");
            }
        }
        for symbol in to_remove {
            self.unsubscribe_symbol(&symbol).await;
        }
        Ok(())
    }

    fn required_set(&self) -> HashSet<String> {
        let mut required: HashSet<String> = self.state.candidates.read().iter().cloned().collect();
        required.extend(self.state.ledger.symbols());
        required
    }

    /// Register a symbol's feeds and seed its frame from chart history.
    pub async fn subscribe_symbol(&self, symbol: &str) -> Result<()> {
        if self.state.subscribed.read().contains(symbol) {
            return Ok(());
        }

        let pairs: Vec<(&str, &str)> = PER_SYMBOL_FEEDS.iter().map(|f| (*f, symbol)).collect();
        self.transport
            .register(&pairs)
            .await
            .with_context(|| format!("feed registration failed for {symbol}"))?;
        self.state.subscribed.write().insert(symbol.to_string());

        // One-shot history so indicators have context from the first tick.
        match self.client.fetch_minute_chart(symbol).await {
            Ok(bars) => {
                let count = bars.len();
                self.state.frames.load_history(symbol, bars);
                info!(symbol, bars = count, "frame seeded from chart history");
            }
            Err(e) => warn!(symbol, error = %e, "history seed failed, continuing on live bars"),
        }

        self.state.increment_version();
        Ok(())
    }

    /// Unsubscribe `symbol` unless it is still required (a candidate or a
    /// symbol with a live ledger entry). Called after position teardown.
    pub async fn release_symbol(&self, symbol: &str) {
        if self.required_set().contains(symbol) {
            return;
        }
        self.unsubscribe_symbol(symbol).await;
    }

    async fn unsubscribe_symbol(&self, symbol: &str) {
        let pairs: Vec<(&str, &str)> = PER_SYMBOL_FEEDS.iter().map(|f| (*f, symbol)).collect();
        if let Err(e) = self.transport.unregister(&pairs).await {
            warn!(symbol, error = %e, "feed unregistration failed");
        }
        self.state.subscribed.write().remove(symbol);
        self.drop_symbol_caches(symbol);
        self.state.increment_version();
        info!(symbol, "unsubscribed and caches dropped");
    }

    fn drop_symbol_caches(&self, symbol: &str) {
        self.state.frames.drop_symbol(symbol);
        self.state.aggregator.drop_symbol(symbol);
        self.state.trade_flow.drop_symbol(symbol);
        self.state.book.drop_symbol(symbol);
        self.state.halts.drop_symbol(symbol);
        self.state.workers.remove(symbol);
    }

    /// Shutdown: unregister every per-symbol feed, then the account feeds.
    pub async fn shutdown(&self) {
        let symbols: Vec<String> = self.state.subscribed.read().iter().cloned().collect();
        for symbol in symbols {
            self.unsubscribe_symbol(&symbol).await;
        }

        let pairs: Vec<(&str, &str)> = ACCOUNT_FEEDS.iter().map(|feed| (*feed, "")).collect();
        if let Err(e) = self.transport.unregister(&pairs).await {
            warn!(error = %e, "account feed unregistration failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_empty_sets() {
        let (add, remove) = diff(&set(&[]), &set(&[]));
        assert!(add.is_empty());
        assert!(remove.is_empty());
    }

    #[test]
    fn diff_adds_and_removes() {
        let required = set(&["A", "B", "C"]);
        let subscribed = set(&["B", "D"]);
        let (add, remove) = diff(&required, &subscribed);
        assert_eq!(add, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(remove, vec!["D".to_string()]);
    }

    #[test]
    fn diff_identical_sets_is_noop() {
        let required = set(&["A", "B"]);
        let (add, remove) = diff(&required, &required.clone());
        assert!(add.is_empty());
        assert!(remove.is_empty());
    }

    #[test]
    fn per_symbol_feed_list_matches_wire_codes() {
        assert_eq!(PER_SYMBOL_FEEDS, ["0B", "0D", "1h"]);
        assert_eq!(ACCOUNT_FEEDS, ["00", "04"]);
    }
}
