// =============================================================================
// Central application state — momentum-gate trading engine
// =============================================================================
//
// The single source of truth for the process. Subsystems own their interior
// mutability; AppState ties them together and provides a unified snapshot for
// the dashboard API.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - tokio watch channels for the stop signal and the account-feeds
//     readiness flag.
//
// A symbol's market-data and ledger entries are only ever mutated by that
// symbol's worker task (or the dispatcher that feeds it), which is what
// serializes strategy evaluation against reconciliation per symbol.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{Config, EngineConfig, StrategyConfig};
use crate::engine::WorkerPool;
use crate::journal::{JournalStats, TradeJournal};
use crate::market_data::{BookCache, CandleAggregator, FrameStore, HaltTracker, TradeFlowTracker};
use crate::position::{Position, PositionLedger};
use crate::types::EngineStatus;

/// Maximum number of recent log lines retained for the dashboard.
const MAX_RECENT_LOGS: usize = 100;

/// A log line surfaced on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub message: String,
    /// ISO 8601, broker-local.
    pub at: String,
}

pub struct AppState {
    /// Monotonically increasing version, bumped on every meaningful
    /// mutation. The dashboard polls it to detect fresh data.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub engine_config: EngineConfig,
    /// Live strategy snapshot; replaced wholesale by the dashboard. Readers
    /// clone the Arc once per operation and never observe a torn update.
    strategy: RwLock<Arc<StrategyConfig>>,

    // ── Market data ─────────────────────────────────────────────────────
    pub frames: FrameStore,
    pub aggregator: CandleAggregator,
    pub trade_flow: TradeFlowTracker,
    pub book: BookCache,
    pub halts: HaltTracker,

    // ── Positions & history ─────────────────────────────────────────────
    pub ledger: PositionLedger,
    pub journal: TradeJournal,

    // ── Screening & subscriptions ───────────────────────────────────────
    pub candidates: RwLock<Vec<String>>,
    pub subscribed: RwLock<HashSet<String>>,

    // ── Per-symbol workers ──────────────────────────────────────────────
    pub workers: WorkerPool,

    // ── Lifecycle ───────────────────────────────────────────────────────
    engine_status: RwLock<EngineStatus>,
    stop_tx: watch::Sender<bool>,
    feeds_ready_tx: watch::Sender<bool>,

    // ── Dashboard log ring ──────────────────────────────────────────────
    recent_logs: RwLock<Vec<LogRecord>>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (feeds_ready_tx, _) = watch::channel(false);

        Self {
            state_version: AtomicU64::new(1),
            engine_config: config.engine.clone(),
            strategy: RwLock::new(Arc::new(config.strategy.clone())),
            frames: FrameStore::new(config.engine.max_frame_bars),
            aggregator: CandleAggregator::new(),
            trade_flow: TradeFlowTracker::new(),
            book: BookCache::new(),
            halts: HaltTracker::new(),
            ledger: PositionLedger::new(),
            journal: TradeJournal::new(&config.engine.journal_path),
            candidates: RwLock::new(Vec::new()),
            subscribed: RwLock::new(HashSet::new()),
            workers: WorkerPool::new(),
            engine_status: RwLock::new(EngineStatus::Stopped),
            stop_tx,
            feeds_ready_tx,
            recent_logs: RwLock::new(Vec::new()),
        }
    }

    // ── Version tracking ────────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Strategy snapshot ───────────────────────────────────────────────

    /// The current strategy snapshot. Cheap (one Arc clone).
    pub fn strategy(&self) -> Arc<StrategyConfig> {
        self.strategy.read().clone()
    }

    /// Atomically replace the strategy snapshot. In-flight positions keep
    /// the risk parameters they locked at entry.
    pub fn swap_strategy(&self, next: StrategyConfig) {
        *self.strategy.write() = Arc::new(next);
        self.increment_version();
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn status(&self) -> EngineStatus {
        *self.engine_status.read()
    }

    pub fn set_status(&self, status: EngineStatus) {
        let mut current = self.engine_status.write();
        if *current == status {
            return;
        }
        tracing::info!(from = %current, to = %status, "engine status change");
        *current = status;
        drop(current);
        self.push_log(format!("engine status: {status}"));
    }

    /// Terminal states are never overwritten by the shutdown path.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status(),
            EngineStatus::Error | EngineStatus::KillSwitchActivated
        )
    }

    pub fn request_stop(&self) {
        // send_replace updates the value even with no live receivers.
        self.stop_tx.send_replace(true);
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Called by the dispatcher when the account-feeds REG is acknowledged.
    pub fn mark_account_feeds_ready(&self) {
        self.feeds_ready_tx.send_replace(true);
    }

    pub fn account_feeds_ready(&self) -> watch::Receiver<bool> {
        self.feeds_ready_tx.subscribe()
    }

    // ── Dashboard log ring ──────────────────────────────────────────────

    pub fn push_log(&self, message: impl Into<String>) {
        let record = LogRecord {
            message: message.into(),
            at: Local::now().naive_local().to_string(),
        };
        let mut logs = self.recent_logs.write();
        logs.insert(0, record);
        logs.truncate(MAX_RECENT_LOGS);
        drop(logs);
        self.increment_version();
    }

    pub fn recent_logs(&self) -> Vec<LogRecord> {
        self.recent_logs.read().clone()
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the full serializable snapshot served by `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let journal_stats = self.journal.stats().ok();
        let mut subscribed: Vec<String> = self.subscribed.read().iter().cloned().collect();
        subscribed.sort();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Local::now().naive_local().to_string(),
            engine_status: self.status(),
            candidates: self.candidates.read().clone(),
            subscribed,
            positions: self.ledger.snapshot(),
            strategy: (*self.strategy()).clone(),
            journal_stats,
            recent_logs: self.recent_logs(),
        }
    }
}

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: String,
    pub engine_status: EngineStatus,
    pub candidates: Vec<String>,
    pub subscribed: Vec<String>,
    pub positions: Vec<Position>,
    pub strategy: StrategyConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_stats: Option<JournalStats>,
    pub recent_logs: Vec<LogRecord>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(&Config::default())
    }

    #[test]
    fn version_increments() {
        let s = state();
        let before = s.current_state_version();
        s.increment_version();
        assert_eq!(s.current_state_version(), before + 1);
    }

    #[test]
    fn strategy_swap_is_visible_and_versioned() {
        let s = state();
        let before = s.current_state_version();
        let mut next = (*s.strategy()).clone();
        next.take_profit_pct = 9.9;
        s.swap_strategy(next);
        assert!((s.strategy().take_profit_pct - 9.9).abs() < f64::EPSILON);
        assert!(s.current_state_version() > before);
    }

    #[test]
    fn status_transitions_and_terminal_flag() {
        let s = state();
        assert_eq!(s.status(), EngineStatus::Stopped);
        s.set_status(EngineStatus::Running);
        assert_eq!(s.status(), EngineStatus::Running);
        assert!(!s.is_terminal());
        s.set_status(EngineStatus::KillSwitchActivated);
        assert!(s.is_terminal());
    }

    #[test]
    fn stop_signal_observed_by_subscribers() {
        let s = state();
        let rx = s.stop_signal();
        assert!(!*rx.borrow());
        s.request_stop();
        assert!(*rx.borrow());
        assert!(s.stop_requested());
    }

    #[test]
    fn log_ring_caps_and_orders_newest_first() {
        let s = state();
        for i in 0..(MAX_RECENT_LOGS + 10) {
            s.push_log(format!("line {i}"));
        }
        let logs = s.recent_logs();
        assert_eq!(logs.len(), MAX_RECENT_LOGS);
        assert!(logs[0].message.ends_with(&format!("{}", MAX_RECENT_LOGS + 9)));
    }

    #[test]
    fn snapshot_contains_core_sections() {
        let s = state();
        s.candidates.write().push("005930".to_string());
        let snap = s.build_snapshot();
        assert_eq!(snap.candidates, vec!["005930".to_string()]);
        assert!(snap.positions.is_empty());
        assert_eq!(snap.engine_status, EngineStatus::Stopped);
    }
}
