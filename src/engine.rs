// =============================================================================
// Engine — supervision loop, event dispatch, per-symbol workers, kill switch
// =============================================================================
//
// Task layout:
//   - transport reader (gateway::transport): deserializes frames, forwards
//     typed events over one channel.
//   - dispatcher (here): routes each event to its symbol's worker, creating
//     workers lazily; account-feed acks flip the readiness flag.
//   - one worker per symbol: applies ticks to the aggregator and counters,
//     runs the strategy on completed bars, and reconciles order/balance
//     updates. Events for one symbol are processed strictly in receipt
//     order; across symbols everything is parallel.
//   - screener ticker (here): periodic ranking call + subscription sync.
//
// Lifecycle: Starting -> Running -> Stopping -> Stopped, with Error and
// KillSwitchActivated as terminal states. Running requires the transport
// connect, the account-feeds registration ack, and one successful screening
// pass.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::gateway::events::{BalanceUpdate, BookUpdate, HaltEvent, OrderUpdate, TradeTick};
use crate::gateway::{BrokerClient, GatewayEvent, RealtimeTransport};
use crate::market_data::Bar;
use crate::position::{Position, PositionState};
use crate::reconciler::{self, ReconcileAction};
use crate::screener;
use crate::strategy::{self, Decision};
use crate::subscription::SubscriptionManager;
use crate::types::{EngineStatus, ExitSignal};

/// Seconds to wait for the account-feeds registration acknowledgement.
const REGISTRATION_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Per-symbol workers
// =============================================================================

/// Event routed to a symbol's worker.
#[derive(Debug)]
pub enum SymbolEvent {
    Trade(TradeTick),
    Book(BookUpdate),
    Halt(HaltEvent),
    Order(OrderUpdate),
    Balance(BalanceUpdate),
}

/// Registry of live worker channels. Dropping a sender ends its worker.
pub struct WorkerPool {
    senders: RwLock<HashMap<String, UnboundedSender<SymbolEvent>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<UnboundedSender<SymbolEvent>> {
        self.senders.read().get(symbol).cloned()
    }

    pub fn insert(&self, symbol: &str, sender: UnboundedSender<SymbolEvent>) {
        self.senders.write().insert(symbol.to_string(), sender);
    }

    pub fn remove(&self, symbol: &str) {
        self.senders.write().remove(symbol);
    }

    pub fn clear(&self) {
        self.senders.write().clear();
    }

    pub fn len(&self) -> usize {
        self.senders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.read().is_empty()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct Engine {
    state: Arc<AppState>,
    client: Arc<BrokerClient>,
}

impl Engine {
    pub fn new(state: Arc<AppState>, client: Arc<BrokerClient>) -> Self {
        Self { state, client }
    }

    /// Run the engine to completion. Returns when a stop is requested (or a
    /// startup step fails, in which case the status is left at `Error`).
    pub async fn run(&self, realtime_uri: &str) -> Result<()> {
        let state = self.state.clone();
        state.set_status(EngineStatus::Starting);

        let result = self.run_inner(realtime_uri).await;
        if let Err(e) = &result {
            error!(error = %e, "engine terminated with error");
            if !state.is_terminal() {
                state.set_status(EngineStatus::Error);
            }
        }
        result
    }

    async fn run_inner(&self, realtime_uri: &str) -> Result<()> {
        let state = self.state.clone();
        let client = self.client.clone();

        // ── Transport connect + LOGIN ────────────────────────────────────
        let token = client
            .access_token()
            .await
            .context("access token unavailable")?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(
            RealtimeTransport::connect(realtime_uri, &token, events_tx)
                .await
                .context("realtime transport connect failed")?,
        );

        let subs = Arc::new(SubscriptionManager::new(
            state.clone(),
            client.clone(),
            transport.clone(),
        ));

        // ── Dispatcher ───────────────────────────────────────────────────
        let dispatcher = tokio::spawn(dispatch_events(
            state.clone(),
            client.clone(),
            subs.clone(),
            events_rx,
        ));

        // ── Account feeds must acknowledge before anything else runs ─────
        subs.register_account_feeds().await?;
        let mut ready = state.account_feeds_ready();
        tokio::time::timeout(
            Duration::from_secs(REGISTRATION_TIMEOUT_SECS),
            ready.wait_for(|ok| *ok),
        )
        .await
        .context("timed out waiting for account feed registration")?
        .context("registration channel closed")?;
        info!("account feeds registered");

        // ── Initial screening gates the Running state ────────────────────
        screener::run_screening(&state, &client)
            .await
            .context("initial screening failed")?;
        subs.sync().await?;

        state.set_status(EngineStatus::Running);
        state.push_log("engine running");

        // ── Screener ticker until stop ───────────────────────────────────
        let interval =
            Duration::from_secs(state.engine_config.screening_interval_minutes.max(1) * 60);
        let mut stop_rx = state.stop_signal();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.screening_pass(&subs).await;
                }
                _ = stop_rx.changed() => break,
            }
        }

        // ── Drain and shut down ──────────────────────────────────────────
        if !state.is_terminal() {
            state.set_status(EngineStatus::Stopping);
        }

        // Finalize in-progress bars; no strategy runs on shutdown bars.
        for (symbol, bar) in state.aggregator.flush_all() {
            state.frames.append_or_replace(&symbol, bar);
        }

        subs.shutdown().await;
        transport.close().await;
        state.workers.clear();
        dispatcher.abort();

        if !state.is_terminal() {
            state.set_status(EngineStatus::Stopped);
        }
        info!("engine shut down");
        Ok(())
    }

    async fn screening_pass(&self, subs: &Arc<SubscriptionManager>) {
        let cfg = self.state.strategy();
        // With the book full there is nothing to screen for; skip the RPC.
        if self.state.ledger.len() >= cfg.max_concurrent_positions {
            debug!("screening skipped, position book full");
            return;
        }

        match screener::run_screening(&self.state, &self.client).await {
            Ok(_) => {
                if let Err(e) = subs.sync().await {
                    warn!(error = %e, "subscription sync failed");
                }
            }
            Err(e) => warn!(error = %e, "screening pass failed"),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

async fn dispatch_events(
    state: Arc<AppState>,
    client: Arc<BrokerClient>,
    subs: Arc<SubscriptionManager>,
    mut events: UnboundedReceiver<GatewayEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::SubscriptionAck { code, message } => {
                if code == 0 {
                    state.mark_account_feeds_ready();
                } else {
                    warn!(code, message = %message, "subscription request rejected");
                }
            }
            GatewayEvent::Trade(t) => route(&state, &client, &subs, t.symbol.clone(), SymbolEvent::Trade(t)),
            GatewayEvent::Book(b) => route(&state, &client, &subs, b.symbol.clone(), SymbolEvent::Book(b)),
            GatewayEvent::Halt(h) => route(&state, &client, &subs, h.symbol.clone(), SymbolEvent::Halt(h)),
            GatewayEvent::Order(o) => route(&state, &client, &subs, o.symbol.clone(), SymbolEvent::Order(o)),
            GatewayEvent::Balance(b) => route(&state, &client, &subs, b.symbol.clone(), SymbolEvent::Balance(b)),
        }
    }

    // The reader dropped its sender: the transport is gone. A requested stop
    // is the normal path; anything else degrades to a graceful stop.
    if !state.stop_requested() {
        error!("realtime transport lost, stopping engine");
        state.push_log("realtime transport lost");
        if !state.is_terminal() {
            state.set_status(EngineStatus::Error);
        }
        state.request_stop();
    }
}

/// Send an event to the symbol's worker, spawning one if needed.
fn route(
    state: &Arc<AppState>,
    client: &Arc<BrokerClient>,
    subs: &Arc<SubscriptionManager>,
    symbol: String,
    event: SymbolEvent,
) {
    if symbol.is_empty() {
        return;
    }

    let sender = match state.workers.get(&symbol) {
        Some(s) if !s.is_closed() => s,
        _ => {
            let (tx, rx) = mpsc::unbounded_channel();
            state.workers.insert(&symbol, tx.clone());
            tokio::spawn(run_symbol_worker(
                state.clone(),
                client.clone(),
                subs.clone(),
                symbol.clone(),
                rx,
            ));
            tx
        }
    };

    if sender.send(event).is_err() {
        debug!(symbol, "worker channel closed, event dropped");
    }
}

// =============================================================================
// Symbol worker
// =============================================================================

async fn run_symbol_worker(
    state: Arc<AppState>,
    client: Arc<BrokerClient>,
    subs: Arc<SubscriptionManager>,
    symbol: String,
    mut events: UnboundedReceiver<SymbolEvent>,
) {
    debug!(symbol, "symbol worker started");

    while let Some(event) = events.recv().await {
        match event {
            SymbolEvent::Trade(tick) => {
                state.trade_flow.record(&symbol, tick.signed_volume, tick.at);
                let volume = tick.signed_volume.unsigned_abs();
                if let Some(bar) = state.aggregator.on_tick(&symbol, tick.price, volume, tick.at) {
                    state.frames.append_or_replace(&symbol, bar);
                    handle_completed_bar(&state, &client, &symbol, &bar).await;
                }
            }
            SymbolEvent::Book(book) => {
                state
                    .book
                    .update(&symbol, book.total_bid_volume, book.total_ask_volume);
            }
            SymbolEvent::Halt(halt) => {
                state.halts.set(&symbol, halt.active);
                if halt.active {
                    let release = halt
                        .release_at
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    state.push_log(format!("{symbol} volatility halt (release {release})"));
                }
            }
            SymbolEvent::Order(update) => {
                debug!(
                    symbol,
                    order_id = %update.order_id,
                    status = ?update.status,
                    side = ?update.side,
                    exec_qty = update.exec_qty,
                    original_qty = update.original_qty,
                    "order update"
                );
                let actions = reconciler::apply_order_update(&state, &update);
                apply_actions(&subs, actions).await;
            }
            SymbolEvent::Balance(update) => {
                let actions = reconciler::apply_balance_update(&state, &update);
                apply_actions(&subs, actions).await;
            }
        }
    }

    debug!(symbol, "symbol worker stopped");
}

async fn apply_actions(subs: &Arc<SubscriptionManager>, actions: Vec<ReconcileAction>) {
    for action in actions {
        match action {
            ReconcileAction::Subscribe(symbol) => {
                if let Err(e) = subs.subscribe_symbol(&symbol).await {
                    warn!(symbol = %symbol, error = %e, "reconciler subscribe failed");
                }
            }
            ReconcileAction::Release(symbol) => subs.release_symbol(&symbol).await,
        }
    }
}

// =============================================================================
// Completed-bar handling
// =============================================================================

async fn handle_completed_bar(
    state: &Arc<AppState>,
    client: &Arc<BrokerClient>,
    symbol: &str,
    bar: &Bar,
) {
    let cfg = state.strategy();
    let indicators = strategy::compute_indicators(state, symbol, &cfg);

    match strategy::decide(state, symbol, bar, &indicators, &cfg) {
        Decision::Hold => {}
        Decision::Enter { quantity } => {
            place_entry(state, client, symbol, bar.close, quantity, &cfg).await;
        }
        Decision::Exit { signal, quantity } => {
            place_exit(state, client, symbol, signal, quantity).await;
        }
    }
}

async fn place_entry(
    state: &Arc<AppState>,
    client: &Arc<BrokerClient>,
    symbol: &str,
    close: f64,
    quantity: u64,
    cfg: &crate::config::StrategyConfig,
) {
    if cfg.verify_cash_before_entry {
        match client.fetch_available_cash().await {
            Ok(cash) if (cash as f64) < cfg.investment_amount => {
                warn!(symbol, cash, needed = cfg.investment_amount, "entry skipped, insufficient cash");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                // Without a cash figure the guard cannot pass; skip the bar.
                warn!(symbol, error = %e, "cash check failed, entry skipped");
                return;
            }
        }
    }

    match client.buy_market(symbol, quantity).await {
        Ok(order_id) => {
            state.ledger.insert(Position::pending_entry(
                symbol,
                order_id.clone(),
                quantity,
                cfg.locked_risk(),
            ));
            state.push_log(format!("{symbol} buy {quantity} @ market (order {order_id})"));
            state.increment_version();
        }
        Err(e) => {
            // A rejection means no position was opened; the rule re-arms on
            // the next completed bar, never by retrying this one.
            warn!(symbol, close, quantity, error = %e, "buy order failed");
            state.push_log(format!("{symbol} buy failed: {e}"));
        }
    }
}

async fn place_exit(
    state: &Arc<AppState>,
    client: &Arc<BrokerClient>,
    symbol: &str,
    signal: ExitSignal,
    quantity: u64,
) {
    match client.sell_market(symbol, quantity).await {
        Ok(order_id) => {
            state.ledger.apply(symbol, |p| {
                p.arm_exit(order_id.clone(), signal, quantity);
            });
            state.push_log(format!("{symbol} sell {quantity} @ market ({signal})"));
            state.increment_version();
        }
        Err(e) => {
            warn!(symbol, %signal, quantity, error = %e, "sell order failed");
            state.ledger.apply(symbol, |p| {
                p.state = PositionState::ErrorExitOrder;
            });
            state.push_log(format!("{symbol} sell failed: {e}"));
            state.increment_version();
        }
    }
}

// =============================================================================
// Kill switch
// =============================================================================

/// Operator-triggered immediate liquidation. Places fresh market sells for
/// every `InPosition` symbol, skips orders already in flight, marks the
/// engine terminal, and requests the stop without waiting for fills.
pub async fn execute_kill_switch(state: Arc<AppState>, client: Arc<BrokerClient>) {
    if state.status() != EngineStatus::Running {
        warn!(status = %state.status(), "kill switch ignored, engine not running");
        return;
    }

    state.set_status(EngineStatus::KillSwitchActivated);
    state.push_log("kill switch activated");

    for pos in state.ledger.snapshot() {
        match pos.state {
            PositionState::InPosition if pos.size > 0 => {
                match client.sell_market(&pos.symbol, pos.size).await {
                    Ok(order_id) => {
                        state.ledger.apply(&pos.symbol, |p| {
                            p.arm_exit(order_id.clone(), ExitSignal::KillSwitch, p.size);
                        });
                        info!(symbol = %pos.symbol, size = pos.size, "kill switch sell placed");
                    }
                    Err(e) => {
                        error!(symbol = %pos.symbol, error = %e, "kill switch sell failed");
                        state.ledger.apply(&pos.symbol, |p| {
                            p.state = PositionState::ErrorLiquidation;
                        });
                    }
                }
            }
            // An order is already working; its update stream resolves it.
            PositionState::PendingEntry | PositionState::PendingExit => {
                info!(symbol = %pos.symbol, state = %pos.state, "kill switch skipping in-flight order");
            }
            _ => {}
        }
    }

    state.increment_version();
    state.request_stop();
}

// =============================================================================
// Tests
// =============================================================================
