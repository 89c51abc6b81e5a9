// =============================================================================
// Configuration — YAML file with broker credentials and strategy thresholds
// =============================================================================
//
// The file has four sections: `broker` (real + sandbox credentials and the
// `use_sandbox` switch), `engine` (loop cadence, paths, bind address),
// `strategy` (all trading thresholds), and `logging`.
//
// Every field carries a serde default so older config files keep loading when
// new fields are added.
//
// The `strategy` section is the runtime-mutable part: the dashboard replaces
// the whole snapshot atomically (an `Arc<StrategyConfig>` pointer swap), and
// positions capture their own locked copy of the risk thresholds at entry.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::position::LockedRisk;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_screening_interval_minutes() -> u64 {
    5
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_token_cache_path() -> String {
    ".token".to_string()
}

fn default_journal_path() -> String {
    "trade_history.jsonl".to_string()
}

fn default_max_frame_bars() -> usize {
    500
}

fn default_session_open_hour() -> u32 {
    9
}

fn default_time_stop_hour() -> u32 {
    15
}

fn default_orb_minutes() -> u32 {
    15
}

fn default_breakout_buffer_pct() -> f64 {
    0.15
}

fn default_take_profit_pct() -> f64 {
    2.5
}

fn default_stop_loss_pct() -> f64 {
    -1.0
}

fn default_partial_take_profit_pct() -> Option<f64> {
    Some(1.5)
}

fn default_partial_take_profit_ratio() -> f64 {
    0.4
}

fn default_ema_short_period() -> usize {
    9
}

fn default_ema_long_period() -> usize {
    20
}

fn default_rvol_period() -> usize {
    20
}

fn default_rvol_threshold() -> f64 {
    130.0
}

fn default_obi_threshold() -> f64 {
    1.5
}

fn default_strength_threshold() -> f64 {
    100.0
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_max_target_stocks() -> usize {
    5
}

fn default_investment_amount() -> f64 {
    1_000_000.0
}

fn default_screening_min_price() -> f64 {
    1_000.0
}

fn default_screening_min_surge_rate() -> f64 {
    200.0
}

fn default_screening_min_volume() -> u32 {
    10
}

fn default_screening_market() -> String {
    "000".to_string()
}

fn default_screening_timeframe_minutes() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Broker section
// =============================================================================

/// One set of brokerage credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerCredentials {
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    /// Account number in `prefix-suffix` form (e.g. `12345678-01`).
    #[serde(default)]
    pub account_no: String,
}

/// Broker connection settings. Real and sandbox credentials are both kept in
/// the file; `use_sandbox` selects which pair (and which endpoints) are live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_true")]
    pub use_sandbox: bool,
    #[serde(default)]
    pub real: BrokerCredentials,
    #[serde(default)]
    pub sandbox: BrokerCredentials,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            use_sandbox: true,
            real: BrokerCredentials::default(),
            sandbox: BrokerCredentials::default(),
        }
    }
}

const BASE_URL_REAL: &str = "https://api.kiwoom.com";
const BASE_URL_SANDBOX: &str = "https://mockapi.kiwoom.com";
const REALTIME_URI_REAL: &str = "wss://api.kiwoom.com:10000/api/dostk/websocket";
const REALTIME_URI_SANDBOX: &str = "wss://mockapi.kiwoom.com:10000/api/dostk/websocket";

impl BrokerConfig {
    /// The credential pair selected by `use_sandbox`.
    pub fn active(&self) -> &BrokerCredentials {
        if self.use_sandbox {
            &self.sandbox
        } else {
            &self.real
        }
    }

    pub fn base_url(&self) -> &'static str {
        if self.use_sandbox {
            BASE_URL_SANDBOX
        } else {
            BASE_URL_REAL
        }
    }

    pub fn realtime_uri(&self) -> &'static str {
        if self.use_sandbox {
            REALTIME_URI_SANDBOX
        } else {
            REALTIME_URI_REAL
        }
    }
}

// =============================================================================
// Engine section
// =============================================================================

/// Fixed engine plumbing settings. Not runtime-mutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cadence of the screening loop.
    #[serde(default = "default_screening_interval_minutes")]
    pub screening_interval_minutes: u64,
    /// Dashboard API bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Where the access token is cached between runs.
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: String,
    /// Append-only trade journal (one JSON record per completed exit).
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
    /// Completed bars retained per symbol.
    #[serde(default = "default_max_frame_bars")]
    pub max_frame_bars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            screening_interval_minutes: default_screening_interval_minutes(),
            bind_addr: default_bind_addr(),
            token_cache_path: default_token_cache_path(),
            journal_path: default_journal_path(),
            max_frame_bars: default_max_frame_bars(),
        }
    }
}

// =============================================================================
// Strategy section
// =============================================================================

/// All trading thresholds. Readers always work from one immutable snapshot;
/// the dashboard swaps in a new snapshot atomically, and updated values only
/// apply to positions opened after the swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    // --- Session clock (broker-local) ---------------------------------------
    #[serde(default = "default_session_open_hour")]
    pub session_open_hour: u32,
    #[serde(default)]
    pub session_open_minute: u32,
    #[serde(default = "default_time_stop_hour")]
    pub time_stop_hour: u32,
    #[serde(default)]
    pub time_stop_minute: u32,

    // --- Opening range breakout ---------------------------------------------
    /// Length of the opening-range window in minutes.
    #[serde(default = "default_orb_minutes")]
    pub orb_minutes: u32,
    /// Buffer above the opening-range high, in percent, required to enter.
    #[serde(default = "default_breakout_buffer_pct")]
    pub breakout_buffer_pct: f64,

    // --- Risk (locked into positions at entry) ------------------------------
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    /// Negative percentage; a -1.0 means exit at a 1% loss.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    /// Partial take-profit trigger; `None` disables the partial exit.
    #[serde(default = "default_partial_take_profit_pct")]
    pub partial_take_profit_pct: Option<f64>,
    /// Fraction of the position sold when the partial take-profit fires.
    #[serde(default = "default_partial_take_profit_ratio")]
    pub partial_take_profit_ratio: f64,

    // --- Indicators ---------------------------------------------------------
    #[serde(default = "default_ema_short_period")]
    pub ema_short_period: usize,
    #[serde(default = "default_ema_long_period")]
    pub ema_long_period: usize,
    #[serde(default = "default_rvol_period")]
    pub rvol_period: usize,

    // --- Entry filters ------------------------------------------------------
    /// Relative volume, percent.
    #[serde(default = "default_rvol_threshold")]
    pub rvol_threshold: f64,
    /// Order-book imbalance ratio (total bid / total ask).
    #[serde(default = "default_obi_threshold")]
    pub obi_threshold: f64,
    /// Trade strength, percent (100 = buyers match sellers).
    #[serde(default = "default_strength_threshold")]
    pub strength_threshold: f64,

    // --- Sizing & exposure --------------------------------------------------
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    /// Cash committed per symbol; quantity = floor(investment / close).
    #[serde(default = "default_investment_amount")]
    pub investment_amount: f64,
    /// Query the balance RPC before entering and skip when cash is short.
    #[serde(default = "default_true")]
    pub verify_cash_before_entry: bool,

    // --- Screening ----------------------------------------------------------
    #[serde(default = "default_max_target_stocks")]
    pub max_target_stocks: usize,
    #[serde(default = "default_screening_min_price")]
    pub screening_min_price: f64,
    #[serde(default = "default_screening_min_surge_rate")]
    pub screening_min_surge_rate: f64,
    /// Minimum volume class sent to the ranking RPC (zero-padded to 5 digits).
    #[serde(default = "default_screening_min_volume")]
    pub screening_min_volume: u32,
    /// Market filter code for the ranking RPC ("000" = all markets).
    #[serde(default = "default_screening_market")]
    pub screening_market: String,
    #[serde(default = "default_screening_timeframe_minutes")]
    pub screening_timeframe_minutes: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        // serde's defaults and ours must agree; deserializing `{}` is the
        // canonical way to build the default snapshot.
        serde_yaml::from_str("{}").expect("empty strategy config deserializes")
    }
}

impl StrategyConfig {
    pub fn session_open(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.session_open_hour, self.session_open_minute, 0)
            .unwrap_or(NaiveTime::MIN)
    }

    pub fn time_stop(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.time_stop_hour, self.time_stop_minute, 0)
            .unwrap_or(NaiveTime::MIN)
    }

    /// Capture the risk thresholds a new position locks at entry time.
    pub fn locked_risk(&self) -> LockedRisk {
        LockedRisk {
            target_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
            partial_profit_pct: self.partial_take_profit_pct,
            partial_profit_ratio: self.partial_take_profit_ratio,
        }
    }
}

// =============================================================================
// Logging section
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            sandbox = config.broker.use_sandbox,
            screening_interval_minutes = config.engine.screening_interval_minutes,
            "config loaded"
        );

        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_has_expected_thresholds() {
        let cfg = StrategyConfig::default();
        assert_eq!(cfg.orb_minutes, 15);
        assert!((cfg.breakout_buffer_pct - 0.15).abs() < f64::EPSILON);
        assert!((cfg.take_profit_pct - 2.5).abs() < f64::EPSILON);
        assert!((cfg.stop_loss_pct - (-1.0)).abs() < f64::EPSILON);
        assert_eq!(cfg.partial_take_profit_pct, Some(1.5));
        assert_eq!(cfg.ema_short_period, 9);
        assert_eq!(cfg.ema_long_period, 20);
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert_eq!(cfg.session_open(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(cfg.time_stop(), NaiveTime::from_hms_opt(15, 0, 0).unwrap());
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.broker.use_sandbox);
        assert_eq!(cfg.engine.screening_interval_minutes, 5);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
broker:
  use_sandbox: false
  real:
    app_key: k
    app_secret: s
    account_no: 12345678-01
strategy:
  take_profit_pct: 3.0
  max_target_stocks: 2
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!cfg.broker.use_sandbox);
        assert_eq!(cfg.broker.active().account_no, "12345678-01");
        assert_eq!(cfg.broker.base_url(), BASE_URL_REAL);
        assert!((cfg.strategy.take_profit_pct - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.strategy.max_target_stocks, 2);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.strategy.orb_minutes, 15);
        assert!((cfg.strategy.rvol_threshold - 130.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sandbox_selects_mock_endpoints() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.base_url(), BASE_URL_SANDBOX);
        assert!(cfg.realtime_uri().starts_with("wss://mockapi."));
    }

    #[test]
    fn locked_risk_copies_live_thresholds() {
        let mut cfg = StrategyConfig::default();
        cfg.take_profit_pct = 4.0;
        cfg.partial_take_profit_pct = None;
        let risk = cfg.locked_risk();
        assert!((risk.target_profit_pct - 4.0).abs() < f64::EPSILON);
        assert_eq!(risk.partial_profit_pct, None);
        assert!((risk.partial_profit_ratio - 0.4).abs() < f64::EPSILON);
    }
}
