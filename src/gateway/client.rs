// =============================================================================
// Brokerage REST client — token grant, chart history, orders, ranking
// =============================================================================
//
// SECURITY: the app secret is never logged or serialized. The access token is
// cached on disk (`.token` by default) with its expiry and refreshed
// proactively when less than 60 seconds of validity remain.
//
// Every call is paced: a shared timestamp enforces a minimum spacing between
// RPCs so the engine stays under the provider's per-second call budget.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{BrokerConfig, StrategyConfig};
use crate::gateway::error::BrokerError;
use crate::gateway::events::parse_signed_price;
use crate::market_data::Bar;
use crate::screener::RankingRow;

/// Minimum spacing between consecutive RPCs.
const MIN_CALL_SPACING: Duration = Duration::from_millis(1_100);

/// Refresh the token when fewer than this many seconds of validity remain.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Request/API ids.
const API_TOKEN: &str = "/oauth2/token";
const API_CHART: &str = "/api/dostk/chart";
const API_ORDER: &str = "/api/dostk/ordr";
const API_RANKING: &str = "/api/dostk/rkinfo";
const API_ACCOUNT: &str = "/api/dostk/acnt";

const TR_MINUTE_CHART: &str = "ka10080";
const TR_VOLUME_SURGE: &str = "ka10023";
const TR_BUY_ORDER: &str = "kt10000";
const TR_SELL_ORDER: &str = "kt10001";
const TR_CANCEL_ORDER: &str = "kt10003";
const TR_DEPOSIT: &str = "kt00001";

/// Access token persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    expires_at: NaiveDateTime,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Local::now().naive_local() + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS)
            < self.expires_at
    }
}

/// Async brokerage REST client.
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    account_no: String,
    token_cache_path: PathBuf,
    token: RwLock<Option<CachedToken>>,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl BrokerClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(broker: &BrokerConfig, token_cache_path: impl Into<PathBuf>) -> Self {
        let creds = broker.active();
        let token_cache_path = token_cache_path.into();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let token = load_cached_token(&token_cache_path);
        if let Some(tok) = &token {
            info!(expires_at = %tok.expires_at, "cached access token loaded");
        }

        Self {
            http,
            base_url: broker.base_url().to_string(),
            app_key: creds.app_key.clone(),
            app_secret: creds.app_secret.clone(),
            account_no: creds.account_no.clone(),
            token_cache_path,
            token: RwLock::new(token),
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Pacing
    // -------------------------------------------------------------------------

    /// Enforce the minimum spacing between RPCs.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_CALL_SPACING {
                tokio::time::sleep(MIN_CALL_SPACING - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    // -------------------------------------------------------------------------
    // Token management
    // -------------------------------------------------------------------------

    /// Return a valid access token, requesting a fresh grant if the cached
    /// one is missing or within the refresh margin of expiry.
    pub async fn access_token(&self) -> Result<String, BrokerError> {
        if let Some(tok) = self.token.read().as_ref() {
            if tok.is_valid() {
                return Ok(tok.access_token.clone());
            }
        }

        info!("requesting new access token");
        self.pace().await;

        let url = format!("{}{}", self.base_url, API_TOKEN);
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "secretkey": self.app_secret,
        });

        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::DataQuality(format!("token response not JSON: {e}")))?;

        if !status.is_success() {
            let msg = business_message(&data);
            return Err(BrokerError::Auth(format!(
                "token grant failed ({status}): {msg}"
            )));
        }

        let access_token = data
            .get("access_token")
            .or_else(|| data.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Auth(format!("token grant rejected: {}", business_message(&data))))?
            .to_string();

        let expires_raw = data
            .get("expires_dt")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Auth("token response missing expires_dt".into()))?;
        let expires_at = NaiveDateTime::parse_from_str(expires_raw, "%Y%m%d%H%M%S")
            .map_err(|_| BrokerError::Auth(format!("bad token expiry format: {expires_raw}")))?;

        let cached = CachedToken {
            access_token: access_token.clone(),
            expires_at,
        };
        if let Err(e) = save_cached_token(&self.token_cache_path, &cached) {
            warn!(error = %e, "failed to persist access token");
        }
        info!(expires_at = %expires_at, "access token granted");
        *self.token.write() = Some(cached);

        Ok(access_token)
    }

    // -------------------------------------------------------------------------
    // Signed request plumbing
    // -------------------------------------------------------------------------

    async fn post_api(&self, path: &str, tr_id: &str, body: Value) -> Result<Value, BrokerError> {
        let token = self.access_token().await?;
        self.pace().await;

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json;charset=UTF-8")
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .header("api-id", tr_id)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::DataQuality(format!("{tr_id} response not JSON: {e}")))?;

        if status.as_u16() == 429 {
            return Err(BrokerError::RateLimited(business_message(&data)));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BrokerError::Auth(business_message(&data)));
        }
        if !status.is_success() {
            return Err(BrokerError::Business {
                code: i64::from(status.as_u16()),
                message: business_message(&data),
            });
        }

        Ok(data)
    }

    fn account_parts(&self) -> Result<(String, String), BrokerError> {
        let mut parts = self.account_no.splitn(2, '-');
        match (parts.next(), parts.next()) {
            (Some(prefix), Some(suffix)) if !prefix.is_empty() && !suffix.is_empty() => {
                Ok((prefix.to_string(), suffix.to_string()))
            }
            _ => Err(BrokerError::DataQuality(format!(
                "account number not in prefix-suffix form: {:?}",
                self.account_no
            ))),
        }
    }

    fn order_body(&self, symbol: &str, quantity: u64) -> Result<Value, BrokerError> {
        let (prefix, suffix) = self.account_parts()?;
        // trde_tp 3 = market order.
        Ok(json!({
            "canp_no": prefix,
            "acnm_no": suffix,
            "ord_gno": "01",
            "dmst_stex_tp": "KRX",
            "stk_cd": symbol,
            "ord_qty": quantity.to_string(),
            "ord_uv": "0",
            "trde_tp": "3",
        }))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place a market buy. Returns the broker order id on acceptance.
    /// Acceptance is provisional; the order-update stream is the truth.
    #[instrument(skip(self), name = "broker::buy_market")]
    pub async fn buy_market(&self, symbol: &str, quantity: u64) -> Result<String, BrokerError> {
        let body = self.order_body(symbol, quantity)?;
        let data = self.post_api(API_ORDER, TR_BUY_ORDER, body).await?;
        let order_id = extract_order_id(&data)?;
        info!(symbol, quantity, order_id = %order_id, "buy-market order accepted");
        Ok(order_id)
    }

    /// Place a market sell. Returns the broker order id on acceptance.
    #[instrument(skip(self), name = "broker::sell_market")]
    pub async fn sell_market(&self, symbol: &str, quantity: u64) -> Result<String, BrokerError> {
        let body = self.order_body(symbol, quantity)?;
        let data = self.post_api(API_ORDER, TR_SELL_ORDER, body).await?;
        let order_id = extract_order_id(&data)?;
        info!(symbol, quantity, order_id = %order_id, "sell-market order accepted");
        Ok(order_id)
    }

    /// Cancel an order. `quantity` 0 cancels the remaining unfilled amount.
    #[instrument(skip(self), name = "broker::cancel")]
    pub async fn cancel(
        &self,
        order_id: &str,
        symbol: &str,
        quantity: u64,
    ) -> Result<String, BrokerError> {
        let (prefix, suffix) = self.account_parts()?;
        let body = json!({
            "canp_no": prefix,
            "acnm_no": suffix,
            "ord_gno": "01",
            "dmst_stex_tp": "KRX",
            "orig_ord_no": order_id,
            "stk_cd": symbol,
            "cncl_qty": quantity.to_string(),
        });
        let data = self.post_api(API_ORDER, TR_CANCEL_ORDER, body).await?;
        let cancel_id = extract_order_id(&data)?;
        info!(order_id, symbol, cancel_id = %cancel_id, "cancel accepted");
        Ok(cancel_id)
    }

    // -------------------------------------------------------------------------
    // Market data & account
    // -------------------------------------------------------------------------

    /// One-shot minute-chart history for a symbol. The broker returns rows
    /// most recent first; the result is sorted ascending and ready to seed
    /// the frame store.
    #[instrument(skip(self), name = "broker::fetch_minute_chart")]
    pub async fn fetch_minute_chart(&self, symbol: &str) -> Result<Vec<Bar>, BrokerError> {
        let body = json!({
            "stk_cd": symbol,
            "tic_scope": "1",
            "upd_stkpc_tp": "0",
        });
        let data = self.post_api(API_CHART, TR_MINUTE_CHART, body).await?;
        ensure_return_code_ok(&data)?;

        let rows = data
            .get("stk_min_pole_chart_qry")
            .or_else(|| data.get("output2"))
            .and_then(Value::as_array)
            .ok_or_else(|| BrokerError::DataQuality("chart response missing rows".into()))?;

        let bars = parse_chart_rows(rows);
        debug!(symbol, count = bars.len(), "minute chart fetched");
        Ok(bars)
    }

    /// Volume-surge ranking used by the screener.
    #[instrument(skip(self, cfg), name = "broker::fetch_volume_surge_rank")]
    pub async fn fetch_volume_surge_rank(
        &self,
        cfg: &StrategyConfig,
    ) -> Result<Vec<RankingRow>, BrokerError> {
        let body = json!({
            "mrkt_tp": cfg.screening_market,
            // sort 2 = surge rate, time basis 1 = minutes.
            "sort_tp": "2",
            "tm_tp": "1",
            "tm": cfg.screening_timeframe_minutes.to_string(),
            "trde_qty_tp": format!("{:05}", cfg.screening_min_volume),
            // 14 = exclude ETFs, price class 8 = above 1000, exchange 3 = unified.
            "stk_cnd": "14",
            "pric_tp": "8",
            "stex_tp": "3",
        });
        let data = self.post_api(API_RANKING, TR_VOLUME_SURGE, body).await?;
        ensure_return_code_ok(&data)?;

        let rows = data
            .get("trde_qty_sdnin")
            .or_else(|| data.get("output1"))
            .and_then(Value::as_array)
            .ok_or_else(|| BrokerError::DataQuality("ranking response missing rows".into()))?;

        Ok(parse_ranking_rows(rows))
    }

    /// Available order cash from the deposit RPC.
    #[instrument(skip(self), name = "broker::fetch_available_cash")]
    pub async fn fetch_available_cash(&self) -> Result<i64, BrokerError> {
        let (prefix, suffix) = self.account_parts()?;
        let body = json!({
            "canp_no": prefix,
            "acnm_no": suffix,
            "qry_tp": "2",
            "acnm_prsc_cd": "01",
            "pwd_tp_cd": "00",
        });
        let data = self.post_api(API_ACCOUNT, TR_DEPOSIT, body).await?;
        ensure_return_code_ok(&data)?;

        let raw = data
            .get("output1")
            .and_then(|o| o.get("ord_alow_amt"))
            .or_else(|| data.get("ord_alow_amt"))
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::DataQuality("deposit response missing ord_alow_amt".into()))?;

        parse_padded_amount(raw)
            .ok_or_else(|| BrokerError::DataQuality(format!("unparseable cash amount: {raw:?}")))
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Response helpers
// =============================================================================

/// Accept `rt_cd`/`return_code` of `0` or `"0"` as success.
fn return_code_ok(data: &Value) -> bool {
    for key in ["rt_cd", "return_code"] {
        if let Some(v) = data.get(key) {
            return v.as_str().map(str::trim) == Some("0") || v.as_i64() == Some(0);
        }
    }
    // Some endpoints omit the code entirely on success.
    true
}

fn business_message(data: &Value) -> String {
    for key in ["msg1", "return_msg", "error_description", "message"] {
        if let Some(msg) = data.get(key).and_then(Value::as_str) {
            return msg.to_string();
        }
    }
    data.to_string()
}

fn ensure_return_code_ok(data: &Value) -> Result<(), BrokerError> {
    if return_code_ok(data) {
        return Ok(());
    }
    let code = data
        .get("rt_cd")
        .or_else(|| data.get("return_code"))
        .map(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .unwrap_or(-1)
        })
        .unwrap_or(-1);
    Err(BrokerError::Business {
        code,
        message: business_message(data),
    })
}

/// Extract the order id from an order response. The envelope nests the
/// return code under `output1` and the id under `output2`.
fn extract_order_id(data: &Value) -> Result<String, BrokerError> {
    let output1 = data.get("output1").unwrap_or(data);
    if !return_code_ok(output1) {
        return Err(BrokerError::Business {
            code: -1,
            message: business_message(output1),
        });
    }
    data.get("output2")
        .and_then(|o| o.get("ord_no"))
        .or_else(|| data.get("ord_no"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BrokerError::DataQuality("order response missing ord_no".into()))
}

/// Parse minute-chart rows into ascending bars. Malformed rows are skipped.
fn parse_chart_rows(rows: &[Value]) -> Vec<Bar> {
    let mut bars: Vec<Bar> = rows.iter().filter_map(parse_chart_row).collect();
    bars.sort_by_key(|b| b.ts);
    bars
}

fn parse_chart_row(row: &Value) -> Option<Bar> {
    let get = |key: &str| row.get(key).and_then(Value::as_str);

    let ts = NaiveDateTime::parse_from_str(get("cntr_tm")?.trim(), "%Y%m%d%H%M%S").ok()?;
    let close = parse_signed_price(get("cur_prc")?).ok()?;
    let open = parse_signed_price(get("open_pric")?).ok()?;
    let high = parse_signed_price(get("high_pric")?).ok()?;
    let low = parse_signed_price(get("low_pric")?).ok()?;
    let volume: u64 = get("trde_qty")?.trim().parse().ok()?;

    use chrono::Timelike;
    let ts = ts.with_second(0)?.with_nanosecond(0)?;

    Some(Bar {
        ts,
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Parse ranking rows; rows with missing or unparseable fields are skipped.
fn parse_ranking_rows(rows: &[Value]) -> Vec<RankingRow> {
    rows.iter()
        .filter_map(|row| {
            let get = |key: &str| row.get(key).and_then(Value::as_str);
            Some(RankingRow {
                symbol: crate::types::normalize_symbol(get("stk_cd")?),
                name: get("stk_nm")?.trim().to_string(),
                price: parse_signed_price(get("cur_prc")?).ok()?,
                surge_rate: get("sdnin_rt")?.trim().parse().ok()?,
            })
        })
        .collect()
}

/// Broker amounts arrive zero-padded ("000001000000").
fn parse_padded_amount(raw: &str) -> Option<i64> {
    let trimmed = raw.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        return Some(0);
    }
    trimmed.parse().ok()
}

// =============================================================================
// Token cache I/O
// =============================================================================

fn load_cached_token(path: &PathBuf) -> Option<CachedToken> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<CachedToken>(&content) {
        Ok(tok) if tok.is_valid() => Some(tok),
        Ok(tok) => {
            info!(expires_at = %tok.expires_at, "cached access token expired");
            None
        }
        Err(e) => {
            warn!(error = %e, "unreadable token cache, ignoring");
            None
        }
    }
}

fn save_cached_token(path: &PathBuf, token: &CachedToken) -> anyhow::Result<()> {
    use anyhow::Context;
    let content = serde_json::to_string(token).context("failed to serialize token")?;
    // Atomic write: temporary sibling file, then rename.
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to rename {}", tmp.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
