// =============================================================================
// Typed realtime events — the only place raw broker field codes are touched
// =============================================================================
//
// The realtime feed delivers frames of shape
//   { "trnm": "REAL", "type": "0B", "item": "A005930", "values": { ... } }
// where `values` is keyed by numeric field ids. Each feed is parsed here into
// a tagged variant; nothing downstream of this module ever sees a raw code.
//
// Feed ids: 0B trade, 0D order book, 1h volatility halt, 00 order update,
// 04 balance update.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;

use crate::types::{normalize_symbol, OrderSide, OrderStatus};

pub const FEED_TRADE: &str = "0B";
pub const FEED_BOOK: &str = "0D";
pub const FEED_HALT: &str = "1h";
pub const FEED_ORDER_UPDATE: &str = "00";
pub const FEED_BALANCE: &str = "04";

/// A parsed realtime frame.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Trade(TradeTick),
    Book(BookUpdate),
    Halt(HaltEvent),
    Order(OrderUpdate),
    Balance(BalanceUpdate),
    /// REG/REMOVE acknowledgement from the realtime channel.
    SubscriptionAck { code: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
    /// Positive = buyer-initiated, negative = seller-initiated.
    pub signed_volume: i64,
    pub at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub symbol: String,
    pub total_bid_volume: i64,
    pub total_ask_volume: i64,
}

#[derive(Debug, Clone)]
pub struct HaltEvent {
    pub symbol: String,
    pub active: bool,
    pub release_at: Option<NaiveTime>,
}

#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: String,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub status: OrderStatus,
    pub exec_qty: u64,
    pub exec_price: f64,
    pub unfilled_qty: u64,
    pub original_qty: u64,
}

#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub symbol: String,
    pub held_size: u64,
    pub avg_price: f64,
}

// =============================================================================
// Field helpers
// =============================================================================

fn field<'a>(values: &'a Value, id: &str) -> Option<&'a str> {
    values.get(id).and_then(Value::as_str)
}

fn required_field<'a>(values: &'a Value, id: &str, feed: &str) -> Result<&'a str> {
    field(values, id).with_context(|| format!("feed {feed}: missing field {id}"))
}

/// Parse a price field that may carry a `+`/`-` direction prefix; the sign
/// encodes movement against the previous close, not a negative price.
pub fn parse_signed_price(raw: &str) -> Result<f64> {
    let cleaned = raw.trim().trim_start_matches(['+', '-']);
    cleaned
        .parse::<f64>()
        .with_context(|| format!("unparseable price field: {raw:?}"))
}

fn parse_int(raw: &str, what: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .with_context(|| format!("unparseable {what}: {raw:?}"))
}

fn parse_uint(raw: &str, what: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u64>()
        .with_context(|| format!("unparseable {what}: {raw:?}"))
}

/// Parse an `HHMMSS` field.
pub fn parse_hhmmss(raw: &str) -> Option<NaiveTime> {
    let t = raw.trim();
    if t.len() != 6 || !t.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: u32 = t[0..2].parse().ok()?;
    let m: u32 = t[2..4].parse().ok()?;
    let s: u32 = t[4..6].parse().ok()?;
    NaiveTime::from_hms_opt(h, m, s)
}

// =============================================================================
// Frame parsing
// =============================================================================

/// Parse one `REAL` frame. `today` anchors HHMMSS event times to a trading
/// day (the broker's local date). Returns `Ok(None)` for feed types the
/// engine does not consume.
pub fn parse_real_event(frame: &Value, today: NaiveDate) -> Result<Option<GatewayEvent>> {
    let feed = frame
        .get("type")
        .and_then(Value::as_str)
        .context("REAL frame missing type")?;
    let values = frame.get("values").context("REAL frame missing values")?;
    let item = frame.get("item").and_then(Value::as_str).unwrap_or("");
    let symbol = normalize_symbol(item);

    match feed {
        FEED_TRADE => Ok(Some(GatewayEvent::Trade(parse_trade(
            &symbol, values, today,
        )?))),
        FEED_BOOK => Ok(Some(GatewayEvent::Book(parse_book(&symbol, values)?))),
        FEED_HALT => Ok(Some(GatewayEvent::Halt(parse_halt(&symbol, values)))),
        FEED_ORDER_UPDATE => Ok(Some(GatewayEvent::Order(parse_order_update(values)?))),
        FEED_BALANCE => Ok(Some(GatewayEvent::Balance(parse_balance(
            &symbol, values,
        )?))),
        _ => Ok(None),
    }
}

fn parse_trade(symbol: &str, values: &Value, today: NaiveDate) -> Result<TradeTick> {
    let price = parse_signed_price(required_field(values, "10", FEED_TRADE)?)?;
    let signed_volume = parse_int(required_field(values, "15", FEED_TRADE)?, "signed volume")?;
    let time = parse_hhmmss(required_field(values, "20", FEED_TRADE)?)
        .context("feed 0B: bad HHMMSS event time")?;

    Ok(TradeTick {
        symbol: symbol.to_string(),
        price,
        signed_volume,
        at: today.and_time(time),
    })
}

fn parse_book(symbol: &str, values: &Value) -> Result<BookUpdate> {
    let total_ask_volume = parse_int(required_field(values, "121", FEED_BOOK)?, "total ask volume")?;
    let total_bid_volume = parse_int(required_field(values, "125", FEED_BOOK)?, "total bid volume")?;

    Ok(BookUpdate {
        symbol: symbol.to_string(),
        total_bid_volume,
        total_ask_volume,
    })
}

fn parse_halt(symbol: &str, values: &Value) -> HaltEvent {
    // A present, non-zero activation flag means the halt is in force; a
    // release frame clears it.
    let flag = field(values, "9068").unwrap_or("").trim();
    let active = !flag.is_empty() && flag != "0";
    let release_at = field(values, "1224").and_then(parse_hhmmss);

    HaltEvent {
        symbol: symbol.to_string(),
        active,
        release_at,
    }
}

fn parse_order_update(values: &Value) -> Result<OrderUpdate> {
    let order_id = required_field(values, "9203", FEED_ORDER_UPDATE)?
        .trim()
        .to_string();
    let symbol = normalize_symbol(required_field(values, "9001", FEED_ORDER_UPDATE)?);
    let status_text = required_field(values, "913", FEED_ORDER_UPDATE)?;
    let status = OrderStatus::from_status_text(status_text)
        .with_context(|| format!("unknown order status text: {status_text:?}"))?;

    let exec_qty = parse_uint(field(values, "911").unwrap_or("0"), "exec qty")?;
    let exec_price = parse_signed_price(field(values, "910").unwrap_or("0")).unwrap_or(0.0);
    let unfilled_qty = parse_uint(field(values, "902").unwrap_or("0"), "unfilled qty")?;
    let original_qty = parse_uint(field(values, "900").unwrap_or("0"), "original qty")?;

    // 907: 1 = sell, 2 = buy.
    let side = match field(values, "907").map(str::trim) {
        Some("2") => Some(OrderSide::Buy),
        Some("1") => Some(OrderSide::Sell),
        _ => None,
    };

    Ok(OrderUpdate {
        order_id,
        symbol,
        side,
        status,
        exec_qty,
        exec_price,
        unfilled_qty,
        original_qty,
    })
}

fn parse_balance(symbol: &str, values: &Value) -> Result<BalanceUpdate> {
    let held_size = parse_uint(field(values, "930").unwrap_or("0"), "held size")?;
    let avg_price = parse_signed_price(field(values, "931").unwrap_or("0")).unwrap_or(0.0);

    Ok(BalanceUpdate {
        symbol: symbol.to_string(),
        held_size,
        avg_price,
    })
}

// =============================================================================
// Tests
// =============================================================================
