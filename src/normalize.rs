//! Message normalizer
//!
//! Pure mapping from the terminal's wire payloads to canonical records.
//! Every function here fails closed: a payload missing required fields or
//! carrying non-finite numbers produces no record at all, never a partial
//! entity. Nothing in this module does I/O or holds state.

use serde::Deserialize;

use crate::types::{
    AccountSnapshot, Candle, InstrumentMeta, SymbolCategory, Tick,
};

/// Raw message envelope as written by the terminal: `{"type": ..., "data": ...}`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedMessage {
    #[serde(rename = "TICK")]
    Tick(TickWire),
    #[serde(rename = "OHLC")]
    Ohlc(OhlcWire),
    #[serde(rename = "ACCOUNT_INFO")]
    AccountInfo(AccountWire),
    #[serde(rename = "SYMBOLS")]
    Symbols(Vec<SymbolWire>),
    #[serde(rename = "PONG")]
    Pong,
}

/// Tick payload; `time` is in source seconds
#[derive(Debug, Clone, Deserialize)]
pub struct TickWire {
    pub symbol: String,
    pub time: f64,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: u64,
    #[serde(default)]
    pub flags: u32,
}

/// OHLC payload; `timestamp` is in source seconds
#[derive(Debug, Clone, Deserialize)]
pub struct OhlcWire {
    pub symbol: String,
    pub timestamp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountWire {
    pub account: i64,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    #[serde(rename = "freeMargin")]
    pub free_margin: f64,
    #[serde(rename = "marginLevel")]
    pub margin_level: f64,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolWire {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub digits: u32,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    #[serde(default)]
    pub spread: Option<f64>,
}

/// A fully normalized record ready for dispatch
#[derive(Debug, Clone)]
pub enum NormalizedRecord {
    Tick(Tick),
    Candle(Candle),
    Account(AccountSnapshot),
    Symbols(Vec<InstrumentMeta>),
    Pong,
}

/// Parse one raw JSON document into a feed message
pub fn parse_feed_message(raw: &str) -> Option<FeedMessage> {
    serde_json::from_str(raw).ok()
}

/// Recover the newest record from a body that may be newline-delimited
/// JSON written incrementally by a non-atomic writer: scan lines backward
/// for the last one that parses, then fall back to a whole-body parse.
/// Returns `None` for empty or fully unparseable bodies.
pub fn latest_record(body: &str) -> Option<FeedMessage> {
    latest_record_where(body, |_| true)
}

/// `latest_record` restricted to messages accepted by `expected`, so a
/// feed looking for ticks skips past records of another shape.
pub fn latest_record_where(
    body: &str,
    expected: impl Fn(&FeedMessage) -> bool,
) -> Option<FeedMessage> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    for line in trimmed.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(msg) = parse_feed_message(line) {
            if expected(&msg) {
                return Some(msg);
            }
        }
    }

    parse_feed_message(trimmed).filter(expected)
}

/// Normalize any feed message, dropping records that fail validation
pub fn normalize_message(msg: FeedMessage) -> Option<NormalizedRecord> {
    match msg {
        FeedMessage::Tick(wire) => normalize_tick(wire).map(NormalizedRecord::Tick),
        FeedMessage::Ohlc(wire) => normalize_candle(wire).map(NormalizedRecord::Candle),
        FeedMessage::AccountInfo(wire) => {
            normalize_account(wire).map(NormalizedRecord::Account)
        }
        FeedMessage::Symbols(wires) => {
            Some(NormalizedRecord::Symbols(normalize_symbols(wires)))
        }
        FeedMessage::Pong => Some(NormalizedRecord::Pong),
    }
}

pub fn normalize_tick(wire: TickWire) -> Option<Tick> {
    if !finite_non_negative(&[wire.time, wire.bid, wire.ask, wire.last]) {
        return None;
    }
    if wire.bid <= 0.0 && wire.ask <= 0.0 && wire.last <= 0.0 {
        return None;
    }
    Some(Tick {
        symbol: wire.symbol,
        time: seconds_to_millis(wire.time),
        bid: wire.bid,
        ask: wire.ask,
        last: wire.last,
        volume: wire.volume,
        flags: wire.flags,
    })
}

pub fn normalize_candle(wire: OhlcWire) -> Option<Candle> {
    let prices = [wire.open, wire.high, wire.low, wire.close];
    if !finite_non_negative(&[wire.timestamp]) || prices.iter().any(|p| !p.is_finite() || *p <= 0.0)
    {
        return None;
    }
    // The writer occasionally emits high/low that do not envelope open and
    // close; repair rather than drop, matching the terminal's own charts.
    let high = prices.iter().cloned().fold(f64::MIN, f64::max);
    let low = prices.iter().cloned().fold(f64::MAX, f64::min);
    Some(Candle {
        symbol: wire.symbol,
        timestamp: seconds_to_millis(wire.timestamp),
        open: wire.open,
        high,
        low,
        close: wire.close,
        volume: wire.volume,
        bid: None,
        ask: None,
    })
}

pub fn normalize_account(wire: AccountWire) -> Option<AccountSnapshot> {
    if !finite_non_negative(&[wire.balance, wire.equity]) {
        return None;
    }
    Some(AccountSnapshot {
        account: wire.account,
        server: wire.server,
        balance: wire.balance,
        equity: wire.equity,
        margin: wire.margin,
        free_margin: wire.free_margin,
        margin_level: wire.margin_level,
        timestamp: seconds_to_millis(wire.timestamp),
    })
}

/// Map a symbol list snapshot, dropping entries with impossible metadata
pub fn normalize_symbols(wires: Vec<SymbolWire>) -> Vec<InstrumentMeta> {
    wires
        .into_iter()
        .filter_map(|wire| {
            if wire.name.is_empty() || wire.digits > 10 {
                return None;
            }
            let display_name = wire
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| wire.name.clone());
            Some(InstrumentMeta {
                category: categorize(&wire.name),
                point_size: point_size(wire.digits),
                symbol: wire.name,
                display_name,
                digits: wire.digits,
                min_lot: wire.volume_min,
                max_lot: wire.volume_max,
                lot_step: wire.volume_step,
                spread: wire.spread,
            })
        })
        .collect()
}

/// Smallest representable price increment for a digit count
pub fn point_size(digits: u32) -> f64 {
    10f64.powi(-(digits as i32))
}

const MAJOR_PAIRS: &[&str] = &[
    "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD",
];
const MINOR_PAIRS: &[&str] = &["EURGBP", "EURJPY", "GBPJPY", "EURCHF", "EURAUD", "EURCAD"];
const COMMODITIES: &[&str] = &["XAUUSD", "XAGUSD", "USOIL", "UKOIL"];
const INDICES: &[&str] = &["US30", "SPX500", "NAS100", "UK100", "GER30"];
const CRYPTO: &[&str] = &["BTCUSD", "ETHUSD", "LTCUSD", "XRPUSD"];

/// Deterministic, total symbol classification. Majors and minors match
/// exactly; commodity/index/crypto names match as substrings so broker
/// suffixes (`XAUUSD.m`, `GER30Cash`) land in the right bucket. Anything
/// unknown is exotic.
pub fn categorize(symbol: &str) -> SymbolCategory {
    if MAJOR_PAIRS.contains(&symbol) {
        SymbolCategory::Major
    } else if MINOR_PAIRS.contains(&symbol) {
        SymbolCategory::Minor
    } else if COMMODITIES.iter().any(|c| symbol.contains(c)) {
        SymbolCategory::Commodities
    } else if INDICES.iter().any(|i| symbol.contains(i)) {
        SymbolCategory::Indices
    } else if CRYPTO.iter().any(|c| symbol.contains(c)) {
        SymbolCategory::Crypto
    } else {
        SymbolCategory::Exotic
    }
}

fn seconds_to_millis(seconds: f64) -> u64 {
    (seconds * 1000.0).round().max(0.0) as u64
}

fn finite_non_negative(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite() && *v >= 0.0)
}
