use serde::{Deserialize, Serialize};

/// Symbol classification used by the instrument picker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolCategory {
    Major,
    Minor,
    Exotic,
    Crypto,
    Indices,
    Commodities,
}

/// Which concrete data source is currently delivering events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// WebSocket connection to the trading terminal
    Socket,
    /// Polled JSON files exported by the terminal
    File,
    /// Generated random-walk data (no source reachable)
    Synthetic,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket => write!(f, "socket"),
            Self::File => write!(f, "file"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// One OHLC bar. Timestamps are milliseconds since the Unix epoch and mark
/// the start of the bar's bucket; bars with the same timestamp replace each
/// other instead of accumulating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timestamp: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
}

/// A single quote update. Transient: folded into the in-progress candle and
/// not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    /// Milliseconds since the Unix epoch
    pub time: u64,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: u64,
    pub flags: u32,
}

impl Tick {
    /// Best price estimate for candle folding: `last` when the venue
    /// reports one, midpoint otherwise (forex ticks often carry last=0).
    pub fn price(&self) -> f64 {
        if self.last > 0.0 {
            self.last
        } else {
            (self.bid + self.ask) / 2.0
        }
    }
}

/// Static metadata for one tradable instrument. Lists are replaced
/// wholesale when a new snapshot arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub symbol: String,
    pub display_name: String,
    pub category: SymbolCategory,
    pub digits: u32,
    pub point_size: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
}

/// Account figures as reported by the terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account: i64,
    pub server: String,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Connection status visible to consumers. Only the transport manager
/// writes this; everything else reads it through `connection` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_margin: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
    /// Milliseconds since the Unix epoch of the last status change
    pub last_update: u64,
    /// Human-readable diagnostic for degraded states
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ConnectionState {
    pub fn disconnected(transport: TransportKind) -> Self {
        Self {
            is_connected: false,
            transport,
            server: None,
            account: None,
            balance: None,
            equity: None,
            margin: None,
            free_margin: None,
            margin_level: None,
            last_update: 0,
            detail: None,
        }
    }
}

/// Direction of the SuperTrend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
}

/// Full indicator output for one calculation. Produced whole or not at
/// all; never partially updated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalState {
    pub upper_band: f64,
    pub lower_band: f64,
    pub trend: TrendDirection,
    pub atr: f64,
    pub rsi: f64,
    pub trend_strength_pct: f64,
    pub buy_signal: bool,
    pub sell_signal: bool,
    pub strong_signal: bool,
}

/// Kind of a fired trade signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Buy,
    Sell,
}

/// A buy/sell alert that survived the signal filters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeSignal {
    pub id: uuid::Uuid,
    pub timestamp: u64,
    pub kind: SignalKind,
    pub symbol: String,
    pub price: f64,
    pub strength_pct: f64,
    pub strong: bool,
}

/// Payload of a `signal` event: the recalculated state plus the alert, if
/// one fired on this bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalUpdate {
    pub symbol: String,
    pub timestamp: u64,
    pub state: SignalState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<TradeSignal>,
}

/// Event kinds consumers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connection,
    Tick,
    Candle,
    Symbols,
    Signal,
}

/// Normalized event delivered through the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Event {
    Connection(ConnectionState),
    Tick(Tick),
    Candle(Candle),
    Symbols(Vec<InstrumentMeta>),
    Signal(SignalUpdate),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection(_) => EventKind::Connection,
            Self::Tick(_) => EventKind::Tick,
            Self::Candle(_) => EventKind::Candle,
            Self::Symbols(_) => EventKind::Symbols,
            Self::Signal(_) => EventKind::Signal,
        }
    }
}

/// Snapshot requests the manager issues on connect and replays on reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Account,
    Symbols,
}

/// Command frame sent to the terminal's socket server
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub timestamp: u64,
}

impl Command {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            params: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_symbol(command: &str, symbol: &str) -> Self {
        Self {
            command: command.to_string(),
            params: Some(serde_json::json!({ "symbol": symbol })),
            timestamp: now_millis(),
        }
    }

    pub fn for_snapshot(kind: SnapshotKind) -> Self {
        match kind {
            SnapshotKind::Account => Self::new("GET_ACCOUNT_INFO"),
            SnapshotKind::Symbols => Self::new("GET_SYMBOLS"),
        }
    }
}

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_price_prefers_last() {
        let tick = Tick {
            symbol: "EURUSD".to_string(),
            time: 0,
            bid: 1.0849,
            ask: 1.0851,
            last: 1.0852,
            volume: 10,
            flags: 0,
        };
        assert_eq!(tick.price(), 1.0852);
    }

    #[test]
    fn test_tick_price_falls_back_to_midpoint() {
        let tick = Tick {
            symbol: "EURUSD".to_string(),
            time: 0,
            bid: 1.0848,
            ask: 1.0852,
            last: 0.0,
            volume: 10,
            flags: 0,
        };
        assert!((tick.price() - 1.0850).abs() < 1e-9);
    }

    #[test]
    fn test_event_kind_mapping() {
        let event = Event::Connection(ConnectionState::disconnected(TransportKind::Socket));
        assert_eq!(event.kind(), EventKind::Connection);
    }

    #[test]
    fn test_command_serialization() {
        let cmd = Command::with_symbol("SUBSCRIBE", "EURUSD");
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "SUBSCRIBE");
        assert_eq!(json["params"]["symbol"], "EURUSD");
        assert!(json["timestamp"].is_u64());
    }
}
