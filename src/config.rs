//! Configuration for the ingestion pipeline and the SuperTrend engine

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// SuperTrend + filter settings. Out-of-range values are clamped rather
/// than rejected so a bad settings file cannot take the pipeline down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuperTrendConfig {
    /// ATR lookback in bars (5-50)
    pub atr_period: usize,

    /// Band width as a multiple of ATR (0.5-5.0)
    pub multiplier: f64,

    /// RSI lookback in bars (5-30)
    pub rsi_period: usize,

    /// Suppress a buy when RSI is at or below this value (30-70)
    pub rsi_buy_threshold: f64,

    /// Suppress a sell when RSI is at or above this value (30-70)
    pub rsi_sell_threshold: f64,

    /// Enable the RSI signal filter
    pub use_rsi_filter: bool,

    /// Enable the volatility (ATR vs ATR moving average) signal filter
    pub use_volatility_filter: bool,

    /// Lookback for the ATR moving average used by the volatility filter (5-50)
    pub atr_ma_period: usize,

    /// Trend strength percentage above which a signal counts as strong (10-100)
    pub strong_trend_threshold: f64,
}

impl Default for SuperTrendConfig {
    fn default() -> Self {
        Self {
            atr_period: 20,
            multiplier: 2.0,
            rsi_period: 14,
            rsi_buy_threshold: 50.0,
            rsi_sell_threshold: 50.0,
            use_rsi_filter: true,
            use_volatility_filter: true,
            atr_ma_period: 20,
            strong_trend_threshold: 50.0,
        }
    }
}

impl SuperTrendConfig {
    /// Clamp every setting into its documented range
    pub fn clamped(mut self) -> Self {
        self.atr_period = self.atr_period.clamp(5, 50);
        self.multiplier = self.multiplier.clamp(0.5, 5.0);
        self.rsi_period = self.rsi_period.clamp(5, 30);
        self.rsi_buy_threshold = self.rsi_buy_threshold.clamp(30.0, 70.0);
        self.rsi_sell_threshold = self.rsi_sell_threshold.clamp(30.0, 70.0);
        self.atr_ma_period = self.atr_ma_period.clamp(5, 50);
        self.strong_trend_threshold = self.strong_trend_threshold.clamp(10.0, 100.0);
        self
    }

    /// Bars required before a calculation can produce a result
    pub fn min_bars(&self) -> usize {
        self.atr_period.max(self.rsi_period) + 1
    }
}

/// Everything the transport layer needs to find and survive the terminal
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// WebSocket endpoint of the terminal bridge
    pub socket_url: String,

    /// Base URL of the HTTP server exposing the terminal's exported files
    pub file_server_url: String,

    /// Endpoint path templates tried in order for each feed; `{feed}` is
    /// replaced with the feed's file name. The ordering is a compatibility
    /// shim for differing terminal deployments and must be preserved.
    pub endpoint_templates: Vec<String>,

    /// Period between poll cycles
    pub poll_interval: Duration,

    /// Per-feed HTTP fetch timeout, independent of the poll period
    pub fetch_timeout: Duration,

    /// Socket connection establishment (handshake) timeout
    pub connect_timeout: Duration,

    /// Liveness probe period while the socket is connected
    pub heartbeat_interval: Duration,

    /// Reconnect delay grows as `base * attempt`, capped at `max`
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    /// Connection attempts before the socket transport is declared
    /// exhausted and the pipeline fails over
    pub max_reconnect_attempts: u32,

    /// Background socket probe cadence while a fallback source is active
    pub socket_probe_interval: Duration,

    /// Fully-failed poll cycles tolerated before the poller goes inactive
    pub max_consecutive_errors: u32,

    /// Tick emission period of the synthetic generator
    pub synthetic_interval: Duration,

    /// Bucket width for folding ticks into candles
    pub candle_interval: Duration,

    /// Rolling buffer capacity; exceeding it trims the buffer down to
    /// `trim_to` in one batch
    pub max_candles: usize,
    pub trim_to: usize,

    /// Indicator settings
    pub supertrend: SuperTrendConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:8765".to_string(),
            file_server_url: "http://localhost:3001".to_string(),
            endpoint_templates: vec![
                "/api/mt5-files/{feed}.json".to_string(),
                "/files/{feed}.json".to_string(),
                "/{feed}.json".to_string(),
            ],
            poll_interval: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            socket_probe_interval: Duration::from_secs(30),
            max_consecutive_errors: 10,
            synthetic_interval: Duration::from_secs(1),
            candle_interval: Duration::from_secs(60),
            max_candles: 1000,
            trim_to: 500,
            supertrend: SuperTrendConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let scaled = self
            .reconnect_base_delay
            .saturating_mul(attempt.max(1));
        scaled.min(self.reconnect_max_delay)
    }

    /// Candidate URLs for one feed, in discovery order
    pub fn feed_urls(&self, feed_file: &str) -> Vec<String> {
        let base = self.file_server_url.trim_end_matches('/');
        self.endpoint_templates
            .iter()
            .map(|tpl| format!("{}{}", base, tpl.replace("{feed}", feed_file)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        let config = PipelineConfig::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(6));
        assert_eq!(config.reconnect_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_feed_urls_preserve_discovery_order() {
        let config = PipelineConfig {
            file_server_url: "http://localhost:3001/".to_string(),
            ..Default::default()
        };
        let urls = config.feed_urls("tick_data");
        assert_eq!(
            urls,
            vec![
                "http://localhost:3001/api/mt5-files/tick_data.json",
                "http://localhost:3001/files/tick_data.json",
                "http://localhost:3001/tick_data.json",
            ]
        );
    }

    #[test]
    fn test_supertrend_clamping() {
        let config = SuperTrendConfig {
            atr_period: 2,
            multiplier: 9.0,
            rsi_period: 100,
            strong_trend_threshold: 5.0,
            ..Default::default()
        }
        .clamped();
        assert_eq!(config.atr_period, 5);
        assert_eq!(config.multiplier, 5.0);
        assert_eq!(config.rsi_period, 30);
        assert_eq!(config.strong_trend_threshold, 10.0);
    }

    #[test]
    fn test_min_bars_covers_both_lookbacks() {
        let config = SuperTrendConfig {
            atr_period: 20,
            rsi_period: 14,
            ..Default::default()
        };
        assert_eq!(config.min_bars(), 21);
    }
}
