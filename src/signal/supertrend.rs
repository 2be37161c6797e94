//! SuperTrend indicator math
//!
//! Pure functions over a candle slice. The band history is re-derived on
//! every call as a single forward fold carrying the previous effective
//! bands, so results are deterministic for a given buffer and free of the
//! drift an incremental cache would accumulate.

use crate::config::SuperTrendConfig;
use crate::types::{Candle, SignalKind, SignalState, TrendDirection};

/// Raw indicator output for the newest bar, before signal filtering
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorOutcome {
    /// Effective (ratcheted) bands of the newest bar
    pub upper_band: f64,
    pub lower_band: f64,
    /// Trend at the newest bar and at the bar before it
    pub trend: TrendDirection,
    pub prev_trend: TrendDirection,
    pub atr: f64,
    pub rsi: f64,
    /// Moving average of ATR, input to the volatility filter
    pub atr_ma: f64,
    /// `min(|close - active band| / ATR * 100, 100)`
    pub strength_pct: f64,
}

/// Compute the indicator over `candles`, oldest first. Returns `None`
/// until the buffer covers both the ATR and RSI lookbacks plus one bar.
pub fn compute(candles: &[Candle], config: &SuperTrendConfig) -> Option<IndicatorOutcome> {
    let n = candles.len();
    if n < config.min_bars() {
        return None;
    }

    // True range per bar; first bar has no previous close.
    let mut true_ranges = Vec::with_capacity(n);
    for (i, candle) in candles.iter().enumerate() {
        let range = candle.high - candle.low;
        let tr = if i == 0 {
            range
        } else {
            let prev_close = candles[i - 1].close;
            range
                .max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs())
        };
        true_ranges.push(tr.max(0.0));
    }

    // ATR per bar (simple moving average of true range), defined from the
    // first bar with a full window.
    let period = config.atr_period;
    let first = period - 1;
    let mut atrs = Vec::with_capacity(n - first);
    let mut window_sum: f64 = true_ranges[..period].iter().sum();
    atrs.push(window_sum / period as f64);
    for i in period..n {
        window_sum += true_ranges[i] - true_ranges[i - period];
        atrs.push(window_sum / period as f64);
    }

    // Band fold. The effective upper band only rises or resets when the
    // previous close was at or below it; the lower band mirrors that.
    let seed = &candles[first];
    let (mut upper, mut lower) = basic_bands(seed, atrs[0], config.multiplier);
    let mut trend = TrendDirection::Up;
    let mut prev_trend = trend;

    for i in (first + 1)..n {
        let candle = &candles[i];
        let prev_close = candles[i - 1].close;
        prev_trend = trend;

        // Flip is judged against the previous bar's bands, before this
        // bar's ratchet update.
        trend = match trend {
            TrendDirection::Down if candle.close > lower => TrendDirection::Up,
            TrendDirection::Up if candle.close < upper => TrendDirection::Down,
            current => current,
        };

        let atr = atrs[i - first];
        let (basic_upper, basic_lower) = basic_bands(candle, atr, config.multiplier);
        if basic_upper > upper || prev_close <= upper {
            upper = basic_upper;
        }
        if basic_lower < lower || prev_close >= lower {
            lower = basic_lower;
        }
    }

    let atr = *atrs.last().expect("atr window is non-empty");
    let atr_ma = trailing_mean(&atrs, config.atr_ma_period);
    let rsi = rsi_over_window(candles, config.rsi_period);

    let last = &candles[n - 1];
    let active_band = match trend {
        TrendDirection::Up => upper,
        TrendDirection::Down => lower,
    };
    let strength_pct = if atr > 0.0 {
        ((last.close - active_band).abs() / atr * 100.0).min(100.0)
    } else {
        0.0
    };

    Some(IndicatorOutcome {
        upper_band: upper,
        lower_band: lower,
        trend,
        prev_trend,
        atr,
        rsi,
        atr_ma,
        strength_pct,
    })
}

/// Full evaluation: indicator plus signal generation and filtering.
/// Signals fire only on a trend flip between the two newest bars.
pub fn evaluate(candles: &[Candle], config: &SuperTrendConfig) -> Option<SignalState> {
    let outcome = compute(candles, config)?;
    let flipped = outcome.trend != outcome.prev_trend;

    let buy_signal = flipped
        && outcome.trend == TrendDirection::Up
        && rsi_filter_allows(SignalKind::Buy, outcome.rsi, config)
        && volatility_filter_allows(outcome.atr, outcome.atr_ma, config);
    let sell_signal = flipped
        && outcome.trend == TrendDirection::Down
        && rsi_filter_allows(SignalKind::Sell, outcome.rsi, config)
        && volatility_filter_allows(outcome.atr, outcome.atr_ma, config);
    let strong_signal = outcome.strength_pct > config.strong_trend_threshold;

    Some(SignalState {
        upper_band: outcome.upper_band,
        lower_band: outcome.lower_band,
        trend: outcome.trend,
        atr: outcome.atr,
        rsi: outcome.rsi,
        trend_strength_pct: outcome.strength_pct,
        buy_signal,
        sell_signal,
        strong_signal,
    })
}

/// RSI suppression: a buy needs RSI above the buy threshold, a sell needs
/// RSI below the sell threshold. Pure in (kind, rsi, thresholds).
pub fn rsi_filter_allows(kind: SignalKind, rsi: f64, config: &SuperTrendConfig) -> bool {
    if !config.use_rsi_filter {
        return true;
    }
    match kind {
        SignalKind::Buy => rsi > config.rsi_buy_threshold,
        SignalKind::Sell => rsi < config.rsi_sell_threshold,
    }
}

/// Volatility suppression: signals only pass while ATR sits above its own
/// moving average. Pure in (atr, atr_ma).
pub fn volatility_filter_allows(atr: f64, atr_ma: f64, config: &SuperTrendConfig) -> bool {
    if !config.use_volatility_filter {
        return true;
    }
    atr > atr_ma
}

fn basic_bands(candle: &Candle, atr: f64, multiplier: f64) -> (f64, f64) {
    let hl2 = (candle.high + candle.low) / 2.0;
    (hl2 - multiplier * atr, hl2 + multiplier * atr)
}

/// Mean of the trailing `period` values (or all of them, early on)
fn trailing_mean(values: &[f64], period: usize) -> f64 {
    let window = &values[values.len().saturating_sub(period.max(1))..];
    window.iter().sum::<f64>() / window.len() as f64
}

/// Window RSI over the newest `period` closes. A window with zero average
/// loss reads as 100, never as a division by zero.
fn rsi_over_window(candles: &[Candle], period: usize) -> f64 {
    let n = candles.len();
    debug_assert!(n > period);
    let closes: Vec<f64> = candles[n - period - 1..].iter().map(|c| c.close).collect();

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in closes.windows(2) {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            gain_sum += delta;
        } else {
            loss_sum -= delta;
        }
    }

    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}
