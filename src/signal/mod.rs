//! Signal engine
//!
//! Subscribes to tick/candle events for the selected instrument, maintains
//! the rolling candle buffer, and re-evaluates the SuperTrend state on
//! every new data point. The engine is the only owner of the buffer; all
//! mutation happens through dispatcher callbacks, which arrive on one
//! logical timeline per instrument.

pub mod supertrend;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::types::{
    Candle, Event, EventKind, SignalKind, SignalState, SignalUpdate, Tick, TradeSignal,
    TrendDirection,
};

struct EngineInner {
    symbol: String,
    buffer: Vec<Candle>,
}

/// Rolling-buffer SuperTrend engine for one selected instrument
pub struct SignalEngine {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    inner: Mutex<EngineInner>,
}

impl SignalEngine {
    pub fn new(config: Arc<PipelineConfig>, dispatcher: Arc<Dispatcher>, symbol: &str) -> Self {
        Self {
            config,
            dispatcher,
            inner: Mutex::new(EngineInner {
                symbol: symbol.to_string(),
                buffer: Vec::new(),
            }),
        }
    }

    /// Register the engine's tick/candle handlers on the dispatcher
    pub fn attach(engine: &Arc<Self>) {
        let candle_engine = engine.clone();
        engine.dispatcher.subscribe(EventKind::Candle, move |event| {
            if let Event::Candle(candle) = event {
                candle_engine.on_candle(candle);
            }
        });
        let tick_engine = engine.clone();
        engine.dispatcher.subscribe(EventKind::Tick, move |event| {
            if let Event::Tick(tick) = event {
                tick_engine.on_tick(tick);
            }
        });
    }

    /// Switch the engine to a new instrument, clearing buffer and state
    /// before any event for the new instrument is processed.
    pub fn set_instrument(&self, symbol: &str) {
        let mut inner = self.lock();
        if inner.symbol == symbol {
            return;
        }
        info!(from = %inner.symbol, to = %symbol, "switching instrument, clearing buffer");
        inner.symbol = symbol.to_string();
        inner.buffer.clear();
    }

    pub fn current_symbol(&self) -> String {
        self.lock().symbol.clone()
    }

    /// Ingest a finished (or in-progress) OHLC bar for the selected
    /// instrument. Same-timestamp bars replace in place.
    pub fn on_candle(&self, candle: &Candle) {
        let update = {
            let mut inner = self.lock();
            if candle.symbol != inner.symbol {
                return;
            }
            apply_candle(&mut inner.buffer, candle.clone(), &self.config);
            self.recalculate(&inner)
        };
        self.publish(update);
    }

    /// Fold a tick into the current candle bucket and re-evaluate
    pub fn on_tick(&self, tick: &Tick) {
        let update = {
            let mut inner = self.lock();
            if tick.symbol != inner.symbol {
                return;
            }
            let candle = fold_tick(inner.buffer.last(), tick, &self.config);
            apply_candle(&mut inner.buffer, candle, &self.config);
            self.recalculate(&inner)
        };
        self.publish(update);
    }

    /// Evaluate the indicator over the current buffer without publishing.
    /// Calling this twice without new data returns bit-identical results.
    pub fn calculate(&self) -> Option<SignalState> {
        let inner = self.lock();
        supertrend::evaluate(&inner.buffer, &self.config.supertrend)
    }

    /// Buffered candle count (diagnostics and tests)
    pub fn buffer_len(&self) -> usize {
        self.lock().buffer.len()
    }

    fn recalculate(&self, inner: &EngineInner) -> Option<SignalUpdate> {
        let state = supertrend::evaluate(&inner.buffer, &self.config.supertrend)?;
        let last = inner.buffer.last()?;
        let trade = trade_signal(&state, last);
        Some(SignalUpdate {
            symbol: inner.symbol.clone(),
            timestamp: last.timestamp,
            state,
            trade,
        })
    }

    // Publish outside the engine lock so signal consumers may call back in.
    fn publish(&self, update: Option<SignalUpdate>) {
        if let Some(update) = update {
            if let Some(trade) = &update.trade {
                info!(
                    symbol = %trade.symbol,
                    kind = ?trade.kind,
                    price = trade.price,
                    strength = trade.strength_pct,
                    "trade signal fired"
                );
            }
            self.dispatcher.publish(&Event::Signal(update));
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Append or replace a bar, keeping the buffer ordered and bounded.
/// Trimming is a batch operation: only when the cap is exceeded does the
/// buffer shrink, and never below a margin that the calculation needs.
fn apply_candle(buffer: &mut Vec<Candle>, candle: Candle, config: &PipelineConfig) {
    let newest = buffer.last().map(|last| last.timestamp);
    match newest {
        Some(ts) if candle.timestamp == ts => {
            let idx = buffer.len() - 1;
            buffer[idx] = candle;
        }
        Some(ts) if candle.timestamp < ts => {
            debug!(
                symbol = %candle.symbol,
                timestamp = candle.timestamp,
                "dropping out-of-order candle"
            );
        }
        _ => buffer.push(candle),
    }

    if buffer.len() > config.max_candles {
        let keep = config.trim_to.max(config.supertrend.min_bars());
        let excess = buffer.len() - keep;
        buffer.drain(..excess);
    }
}

/// Project a tick onto its candle bucket: a new bucket opens a fresh bar,
/// an existing one updates high/low/close and accumulates volume.
fn fold_tick(current: Option<&Candle>, tick: &Tick, config: &PipelineConfig) -> Candle {
    let bucket_ms = (config.candle_interval.as_millis() as u64).max(1);
    let bucket = tick.time - tick.time % bucket_ms;
    let price = tick.price();

    match current {
        Some(last) if last.timestamp == bucket => Candle {
            symbol: last.symbol.clone(),
            timestamp: bucket,
            open: last.open,
            high: last.high.max(price),
            low: last.low.min(price),
            close: price,
            volume: last.volume + tick.volume,
            bid: Some(tick.bid),
            ask: Some(tick.ask),
        },
        _ => Candle {
            symbol: tick.symbol.clone(),
            timestamp: bucket,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: tick.volume,
            bid: Some(tick.bid),
            ask: Some(tick.ask),
        },
    }
}

fn trade_signal(state: &SignalState, last: &Candle) -> Option<TradeSignal> {
    let kind = if state.buy_signal {
        SignalKind::Buy
    } else if state.sell_signal {
        SignalKind::Sell
    } else {
        return None;
    };
    debug_assert!(matches!(
        (kind, state.trend),
        (SignalKind::Buy, TrendDirection::Up) | (SignalKind::Sell, TrendDirection::Down)
    ));
    Some(TradeSignal {
        id: Uuid::new_v4(),
        timestamp: last.timestamp,
        kind,
        symbol: last.symbol.clone(),
        price: last.close,
        strength_pct: state.trend_strength_pct,
        strong: state.strong_signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuperTrendConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            candle_interval: Duration::from_secs(60),
            max_candles: 40,
            trim_to: 20,
            supertrend: SuperTrendConfig {
                atr_period: 5,
                rsi_period: 5,
                atr_ma_period: 5,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn engine() -> Arc<SignalEngine> {
        Arc::new(SignalEngine::new(
            test_config(),
            Arc::new(Dispatcher::new()),
            "EURUSD",
        ))
    }

    fn candle_at(ts: u64, close: f64) -> Candle {
        Candle {
            symbol: "EURUSD".to_string(),
            timestamp: ts,
            open: close - 0.2,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 100,
            bid: None,
            ask: None,
        }
    }

    fn tick_at(time: u64, last: f64) -> Tick {
        Tick {
            symbol: "EURUSD".to_string(),
            time,
            bid: last - 0.01,
            ask: last + 0.01,
            last,
            volume: 5,
            flags: 0,
        }
    }

    fn feed(engine: &SignalEngine, bars: usize) {
        for i in 0..bars {
            let close = 100.0 + (i as f64 * 0.7).sin();
            engine.on_candle(&candle_at(i as u64 * 60_000, close));
        }
    }

    #[test]
    fn test_calculate_is_idempotent() {
        let engine = engine();
        feed(&engine, 12);

        let first = engine.calculate().expect("enough data");
        let second = engine.calculate().expect("enough data");
        assert_eq!(first, second);
        // Bit-identical, not merely approximately equal.
        assert_eq!(first.atr.to_bits(), second.atr.to_bits());
        assert_eq!(first.rsi.to_bits(), second.rsi.to_bits());
        assert_eq!(
            first.upper_band.to_bits(),
            second.upper_band.to_bits()
        );
        assert_eq!(
            first.trend_strength_pct.to_bits(),
            second.trend_strength_pct.to_bits()
        );
    }

    #[test]
    fn test_insufficient_buffer_yields_none() {
        let engine = engine();
        feed(&engine, 3);
        assert!(engine.calculate().is_none());
    }

    #[test]
    fn test_set_instrument_clears_state() {
        let engine = engine();
        feed(&engine, 12);
        assert!(engine.calculate().is_some());

        engine.set_instrument("GBPUSD");
        assert_eq!(engine.buffer_len(), 0);
        assert!(engine.calculate().is_none());

        // Events for the old instrument no longer land.
        engine.on_candle(&candle_at(0, 100.0));
        assert_eq!(engine.buffer_len(), 0);
    }

    #[test]
    fn test_same_timestamp_candle_replaces() {
        let engine = engine();
        engine.on_candle(&candle_at(60_000, 100.0));
        engine.on_candle(&candle_at(60_000, 101.5));
        assert_eq!(engine.buffer_len(), 1);

        let inner = engine.lock();
        assert_eq!(inner.buffer[0].close, 101.5);
    }

    #[test]
    fn test_out_of_order_candle_is_dropped() {
        let engine = engine();
        engine.on_candle(&candle_at(120_000, 100.0));
        engine.on_candle(&candle_at(60_000, 99.0));
        assert_eq!(engine.buffer_len(), 1);
    }

    #[test]
    fn test_buffer_trims_in_batches() {
        let engine = engine();
        feed(&engine, 41);
        // One past the cap: trimmed down to trim_to in a single batch.
        assert_eq!(engine.buffer_len(), 20);

        feed(&engine, 41); // same timestamps, replaces nothing older
        assert!(engine.buffer_len() <= 40);
    }

    #[test]
    fn test_tick_folding_builds_buckets() {
        let engine = engine();

        engine.on_tick(&tick_at(60_010, 100.0));
        engine.on_tick(&tick_at(60_020, 100.6));
        engine.on_tick(&tick_at(60_030, 99.8));
        assert_eq!(engine.buffer_len(), 1);
        {
            let inner = engine.lock();
            let bar = &inner.buffer[0];
            assert_eq!(bar.timestamp, 60_000);
            assert_eq!(bar.open, 100.0);
            assert_eq!(bar.high, 100.6);
            assert_eq!(bar.low, 99.8);
            assert_eq!(bar.close, 99.8);
            assert_eq!(bar.volume, 15);
        }

        // Next bucket opens a fresh bar.
        engine.on_tick(&tick_at(120_001, 100.2));
        assert_eq!(engine.buffer_len(), 2);
    }

    #[test]
    fn test_signal_events_published_on_new_data() {
        let dispatcher = Arc::new(Dispatcher::new());
        let engine = Arc::new(SignalEngine::new(
            test_config(),
            dispatcher.clone(),
            "EURUSD",
        ));
        SignalEngine::attach(&engine);

        let signals = Arc::new(AtomicUsize::new(0));
        let signals_clone = signals.clone();
        dispatcher.subscribe(EventKind::Signal, move |event| {
            if matches!(event, Event::Signal(_)) {
                signals_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        for i in 0..12u64 {
            let close = 100.0 + (i as f64 * 0.7).sin();
            dispatcher.publish(&Event::Candle(candle_at(i * 60_000, close)));
        }
        // Bars 6..=12 have enough history to evaluate: seven updates.
        assert_eq!(signals.load(Ordering::SeqCst), 7);
    }
}
