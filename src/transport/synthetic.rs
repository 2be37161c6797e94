//! Synthetic data generator
//!
//! Last-resort source when neither the socket nor the file server is
//! reachable: publishes a demo instrument list and account snapshot, then
//! emits plausible random-walk ticks so the rest of the pipeline (and the
//! display layer behind it) keeps exercising the same code paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::StatusHandle;
use crate::config::PipelineConfig;
use crate::normalize::{categorize, point_size};
use crate::types::{now_millis, AccountSnapshot, Event, InstrumentMeta, Tick};

/// Per-symbol shape of the generated walk
struct DemoSymbol {
    symbol: &'static str,
    name: &'static str,
    digits: u32,
    base_price: f64,
    volatility: f64,
    spread: f64,
    max_lot: f64,
}

const DEMO_SYMBOLS: &[DemoSymbol] = &[
    DemoSymbol {
        symbol: "EURUSD",
        name: "Euro vs US Dollar",
        digits: 5,
        base_price: 1.0850,
        volatility: 0.0001,
        spread: 0.00015,
        max_lot: 100.0,
    },
    DemoSymbol {
        symbol: "GBPUSD",
        name: "British Pound vs US Dollar",
        digits: 5,
        base_price: 1.2650,
        volatility: 0.0002,
        spread: 0.0002,
        max_lot: 100.0,
    },
    DemoSymbol {
        symbol: "USDJPY",
        name: "US Dollar vs Japanese Yen",
        digits: 3,
        base_price: 149.50,
        volatility: 0.01,
        spread: 0.015,
        max_lot: 100.0,
    },
    DemoSymbol {
        symbol: "XAUUSD",
        name: "Gold vs US Dollar",
        digits: 2,
        base_price: 2050.0,
        volatility: 0.5,
        spread: 0.3,
        max_lot: 100.0,
    },
    DemoSymbol {
        symbol: "BTCUSD",
        name: "Bitcoin vs US Dollar",
        digits: 2,
        base_price: 43500.0,
        volatility: 50.0,
        spread: 10.0,
        max_lot: 10.0,
    },
];

/// Instrument list published when the generator activates
pub fn demo_instruments() -> Vec<InstrumentMeta> {
    DEMO_SYMBOLS
        .iter()
        .map(|d| InstrumentMeta {
            symbol: d.symbol.to_string(),
            display_name: d.name.to_string(),
            category: categorize(d.symbol),
            digits: d.digits,
            point_size: point_size(d.digits),
            min_lot: 0.01,
            max_lot: d.max_lot,
            lot_step: 0.01,
            spread: Some(d.spread),
        })
        .collect()
}

/// Account snapshot published when the generator activates
pub fn demo_account() -> AccountSnapshot {
    AccountSnapshot {
        account: 12_345_678,
        server: "Demo Mode".to_string(),
        balance: 10_000.0,
        equity: 10_000.0,
        margin: 0.0,
        free_margin: 10_000.0,
        margin_level: 0.0,
        timestamp: now_millis(),
    }
}

/// One random-walk step: a slow sine drift plus uniform noise, scaled by
/// the symbol's volatility, floored at 95% of the current price.
pub fn next_price(current: f64, volatility: f64, drift: f64, noise: f64) -> f64 {
    let change = (drift + noise) * volatility * current;
    (current + change).max(current * 0.95)
}

/// Random-walk tick source
pub struct SyntheticGenerator {
    config: Arc<PipelineConfig>,
    status: Arc<StatusHandle>,
}

impl SyntheticGenerator {
    pub fn new(config: Arc<PipelineConfig>, status: Arc<StatusHandle>) -> Self {
        Self { config, status }
    }

    /// Publish the demo snapshot, then emit ticks until cancelled
    pub async fn run(&self, cancelled: Arc<AtomicBool>) {
        info!("synthetic generator active, emitting demo data");
        self.status.publish(Event::Symbols(demo_instruments()));
        self.status.apply_account(demo_account());

        let mut rng = StdRng::from_entropy();
        let mut prices: Vec<f64> = DEMO_SYMBOLS.iter().map(|d| d.base_price).collect();
        let mut timer = tokio::time::interval(self.config.synthetic_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            timer.tick().await;
            if cancelled.load(Ordering::SeqCst) || !self.status.is_alive() {
                break;
            }

            let now = now_millis();
            let drift = ((now as f64 / 1000.0) / 60.0).sin() * 0.3;
            for (demo, price) in DEMO_SYMBOLS.iter().zip(prices.iter_mut()) {
                let noise = (rng.gen::<f64>() - 0.5) * 2.0;
                *price = next_price(*price, demo.volatility, drift, noise);
                let tick = Tick {
                    symbol: demo.symbol.to_string(),
                    time: now,
                    bid: *price - demo.spread / 2.0,
                    ask: *price + demo.spread / 2.0,
                    last: *price,
                    volume: rng.gen_range(100..1000),
                    flags: 0,
                };
                self.status.publish(Event::Tick(tick));
            }
        }
        info!("synthetic generator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SymbolCategory;

    #[test]
    fn test_demo_instruments_are_well_formed() {
        let instruments = demo_instruments();
        assert_eq!(instruments.len(), 5);

        let eurusd = &instruments[0];
        assert_eq!(eurusd.symbol, "EURUSD");
        assert_eq!(eurusd.category, SymbolCategory::Major);
        assert!((eurusd.point_size - 0.00001).abs() < 1e-12);

        let gold = instruments.iter().find(|i| i.symbol == "XAUUSD").unwrap();
        assert_eq!(gold.category, SymbolCategory::Commodities);
        let btc = instruments.iter().find(|i| i.symbol == "BTCUSD").unwrap();
        assert_eq!(btc.category, SymbolCategory::Crypto);
    }

    #[test]
    fn test_next_price_stays_positive_and_floored() {
        let mut price = 1.0850;
        for i in 0..1000 {
            // Worst-case downward noise every step.
            let next = next_price(price, 0.0001, -0.3, -1.0);
            assert!(next >= price * 0.95, "step {}: fell through the floor", i);
            assert!(next > 0.0);
            price = next;
        }
    }

    #[test]
    fn test_next_price_moves_with_drift() {
        let up = next_price(100.0, 0.01, 0.3, 0.5);
        assert!(up > 100.0);
        let down = next_price(100.0, 0.01, -0.3, -0.5);
        assert!(down < 100.0);
    }
}
