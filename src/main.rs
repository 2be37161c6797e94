use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use supertrend_feed::config::{PipelineConfig, SuperTrendConfig};
use supertrend_feed::dispatch::Dispatcher;
use supertrend_feed::signal::SignalEngine;
use supertrend_feed::transport::TransportManager;
use supertrend_feed::types::{Event, EventKind, TransportKind};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Terminal WebSocket bridge URL
    #[arg(long, env = "TERMINAL_WS_URL", default_value = "ws://localhost:8765")]
    socket_url: String,

    /// Terminal file server base URL
    #[arg(long, env = "TERMINAL_FILES_URL", default_value = "http://localhost:3001")]
    files_url: String,

    /// Preferred transport to start on
    #[arg(long, value_enum, default_value = "socket")]
    transport: TransportKind,

    /// Instrument to track
    #[arg(short, long, default_value = "EURUSD")]
    symbol: String,

    /// Poll period for the file transport, in seconds
    #[arg(long, default_value = "2")]
    poll_interval: u64,

    /// Socket heartbeat period, in seconds
    #[arg(long, default_value = "30")]
    heartbeat_interval: u64,

    /// ATR lookback in bars
    #[arg(long, default_value = "20")]
    atr_period: usize,

    /// Band width in ATR multiples
    #[arg(long, default_value = "2.0")]
    multiplier: f64,

    /// RSI lookback in bars
    #[arg(long, default_value = "14")]
    rsi_period: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("supertrend_feed=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Starting SuperTrend feed pipeline");
    info!("Socket: {}", args.socket_url);
    info!("File server: {}", args.files_url);
    info!("Instrument: {}", args.symbol);

    let config = Arc::new(PipelineConfig {
        socket_url: args.socket_url,
        file_server_url: args.files_url,
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(5)),
        supertrend: SuperTrendConfig {
            atr_period: args.atr_period,
            multiplier: args.multiplier,
            rsi_period: args.rsi_period,
            ..Default::default()
        }
        .clamped(),
        ..Default::default()
    });

    let dispatcher = Arc::new(Dispatcher::new());
    let engine = Arc::new(SignalEngine::new(
        config.clone(),
        dispatcher.clone(),
        &args.symbol,
    ));
    SignalEngine::attach(&engine);

    // Stand-ins for the display layer: log what it would render.
    dispatcher.subscribe(EventKind::Connection, |event| {
        if let Event::Connection(state) = event {
            info!(
                connected = state.is_connected,
                transport = %state.transport,
                detail = state.detail.as_deref().unwrap_or(""),
                "connection update"
            );
        }
    });
    dispatcher.subscribe(EventKind::Signal, |event| {
        if let Event::Signal(update) = event {
            if let Some(trade) = &update.trade {
                info!(
                    symbol = %trade.symbol,
                    kind = ?trade.kind,
                    price = trade.price,
                    strong = trade.strong,
                    "trade signal"
                );
            }
        }
    });

    let manager = TransportManager::new(config, dispatcher, engine);
    manager.start(args.transport);
    manager.subscribe_instrument(&args.symbol);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.stop();

    Ok(())
}
