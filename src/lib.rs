// Library crate - exports the ingestion pipeline and signal engine

pub mod config;
pub mod dispatch;
pub mod normalize;
pub mod signal;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{PipelineConfig, SuperTrendConfig};
pub use dispatch::Dispatcher;
pub use signal::SignalEngine;
pub use transport::TransportManager;
pub use types::*;
