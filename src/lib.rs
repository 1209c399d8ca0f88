//! Density Scanner - multi-venue order book density tracking
//!
//! This crate keeps live WebSocket feeds to crypto venues, maintains a
//! filtered order book per instrument, tracks large resting levels
//! ("densities") and raises anomaly alerts for unusually large ones.

use std::sync::Arc;

pub mod config;
pub mod density;
pub mod detector;
pub mod error;
pub mod feed;
pub mod maintenance;
pub mod model;
pub mod orderbook;
pub mod pipeline;
pub mod publisher;
pub mod telemetry;
pub mod volume;

pub use config::{Config, ConfigResolver, DetectionSettings, EffectiveConfig};
pub use density::{DensityQuery, DensitySort, DensityTracker, TrackedDensity};
pub use detector::AnomalyDetector;
pub use error::{Result, ScannerError};
pub use feed::{BinanceAdapter, FeedConnection, FeedSupervisor, VenueAdapter};
pub use model::{Alert, DetectionMethod, InstrumentKey, MarketType, PriceLevel, Side, TradeTick, Venue};
pub use orderbook::{BookUpdate, OrderBookSnapshot, OrderBookStore};
pub use pipeline::{Pipeline, PipelineSettings};
pub use publisher::AlertPublisher;
pub use volume::VolumeAggregator;

/// Application state shared across components
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub supervisor: Arc<FeedSupervisor>,
    pub config: Arc<Config>,
}
