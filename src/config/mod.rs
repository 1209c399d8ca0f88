//! Configuration module for the density scanner
//!
//! Process knobs come from environment variables (optionally a `.env` file).
//! Detection thresholds live in a separate override hierarchy, see [`resolver`].

mod resolver;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScannerError};
use crate::feed::{ConnectionSettings, ReconnectPolicy};
use crate::model::{MarketType, Venue};
use crate::pipeline::PipelineSettings;

pub use resolver::{
    ConfigResolver, DetectionOverrides, DetectionSettings, EffectiveConfig, GlobalDetection,
    VenueOverrides,
};

#[cfg(test)]
pub use resolver::MockConfigResolver;

/// One (venue, market) feed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedSpec {
    pub venue: Venue,
    pub market: MarketType,
}

impl FromStr for FeedSpec {
    type Err = ScannerError;

    /// Parses `venue:market`, e.g. `binance:futures`
    fn from_str(s: &str) -> Result<Self> {
        let (venue, market) = s
            .split_once(':')
            .ok_or_else(|| ScannerError::Config(format!("expected venue:market, got {s:?}")))?;
        let venue = Venue::parse(venue)
            .ok_or_else(|| ScannerError::Config(format!("unknown venue {venue:?}")))?;
        let market = MarketType::parse(market)
            .ok_or_else(|| ScannerError::Config(format!("unknown market type {market:?}")))?;
        Ok(Self { venue, market })
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Feeds to connect (e.g. `binance:futures,binance:spot`)
    pub feeds: Vec<FeedSpec>,

    /// Symbols to subscribe to; empty means every instrument the venue lists
    pub symbols: Vec<String>,

    /// Optional detection override file (TOML, YAML or JSON)
    pub detection_config_path: Option<PathBuf>,

    /// Unix socket for alert publishing; alerts are only logged when unset
    pub ipc_socket_path: Option<String>,

    pub health_port: u16,

    /// Reconnection settings
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub subscribe_batch_delay_ms: u64,

    /// Capacity of the book update and alert channels
    pub event_buffer: usize,

    /// Levels further than this from the reference price are discarded
    pub max_distance_percent: Decimal,

    /// Minimum notional for a level to be tracked as a density
    pub density_floor: Decimal,

    /// Back-fill rolling volume from venue klines on subscribe
    pub seed_volume: bool,

    pub status_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let feeds = match env::var("FEEDS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(FeedSpec::from_str)
                .collect::<Result<Vec<_>>>()?,
            Err(_) => defaults.feeds.clone(),
        };
        if feeds.is_empty() {
            return Err(ScannerError::Config("FEEDS lists no feeds".to_string()));
        }

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            feeds,
            symbols,
            detection_config_path: env::var("DETECTION_CONFIG").ok().map(PathBuf::from),
            ipc_socket_path: env::var("IPC_SOCKET_PATH").ok().filter(|p| !p.is_empty()),
            health_port: env_or("HEALTH_PORT", defaults.health_port),
            reconnect_initial_delay_ms: env_or(
                "RECONNECT_INITIAL_DELAY_MS",
                defaults.reconnect_initial_delay_ms,
            ),
            reconnect_max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", defaults.reconnect_max_delay_ms),
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            connect_timeout_secs: env_or("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            subscribe_batch_delay_ms: env_or(
                "SUBSCRIBE_BATCH_DELAY_MS",
                defaults.subscribe_batch_delay_ms,
            ),
            event_buffer: env_or("EVENT_BUFFER", defaults.event_buffer),
            max_distance_percent: env_or("MAX_DISTANCE_PERCENT", defaults.max_distance_percent),
            density_floor: env_or("DENSITY_FLOOR", defaults.density_floor),
            seed_volume: env_or("SEED_VOLUME", defaults.seed_volume),
            status_interval_secs: env_or("STATUS_INTERVAL_SECS", defaults.status_interval_secs),
            shutdown_grace_secs: env_or("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_initial_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            reconnect: self.reconnect_policy(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            subscribe_batch_delay: Duration::from_millis(self.subscribe_batch_delay_ms),
            ..ConnectionSettings::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let mut settings = PipelineSettings {
            max_distance_percent: self.max_distance_percent,
            event_buffer: self.event_buffer,
            ..PipelineSettings::default()
        };
        settings.density.tracking_floor = self.density_floor;
        settings.detector.alert_buffer = self.event_buffer;
        settings
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feeds: vec![FeedSpec {
                venue: Venue::Binance,
                market: MarketType::Futures,
            }],
            symbols: Vec::new(),
            detection_config_path: None,
            ipc_socket_path: None,
            health_port: 9090,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
            max_reconnect_attempts: 10,
            connect_timeout_secs: 5,
            subscribe_batch_delay_ms: 100,
            event_buffer: 4096,
            max_distance_percent: Decimal::TEN,
            density_floor: Decimal::from(50_000),
            seed_volume: true,
            status_interval_secs: 60,
            shutdown_grace_secs: 10,
        }
    }
}
