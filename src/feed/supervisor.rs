//! Owns every feed connection of the process
//!
//! Builds one connection per enabled (venue, market), bootstraps each one
//! concurrently (symbol universe, volume seeding, bulk subscribe), logs a
//! periodic status table and tears everything down within a grace period.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::binance::BinanceAdapter;
use super::connection::{ConnectionStatus, FeedConnection, FeedSink};
use super::rest::RestClient;
use super::venue::VenueAdapter;
use crate::config::{Config, ConfigResolver, FeedSpec};
use crate::error::{Result, ScannerError};
use crate::maintenance::PeriodicTask;
use crate::model::{InstrumentKey, MarketType, Venue};
use crate::volume::VolumeAggregator;

/// Concurrent REST calls while seeding rolling volume
const SEED_CONCURRENCY: usize = 8;

/// Maps a feed to its venue adapter; `None` for venues without one
pub type AdapterFactory = fn(FeedSpec) -> Option<Arc<dyn VenueAdapter>>;

pub fn default_adapter(spec: FeedSpec) -> Option<Arc<dyn VenueAdapter>> {
    match spec.venue {
        Venue::Binance => Some(Arc::new(BinanceAdapter::new(spec.market))),
        _ => None,
    }
}

#[derive(Debug)]
pub struct FeedSupervisor {
    connections: Vec<Arc<FeedConnection>>,
    volume: Arc<VolumeAggregator>,
    rest: RestClient,
    /// Fixed symbol list; empty means ask each venue
    symbols: Vec<String>,
    seed_volume: bool,
    bootstraps: Mutex<Vec<JoinHandle<()>>>,
    status_task: Mutex<Option<PeriodicTask>>,
}

impl FeedSupervisor {
    pub fn new(
        connections: Vec<Arc<FeedConnection>>,
        volume: Arc<VolumeAggregator>,
        rest: RestClient,
        symbols: Vec<String>,
        seed_volume: bool,
    ) -> Self {
        Self {
            connections,
            volume,
            rest,
            symbols,
            seed_volume,
            bootstraps: Mutex::new(Vec::new()),
            status_task: Mutex::new(None),
        }
    }

    /// One connection per configured feed the resolver leaves enabled
    pub fn from_config(
        config: &Config,
        resolver: &dyn ConfigResolver,
        sink: FeedSink,
        volume: Arc<VolumeAggregator>,
        factory: AdapterFactory,
    ) -> Result<Self> {
        let mut connections = Vec::new();
        for spec in &config.feeds {
            if !resolver.is_market_enabled(spec.venue, spec.market) {
                info!(venue = %spec.venue, market = %spec.market, "Market disabled, skipping feed");
                continue;
            }
            match factory(*spec) {
                Some(adapter) => connections.push(FeedConnection::new(
                    adapter,
                    sink.clone(),
                    config.connection_settings(),
                )),
                None => warn!(venue = %spec.venue, market = %spec.market, "No adapter for venue, skipping feed"),
            }
        }

        let rest = RestClient::new(
            super::rest::DEFAULT_ATTEMPTS,
            super::rest::DEFAULT_RETRY_DELAY,
            Duration::from_secs(10),
        )?;
        Ok(Self::new(
            connections,
            volume,
            rest,
            config.symbols.clone(),
            config.seed_volume,
        ))
    }

    pub fn connections(&self) -> &[Arc<FeedConnection>] {
        &self.connections
    }

    pub fn connection(&self, venue: Venue, market: MarketType) -> Option<&Arc<FeedConnection>> {
        self.connections
            .iter()
            .find(|c| c.venue() == venue && c.market() == market)
    }

    /// Bootstrap every connection and start the status ticker
    pub fn start(self: &Arc<Self>, status_interval: Duration) {
        let universe = if self.symbols.is_empty() {
            "venue listing".to_string()
        } else {
            self.symbols.len().to_string()
        };
        info!(
            feeds = self.connections.len(),
            symbols = %universe,
            seed_volume = self.seed_volume,
            "Starting feed connections"
        );
        for conn in &self.connections {
            info!(feed = %conn.label(), url = %conn.adapter().websocket_url(), "Feed configured");
        }

        let handles: Vec<JoinHandle<()>> = self
            .connections
            .iter()
            .map(|conn| {
                let this = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move { this.bootstrap(conn).await })
            })
            .collect();
        self.bootstraps.lock().extend(handles);

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("feed-status", status_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(supervisor) => {
                        supervisor.log_status();
                        true
                    }
                    None => false,
                }
            }
        });
        *self.status_task.lock() = Some(task);
    }

    async fn bootstrap(&self, conn: Arc<FeedConnection>) {
        let symbols = if self.symbols.is_empty() {
            self.fetch_instruments(&conn).await
        } else {
            self.symbols.clone()
        };
        if symbols.is_empty() {
            warn!(feed = %conn.label(), "No symbols to subscribe");
            return;
        }

        if self.seed_volume {
            self.seed_volumes(&conn, &symbols).await;
        }
        conn.subscribe_all(symbols).await;
    }

    async fn fetch_instruments(&self, conn: &FeedConnection) -> Vec<String> {
        let adapter = conn.adapter();
        let Some(url) = adapter.instruments_url() else {
            warn!(feed = %conn.label(), "Venue has no instrument listing and no symbols are configured");
            return Vec::new();
        };
        match self.rest.get_json(&url).await {
            Ok(body) => match adapter.parse_instruments(&body) {
                Ok(symbols) => {
                    info!(feed = %conn.label(), count = symbols.len(), "Fetched tradable symbols");
                    symbols
                }
                Err(e) => {
                    error!(feed = %conn.label(), error = %e, "Failed to parse instrument list");
                    Vec::new()
                }
            },
            Err(e) => {
                error!(feed = %conn.label(), error = %e, "Failed to fetch symbols after retries");
                Vec::new()
            }
        }
    }

    async fn seed_volumes(&self, conn: &FeedConnection, symbols: &[String]) {
        let adapter = conn.adapter();
        let seeded = stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                let Some(url) = adapter.volume_seed_url(&symbol) else {
                    return None;
                };
                let body = match self.rest.get_json(&url).await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(feed = %conn.label(), symbol = %symbol, error = %e, "Volume seed request failed");
                        return None;
                    }
                };
                match adapter.parse_volume_seed(&body) {
                    Ok(total) => {
                        let key = InstrumentKey::new(conn.venue(), conn.market(), &symbol);
                        self.volume.seed_volume(&key, total);
                        Some(())
                    }
                    Err(e) => {
                        warn!(feed = %conn.label(), symbol = %symbol, error = %e, "Invalid volume seed response");
                        None
                    }
                }
            })
            .buffer_unordered(SEED_CONCURRENCY)
            .filter_map(|seeded| async move { seeded })
            .count()
            .await;
        info!(feed = %conn.label(), seeded, requested = symbols.len(), "Rolling volume seeded");
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.connections.iter().map(|c| c.status()).collect()
    }

    pub fn total_subscribed(&self) -> usize {
        self.connections
            .iter()
            .map(|c| c.subscribed_symbols().len())
            .sum()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    pub fn log_status(&self) {
        info!(
            connected = self.connected_count(),
            feeds = self.connections.len(),
            subscribed = self.total_subscribed(),
            "Feed status"
        );
        for conn in &self.connections {
            let summary = conn.status_summary();
            if conn.is_connected() {
                info!("{summary}");
            } else if conn.is_exhausted() {
                error!("{summary}");
            } else {
                warn!("{summary}");
            }
        }
    }

    /// Operator restart of one exhausted or misbehaving feed
    pub async fn restart(&self, venue: Venue, market: MarketType) -> Result<()> {
        let conn = self.connection(venue, market).ok_or_else(|| {
            ScannerError::Config(format!("no feed for {venue}:{market}"))
        })?;
        conn.restart().await
    }

    /// Disconnect every feed concurrently, bounded by `grace`
    pub async fn shutdown(&self, grace: Duration) {
        if let Some(task) = self.status_task.lock().take() {
            task.stop();
        }

        let disconnects = join_all(self.connections.iter().map(|c| c.disconnect()));
        if timeout(grace, disconnects).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Feeds did not disconnect within grace period");
        }

        for handle in self.bootstraps.lock().drain(..) {
            handle.abort();
        }
        info!("Feed supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionSettings;
    use crate::config::{DetectionOverrides, VenueOverrides};
    use crate::orderbook::{OrderBookStore, DEFAULT_MAX_DISTANCE_PERCENT};

    fn sink(volume: &Arc<VolumeAggregator>) -> FeedSink {
        FeedSink::new(
            Arc::new(OrderBookStore::new(DEFAULT_MAX_DISTANCE_PERCENT, 16)),
            volume.clone(),
        )
    }

    #[test]
    fn test_builds_only_enabled_feeds_with_adapters() {
        let config = Config {
            feeds: vec![
                "binance:futures".parse().unwrap(),
                "binance:spot".parse().unwrap(),
                "okx:futures".parse().unwrap(),
            ],
            ..Config::default()
        };
        let mut settings = DetectionSettings::default();
        settings.venues.insert(
            "binance".into(),
            VenueOverrides {
                spot: DetectionOverrides {
                    enabled: Some(false),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let volume = Arc::new(VolumeAggregator::default());

        let supervisor =
            FeedSupervisor::from_config(&config, &settings, sink(&volume), volume, default_adapter).unwrap();

        assert_eq!(supervisor.connections().len(), 1);
        assert!(supervisor.connection(Venue::Binance, MarketType::Futures).is_some());
        assert_eq!(supervisor.connected_count(), 0);
        assert_eq!(supervisor.total_subscribed(), 0);
    }

    #[tokio::test]
    async fn test_restart_of_unknown_feed_is_an_error() {
        let volume = Arc::new(VolumeAggregator::default());
        let supervisor = FeedSupervisor::new(Vec::new(), volume, RestClient::default(), Vec::new(), false);
        tokio_test::assert_err!(supervisor.restart(Venue::Gate, MarketType::Spot).await);
        supervisor.shutdown(Duration::from_millis(100)).await;
    }
}
