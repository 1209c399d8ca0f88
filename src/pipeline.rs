//! Analytics pipeline
//!
//! Owns the order book store, the rolling volume aggregator, the density
//! tracker and the anomaly detector. The tracker and the detector each
//! consume the store's book update broadcast on their own task.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ConfigResolver;
use crate::density::{DensityQuery, DensitySettings, DensityTracker, TrackedDensity};
use crate::detector::{AnomalyDetector, DetectorSettings};
use crate::feed::FeedSink;
use crate::model::{Alert, InstrumentKey};
use crate::orderbook::{BookUpdate, OrderBookStore, DEFAULT_MAX_DISTANCE_PERCENT};
use crate::volume::{VolumeAggregator, VolumeSettings};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Store-level distance filter, in percent of the reference price
    pub max_distance_percent: Decimal,
    /// Book update broadcast capacity
    pub event_buffer: usize,
    pub density: DensitySettings,
    pub volume: VolumeSettings,
    pub detector: DetectorSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_distance_percent: DEFAULT_MAX_DISTANCE_PERCENT,
            event_buffer: 4096,
            density: DensitySettings::default(),
            volume: VolumeSettings::default(),
            detector: DetectorSettings::default(),
        }
    }
}

#[derive(Debug)]
pub struct Pipeline {
    store: Arc<OrderBookStore>,
    volume: Arc<VolumeAggregator>,
    densities: Arc<DensityTracker>,
    detector: Arc<AnomalyDetector>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, resolver: Arc<dyn ConfigResolver>) -> Self {
        let store = Arc::new(OrderBookStore::new(
            settings.max_distance_percent,
            settings.event_buffer,
        ));
        let volume = Arc::new(VolumeAggregator::new(settings.volume));
        let densities = Arc::new(DensityTracker::new(settings.density));
        let detector = Arc::new(AnomalyDetector::new(
            resolver,
            volume.clone(),
            settings.detector,
        ));
        Self {
            store,
            volume,
            densities,
            detector,
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the book update consumers and the maintenance tickers
    pub fn start(&self) {
        let mut consumers = self.consumers.lock();
        if !consumers.is_empty() {
            return;
        }

        // Subscribe before returning so no update published after start is missed
        let density_rx = self.store.subscribe();
        let detector_rx = self.store.subscribe();
        consumers.push(tokio::spawn(self.densities.clone().run(density_rx)));
        consumers.push(tokio::spawn(self.detector.clone().run(detector_rx)));

        self.volume.start_maintenance();
        self.densities.start_maintenance();
        self.detector.start_maintenance();
        info!("Analytics pipeline started");
    }

    pub fn shutdown(&self) {
        for handle in self.consumers.lock().drain(..) {
            handle.abort();
        }
        self.volume.stop_maintenance();
        self.densities.stop_maintenance();
        self.detector.stop_maintenance();
        info!(
            books = self.store.book_count(),
            densities = self.densities.count(),
            "Analytics pipeline stopped"
        );
    }

    /// Sink for feed connections writing into this pipeline
    pub fn feed_sink(&self) -> FeedSink {
        FeedSink::new(self.store.clone(), self.volume.clone())
    }

    pub fn densities(&self, query: &DensityQuery) -> Vec<TrackedDensity> {
        self.densities.query(query)
    }

    pub fn density_count(&self) -> usize {
        self.densities.count()
    }

    pub fn latest_snapshot(&self, instrument: &InstrumentKey) -> Option<BookUpdate> {
        self.store.snapshot(instrument)
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.detector.subscribe()
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        &self.store
    }

    pub fn volume(&self) -> &Arc<VolumeAggregator> {
        &self.volume
    }

    pub fn tracker(&self) -> &Arc<DensityTracker> {
        &self.densities
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }
}
