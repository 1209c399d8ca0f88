//! Order book store
//!
//! Holds the latest filtered snapshot per instrument and fans every accepted
//! update out to subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::book::{filter_by_distance, mid_price, normalize_side, OrderBookSnapshot};
use crate::model::{InstrumentKey, PriceLevel, Side};

/// Book update event shared by every subscriber
pub type BookUpdate = Arc<OrderBookSnapshot>;

/// Default maximum distance from the reference price, in percent
pub const DEFAULT_MAX_DISTANCE_PERCENT: Decimal = Decimal::TEN;

/// Maintains the latest normalized book per instrument
#[derive(Debug)]
pub struct OrderBookStore {
    books: DashMap<InstrumentKey, BookUpdate>,
    last_prices: DashMap<InstrumentKey, Decimal>,
    max_distance_percent: Decimal,
    updates: broadcast::Sender<BookUpdate>,
}

impl OrderBookStore {
    /// Create a store publishing on a broadcast channel of `capacity`
    pub fn new(max_distance_percent: Decimal, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            books: DashMap::new(),
            last_prices: DashMap::new(),
            max_distance_percent,
            updates,
        }
    }

    /// Register a new consumer of book updates
    pub fn subscribe(&self) -> broadcast::Receiver<BookUpdate> {
        self.updates.subscribe()
    }

    /// Replace the book for `instrument` and publish the filtered snapshot
    pub fn update(
        &self,
        instrument: InstrumentKey,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        last_price: Option<Decimal>,
    ) -> BookUpdate {
        self.update_at(instrument, bids, asks, last_price, Utc::now())
    }

    pub fn update_at(
        &self,
        instrument: InstrumentKey,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        last_price: Option<Decimal>,
        observed_at: DateTime<Utc>,
    ) -> BookUpdate {
        let bids = normalize_side(bids, Side::Bid);
        let asks = normalize_side(asks, Side::Ask);

        if let Some(price) = last_price {
            self.last_prices.insert(instrument.clone(), price);
        }

        let reference = self
            .last_prices
            .get(&instrument)
            .map(|p| *p.value())
            .or_else(|| mid_price(&bids, &asks))
            .unwrap_or(Decimal::ZERO);

        let bids = filter_by_distance(bids, reference, self.max_distance_percent);
        let asks = filter_by_distance(asks, reference, self.max_distance_percent);

        let snapshot = Arc::new(OrderBookSnapshot::new(
            instrument.clone(),
            bids,
            asks,
            reference,
            observed_at,
        ));

        if self.books.insert(instrument, snapshot.clone()).is_none() {
            info!(
                venue = %snapshot.instrument.venue,
                market = %snapshot.instrument.market,
                symbol = %snapshot.instrument.symbol,
                "First order book received"
            );
        }

        // No receivers is not an error, the store is still the source of truth
        if self.updates.send(snapshot.clone()).is_err() {
            debug!(instrument = %snapshot.instrument, "No book update subscribers");
        }

        snapshot
    }

    /// Record a trade price without a book message
    pub fn update_last_price(&self, instrument: &InstrumentKey, price: Decimal) {
        self.last_prices.insert(instrument.clone(), price);
    }

    pub fn last_price(&self, instrument: &InstrumentKey) -> Option<Decimal> {
        self.last_prices.get(instrument).map(|p| *p.value())
    }

    /// Get the latest snapshot for an instrument
    pub fn snapshot(&self, instrument: &InstrumentKey) -> Option<BookUpdate> {
        self.books.get(instrument).map(|b| b.value().clone())
    }

    /// Get list of instruments with a book
    pub fn instruments(&self) -> Vec<InstrumentKey> {
        self.books.iter().map(|e| e.key().clone()).collect()
    }

    pub fn book_count(&self) -> usize {
        self.books.len()
    }

    pub fn max_distance_percent(&self) -> Decimal {
        self.max_distance_percent
    }
}
