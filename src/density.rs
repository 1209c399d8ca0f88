//! Live density tracking
//!
//! A density is a resting level whose notional is at or above the tracking
//! floor. Densities are keyed by (instrument, side, price): a change of
//! quantity at the same price refreshes the record and keeps `first_seen_at`,
//! a price that disappears from the next snapshot removes it.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::maintenance::PeriodicTask;
use crate::model::{InstrumentKey, PriceLevel, Side};
use crate::orderbook::{distance_percent, BookUpdate, OrderBookSnapshot};
use crate::telemetry;

/// A level currently carrying notional above the tracking floor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedDensity {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    /// Absolute distance from the reference price, in percent
    pub distance_percent: Decimal,
    pub reference_price: Decimal,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl TrackedDensity {
    /// How long the level has persisted at this price
    pub fn duration_secs(&self) -> i64 {
        (self.last_seen_at - self.first_seen_at).num_seconds()
    }

    pub fn key(&self) -> DensityKey {
        DensityKey {
            instrument: self.instrument.clone(),
            side: self.side,
            price: self.price,
        }
    }
}

/// Identity of a tracked density
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DensityKey {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct DensitySettings {
    /// Minimum notional for a level to be tracked
    pub tracking_floor: Decimal,
    /// Records not refreshed within this window are swept
    pub stale_after: TimeDelta,
    pub sweep_interval: Duration,
}

impl Default for DensitySettings {
    fn default() -> Self {
        Self {
            tracking_floor: Decimal::from(50_000),
            stale_after: TimeDelta::minutes(2),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Sort order for density queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DensitySort {
    #[default]
    NotionalDesc,
    DurationDesc,
    DistanceAsc,
}

/// Read-only filter over the tracked set
#[derive(Debug, Clone, Default)]
pub struct DensityQuery {
    pub instruments: Option<HashSet<InstrumentKey>>,
    pub min_notional: Option<Decimal>,
    pub sort: DensitySort,
    pub limit: Option<usize>,
}

/// Maintains the set of live densities per instrument and side
#[derive(Debug)]
pub struct DensityTracker {
    densities: DashMap<DensityKey, TrackedDensity>,
    /// (side, price) pairs seen in the last snapshot of each instrument
    by_instrument: DashMap<InstrumentKey, HashSet<(Side, Decimal)>>,
    settings: DensitySettings,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl DensityTracker {
    pub fn new(settings: DensitySettings) -> Self {
        Self {
            densities: DashMap::new(),
            by_instrument: DashMap::new(),
            settings,
            sweeper: Mutex::new(None),
        }
    }

    /// Upsert every level above the floor, then drop levels absent from `snapshot`
    pub fn on_book_update(&self, snapshot: &OrderBookSnapshot) {
        let now = snapshot.observed_at;
        let mut current: HashSet<(Side, Decimal)> = HashSet::new();

        for (side, level) in snapshot.levels() {
            let notional = level.notional();
            if notional < self.settings.tracking_floor {
                continue;
            }
            current.insert((side, level.price));
            self.upsert(snapshot, side, level, notional, now);
        }

        let vanished: Vec<(Side, Decimal)> = match self.by_instrument.entry(snapshot.instrument.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = std::mem::replace(entry.get_mut(), current);
                previous
                    .into_iter()
                    .filter(|key| !entry.get().contains(key))
                    .collect()
            }
            Entry::Vacant(entry) => {
                entry.insert(current);
                Vec::new()
            }
        };

        for (side, price) in vanished {
            self.densities.remove(&DensityKey {
                instrument: snapshot.instrument.clone(),
                side,
                price,
            });
        }
    }

    fn upsert(
        &self,
        snapshot: &OrderBookSnapshot,
        side: Side,
        level: &PriceLevel,
        notional: Decimal,
        now: DateTime<Utc>,
    ) {
        let reference = snapshot.reference_price;
        let distance = distance_percent(level.price, reference).abs().round_dp(4);
        let key = DensityKey {
            instrument: snapshot.instrument.clone(),
            side,
            price: level.price,
        };

        self.densities
            .entry(key)
            .and_modify(|existing| {
                existing.quantity = level.quantity;
                existing.notional = notional;
                existing.distance_percent = distance;
                existing.reference_price = reference;
                existing.last_seen_at = now;
            })
            .or_insert_with(|| TrackedDensity {
                instrument: snapshot.instrument.clone(),
                side,
                price: level.price,
                quantity: level.quantity,
                notional,
                distance_percent: distance,
                reference_price: reference,
                first_seen_at: now,
                last_seen_at: now,
            });
    }

    /// Remove densities not refreshed within the staleness window
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Utc::now())
    }

    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.settings.stale_after;
        let before = self.densities.len();
        self.densities.retain(|_, d| d.last_seen_at >= cutoff);
        let removed = before.saturating_sub(self.densities.len());

        if removed > 0 {
            self.by_instrument.retain(|instrument, keys| {
                keys.retain(|(side, price)| {
                    self.densities.contains_key(&DensityKey {
                        instrument: instrument.clone(),
                        side: *side,
                        price: *price,
                    })
                });
                !keys.is_empty()
            });
            debug!(removed, "Cleaned up stale tracked densities");
        }

        telemetry::metrics().tracked_densities.set(self.densities.len() as i64);
        removed
    }

    /// Snapshot of every tracked density
    pub fn densities(&self) -> Vec<TrackedDensity> {
        self.densities.iter().map(|e| e.value().clone()).collect()
    }

    pub fn densities_for(&self, instrument: &InstrumentKey) -> Vec<TrackedDensity> {
        self.densities
            .iter()
            .filter(|e| &e.key().instrument == instrument)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get(&self, key: &DensityKey) -> Option<TrackedDensity> {
        self.densities.get(key).map(|d| d.value().clone())
    }

    /// Filtered, sorted view of the tracked set
    pub fn query(&self, query: &DensityQuery) -> Vec<TrackedDensity> {
        let mut result: Vec<TrackedDensity> = self
            .densities
            .iter()
            .filter(|e| {
                query
                    .instruments
                    .as_ref()
                    .map_or(true, |set| set.contains(&e.key().instrument))
            })
            .filter(|e| query.min_notional.map_or(true, |min| e.value().notional >= min))
            .map(|e| e.value().clone())
            .collect();

        match query.sort {
            DensitySort::NotionalDesc => result.sort_by(|a, b| b.notional.cmp(&a.notional)),
            DensitySort::DurationDesc => {
                result.sort_by_key(|d| std::cmp::Reverse(d.duration_secs()))
            }
            DensitySort::DistanceAsc => {
                result.sort_by(|a, b| a.distance_percent.cmp(&b.distance_percent))
            }
        }
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        result
    }

    pub fn count(&self) -> usize {
        self.densities.len()
    }

    /// Tracked density count per instrument
    pub fn counts_by_instrument(&self) -> HashMap<InstrumentKey, usize> {
        let mut counts = HashMap::new();
        for entry in self.densities.iter() {
            match counts.entry(entry.key().instrument.clone()) {
                MapEntry::Occupied(mut e) => *e.get_mut() += 1,
                MapEntry::Vacant(e) => {
                    e.insert(1);
                }
            }
        }
        counts
    }

    /// Consume book updates until the channel closes
    pub async fn run(self: Arc<Self>, mut updates: broadcast::Receiver<BookUpdate>) {
        info!("Density tracker started");
        loop {
            match updates.recv().await {
                Ok(snapshot) => self.on_book_update(&snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    telemetry::metrics()
                        .lagged_updates
                        .with_label_values(&["density_tracker"])
                        .inc_by(skipped);
                    warn!(skipped, "Density tracker lagging, skipped stale book updates");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Book update channel closed, density tracker stopping");
                    break;
                }
            }
        }
    }

    /// Start the staleness sweep; it stops when the tracker is dropped
    pub fn start_maintenance(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("density-sweep", self.settings.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(tracker) => {
                        tracker.sweep_stale();
                        true
                    }
                    None => false,
                }
            }
        });
        *self.sweeper.lock() = Some(task);
    }

    pub fn stop_maintenance(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.stop();
        }
    }
}

impl Default for DensityTracker {
    fn default() -> Self {
        Self::new(DensitySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarketType, Venue};
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::new(Venue::Bybit, MarketType::Futures, "SOLUSDT")
    }

    fn snapshot(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, at: DateTime<Utc>) -> OrderBookSnapshot {
        OrderBookSnapshot::new(key(), bids, asks, dec!(100), at)
    }

    fn lvl(price: Decimal, qty: Decimal) -> PriceLevel {
        PriceLevel::new(price, qty)
    }

    fn density_key(side: Side, price: Decimal) -> DensityKey {
        DensityKey {
            instrument: key(),
            side,
            price,
        }
    }

    #[test]
    fn test_level_below_floor_is_not_tracked() {
        let tracker = DensityTracker::default();
        tracker.on_book_update(&snapshot(vec![lvl(dec!(99), dec!(100))], vec![], Utc::now()));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_vanished_level_is_removed_on_next_snapshot() {
        let tracker = DensityTracker::default();
        let t0 = Utc::now();
        // 100 * 600 = 60,000 >= 50,000 floor
        tracker.on_book_update(&snapshot(vec![lvl(dec!(100), dec!(600))], vec![], t0));
        assert!(tracker.get(&density_key(Side::Bid, dec!(100))).is_some());

        tracker.on_book_update(&snapshot(vec![lvl(dec!(99), dec!(1))], vec![], t0 + TimeDelta::seconds(1)));
        assert!(tracker.get(&density_key(Side::Bid, dec!(100))).is_none());
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_first_seen_survives_quantity_changes() {
        let tracker = DensityTracker::default();
        let t0 = Utc::now();
        let t1 = t0 + TimeDelta::seconds(30);
        tracker.on_book_update(&snapshot(vec![], vec![lvl(dec!(101), dec!(600))], t0));
        tracker.on_book_update(&snapshot(vec![], vec![lvl(dec!(101), dec!(900))], t1));

        let density = tracker.get(&density_key(Side::Ask, dec!(101))).unwrap();
        assert_eq!(density.first_seen_at, t0);
        assert_eq!(density.last_seen_at, t1);
        assert_eq!(density.quantity, dec!(900));
        assert_eq!(density.notional, dec!(90900));
        assert_eq!(density.duration_secs(), 30);
        assert_eq!(density.distance_percent, dec!(1));
    }

    #[test]
    fn test_first_seen_resets_after_remove_and_recreate() {
        let tracker = DensityTracker::default();
        let t0 = Utc::now();
        let t2 = t0 + TimeDelta::seconds(2);
        tracker.on_book_update(&snapshot(vec![lvl(dec!(100), dec!(600))], vec![], t0));
        tracker.on_book_update(&snapshot(vec![], vec![], t0 + TimeDelta::seconds(1)));
        tracker.on_book_update(&snapshot(vec![lvl(dec!(100), dec!(600))], vec![], t2));

        let density = tracker.get(&density_key(Side::Bid, dec!(100))).unwrap();
        assert_eq!(density.first_seen_at, t2);
    }

    #[test]
    fn test_tracked_set_matches_last_snapshot() {
        let tracker = DensityTracker::default();
        let t0 = Utc::now();
        tracker.on_book_update(&snapshot(
            vec![lvl(dec!(100), dec!(600)), lvl(dec!(99), dec!(1000)), lvl(dec!(98), dec!(1))],
            vec![lvl(dec!(101), dec!(500)), lvl(dec!(102), dec!(700))],
            t0,
        ));
        tracker.on_book_update(&snapshot(
            vec![lvl(dec!(99), dec!(1000)), lvl(dec!(97), dec!(700))],
            vec![lvl(dec!(102), dec!(10)), lvl(dec!(103), dec!(800))],
            t0 + TimeDelta::seconds(1),
        ));

        let mut tracked: Vec<(Side, Decimal)> =
            tracker.densities().into_iter().map(|d| (d.side, d.price)).collect();
        tracked.sort();
        assert_eq!(
            tracked,
            vec![(Side::Bid, dec!(97)), (Side::Bid, dec!(99)), (Side::Ask, dec!(103))]
        );
    }

    #[test]
    fn test_instruments_reconcile_independently() {
        let tracker = DensityTracker::default();
        let other = InstrumentKey::new(Venue::Okx, MarketType::Spot, "SOLUSDT");
        let now = Utc::now();
        tracker.on_book_update(&snapshot(vec![lvl(dec!(100), dec!(600))], vec![], now));
        tracker.on_book_update(&OrderBookSnapshot::new(other.clone(), vec![], vec![], dec!(100), now));

        assert_eq!(tracker.count(), 1);
        assert!(tracker.densities_for(&other).is_empty());
    }

    #[test]
    fn test_sweep_removes_only_stale_records() {
        let tracker = DensityTracker::default();
        let t0 = Utc::now();
        let other = InstrumentKey::new(Venue::Okx, MarketType::Spot, "SOLUSDT");
        tracker.on_book_update(&snapshot(vec![lvl(dec!(100), dec!(600))], vec![], t0));
        tracker.on_book_update(&OrderBookSnapshot::new(
            other.clone(),
            vec![lvl(dec!(100), dec!(600))],
            vec![],
            dec!(100),
            t0 + TimeDelta::seconds(90),
        ));

        let removed = tracker.sweep_stale_at(t0 + TimeDelta::seconds(150));
        assert_eq!(removed, 1);
        assert!(tracker.densities_for(&key()).is_empty());
        assert_eq!(tracker.densities_for(&other).len(), 1);
    }

    #[test]
    fn test_query_filters_sorts_and_limits() {
        let tracker = DensityTracker::default();
        let now = Utc::now();
        tracker.on_book_update(&snapshot(
            vec![lvl(dec!(99), dec!(600)), lvl(dec!(95), dec!(2000))],
            vec![lvl(dec!(101), dec!(1000))],
            now,
        ));

        let by_size = tracker.query(&DensityQuery::default());
        assert_eq!(by_size[0].price, dec!(95));

        let nearest = tracker.query(&DensityQuery {
            sort: DensitySort::DistanceAsc,
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(nearest.len(), 2);
        assert!(nearest[0].distance_percent <= nearest[1].distance_percent);

        let large = tracker.query(&DensityQuery {
            min_notional: Some(dec!(100000)),
            ..Default::default()
        });
        assert_eq!(large.len(), 2);
        assert_eq!(tracker.counts_by_instrument().get(&key()), Some(&3));
    }
}
