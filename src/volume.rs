//! Rolling traded-volume aggregation
//!
//! Keeps a time-ordered queue of traded notional per instrument. The time
//! ordering lets pruning stop at the first entry that is still in the window.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::maintenance::PeriodicTask;
use crate::model::{InstrumentKey, TradeTick};

/// One traded notional amount at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeWindowEntry {
    pub notional: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VolumeSettings {
    /// Length of the rolling window
    pub window: TimeDelta,
    /// Extra age tolerated before pruning
    pub grace: TimeDelta,
    pub prune_interval: Duration,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            window: TimeDelta::minutes(15),
            grace: TimeDelta::minutes(1),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Rolling 15-minute notional volume per instrument
#[derive(Debug)]
pub struct VolumeAggregator {
    windows: DashMap<InstrumentKey, VecDeque<VolumeWindowEntry>>,
    settings: VolumeSettings,
    pruner: Mutex<Option<PeriodicTask>>,
}

impl VolumeAggregator {
    pub fn new(settings: VolumeSettings) -> Self {
        Self {
            windows: DashMap::new(),
            settings,
            pruner: Mutex::new(None),
        }
    }

    pub fn add_volume(&self, instrument: &InstrumentKey, notional: Decimal) {
        self.add_volume_at(instrument, notional, Utc::now());
    }

    /// Count a venue trade at its observation time
    pub fn record_trade(&self, tick: &TradeTick) {
        self.add_volume_at(&tick.instrument, tick.notional(), tick.observed_at);
    }

    pub fn add_volume_at(&self, instrument: &InstrumentKey, notional: Decimal, at: DateTime<Utc>) {
        let entry = VolumeWindowEntry {
            notional,
            timestamp: at,
        };
        let mut queue = self.windows.entry(instrument.clone()).or_default();
        match queue.back() {
            Some(last) if last.timestamp > at => {
                let idx = queue.partition_point(|e| e.timestamp <= at);
                queue.insert(idx, entry);
            }
            _ => queue.push_back(entry),
        }
    }

    /// Sum of notional traded within the trailing window; zero if unknown
    pub fn rolling_volume(&self, instrument: &InstrumentKey) -> Decimal {
        self.rolling_volume_at(instrument, Utc::now())
    }

    pub fn rolling_volume_at(&self, instrument: &InstrumentKey, now: DateTime<Utc>) -> Decimal {
        let Some(queue) = self.windows.get(instrument) else {
            return Decimal::ZERO;
        };
        let cutoff = now - self.settings.window;
        queue
            .iter()
            .rev()
            .skip_while(|e| e.timestamp > now)
            .take_while(|e| e.timestamp > cutoff)
            .map(|e| e.notional)
            .sum()
    }

    /// Seconds since the oldest retained entry; zero if unknown
    pub fn tracking_age_secs(&self, instrument: &InstrumentKey) -> i64 {
        self.tracking_age_secs_at(instrument, Utc::now())
    }

    pub fn tracking_age_secs_at(&self, instrument: &InstrumentKey, now: DateTime<Utc>) -> i64 {
        self.windows
            .get(instrument)
            .and_then(|q| q.front().map(|e| (now - e.timestamp).num_seconds().max(0)))
            .unwrap_or(0)
    }

    /// Back-fill the window with `total` spread evenly over one entry per minute
    pub fn seed_volume(&self, instrument: &InstrumentKey, total: Decimal) {
        self.seed_volume_at(instrument, total, Utc::now());
    }

    pub fn seed_volume_at(&self, instrument: &InstrumentKey, total: Decimal, now: DateTime<Utc>) {
        if total <= Decimal::ZERO {
            debug!(instrument = %instrument, "Skipping empty volume seed");
            return;
        }

        let buckets = self.settings.window.num_minutes().max(1);
        let per_bucket = (total / Decimal::from(buckets)).round_dp(8);
        let mut seeded: Vec<VolumeWindowEntry> = (0..buckets)
            .rev()
            .map(|minutes_ago| VolumeWindowEntry {
                notional: per_bucket,
                timestamp: now - TimeDelta::minutes(minutes_ago),
            })
            .collect();
        // Rounding remainder goes to the newest bucket so the seed sums to `total`
        if let Some(newest) = seeded.last_mut() {
            newest.notional = total - per_bucket * Decimal::from(buckets - 1);
        }

        let mut queue = self.windows.entry(instrument.clone()).or_default();
        queue.extend(seeded);
        queue.make_contiguous().sort_by_key(|e| e.timestamp);

        debug!(instrument = %instrument, total = %total, "Seeded rolling volume");
    }

    /// Drop entries older than the window plus grace; returns how many were removed
    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }

    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.settings.window - self.settings.grace;
        let mut removed = 0;
        self.windows.retain(|_, queue| {
            while queue.front().is_some_and(|e| e.timestamp < cutoff) {
                queue.pop_front();
                removed += 1;
            }
            !queue.is_empty()
        });
        removed
    }

    pub fn tracked_count(&self) -> usize {
        self.windows.len()
    }

    /// Start the pruning ticker; it stops when the aggregator is dropped
    pub fn start_maintenance(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("volume-prune", self.settings.prune_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(aggregator) = weak.upgrade() else {
                    return false;
                };
                let removed = aggregator.prune();
                debug!(
                    removed,
                    instruments = aggregator.tracked_count(),
                    "Volume window cleanup"
                );
                true
            }
        });
        *self.pruner.lock() = Some(task);
    }

    pub fn stop_maintenance(&self) {
        if let Some(task) = self.pruner.lock().take() {
            task.stop();
        }
    }
}

impl Default for VolumeAggregator {
    fn default() -> Self {
        Self::new(VolumeSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarketType, Side, Venue};
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::new(Venue::Gate, MarketType::Futures, "ETHUSDT")
    }

    #[test]
    fn test_unknown_instrument_has_no_volume() {
        let agg = VolumeAggregator::default();
        assert_eq!(agg.rolling_volume(&key()), Decimal::ZERO);
        assert_eq!(agg.tracking_age_secs(&key()), 0);
    }

    #[test]
    fn test_rolling_volume_ignores_entries_outside_window() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        agg.add_volume_at(&key(), dec!(1000), now - TimeDelta::minutes(20));
        agg.add_volume_at(&key(), dec!(500), now - TimeDelta::minutes(15));
        agg.add_volume_at(&key(), dec!(250), now - TimeDelta::minutes(14));
        agg.add_volume_at(&key(), dec!(100), now);

        assert_eq!(agg.rolling_volume_at(&key(), now), dec!(350));
        assert_eq!(agg.tracking_age_secs_at(&key(), now), 20 * 60);
    }

    #[test]
    fn test_trade_counts_its_notional() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        let tick = TradeTick {
            instrument: key(),
            price: dec!(2500.5),
            quantity: dec!(4),
            side: Side::Ask,
            observed_at: now - TimeDelta::minutes(1),
        };
        agg.record_trade(&tick);

        assert_eq!(agg.rolling_volume_at(&key(), now), dec!(10002));
        assert_eq!(agg.tracking_age_secs_at(&key(), now), 60);
    }

    #[test]
    fn test_out_of_order_insert_keeps_time_order() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        agg.add_volume_at(&key(), dec!(1), now);
        agg.add_volume_at(&key(), dec!(2), now - TimeDelta::minutes(30));

        assert_eq!(agg.tracking_age_secs_at(&key(), now), 30 * 60);
        assert_eq!(agg.prune_at(now), 1);
        assert_eq!(agg.rolling_volume_at(&key(), now), dec!(1));
    }

    #[test]
    fn test_seed_is_immediately_available() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        agg.seed_volume_at(&key(), dec!(150000), now);

        assert_eq!(agg.rolling_volume_at(&key(), now), dec!(150000));
        assert_eq!(agg.tracking_age_secs_at(&key(), now), 14 * 60);
    }

    #[test]
    fn test_seed_remainder_sums_exactly() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        agg.seed_volume_at(&key(), dec!(100), now);
        agg.add_volume_at(&key(), dec!(5), now);
        assert_eq!(agg.rolling_volume_at(&key(), now), dec!(105));
    }

    #[test]
    fn test_seed_ignores_non_positive_totals() {
        let agg = VolumeAggregator::default();
        agg.seed_volume(&key(), Decimal::ZERO);
        assert_eq!(agg.tracked_count(), 0);
    }

    #[test]
    fn test_prune_removes_only_expired_prefix() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        agg.add_volume_at(&key(), dec!(1), now - TimeDelta::minutes(40));
        agg.add_volume_at(&key(), dec!(2), now - TimeDelta::minutes(17));
        agg.add_volume_at(&key(), dec!(3), now - TimeDelta::minutes(15) - TimeDelta::seconds(30));
        agg.add_volume_at(&key(), dec!(4), now);

        assert_eq!(agg.prune_at(now), 2);
        assert_eq!(agg.tracking_age_secs_at(&key(), now), 15 * 60 + 30);
    }

    #[test]
    fn test_prune_forgets_idle_instruments() {
        let agg = VolumeAggregator::default();
        let now = Utc::now();
        agg.add_volume_at(&key(), dec!(1), now - TimeDelta::hours(1));
        agg.prune_at(now);
        assert_eq!(agg.tracked_count(), 0);
    }
}
