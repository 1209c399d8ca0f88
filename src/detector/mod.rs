//! Anomaly detection over book updates
//!
//! Each pass resolves the instrument's configuration, evaluates every level
//! against the statistical and volume-relative criteria, keeps the largest
//! candidate per (side, method) and emits it unless that key is cooling down.

pub mod stats;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ConfigResolver, EffectiveConfig};
use crate::maintenance::PeriodicTask;
use crate::model::{Alert, DetectionMethod, InstrumentKey, PriceLevel, Side};
use crate::orderbook::{distance_percent, BookUpdate, OrderBookSnapshot};
use crate::telemetry;
use crate::volume::VolumeAggregator;

pub use stats::{statistical_threshold, NotionalStats, MIN_SAMPLES};

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Rolling volume younger than this is not trusted for volume-relative detection
    pub min_volume_age_secs: i64,
    /// Cooldown entries older than this are swept
    pub cooldown_retention: TimeDelta,
    pub sweep_interval: Duration,
    pub alert_buffer: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_volume_age_secs: 300,
            cooldown_retention: TimeDelta::minutes(30),
            sweep_interval: Duration::from_secs(300),
            alert_buffer: 1024,
        }
    }
}

/// Alerts are deduplicated per key regardless of price
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub method: DetectionMethod,
}

/// Longest cooldown honoured; larger configured values are clamped to it
pub const MAX_COOLDOWN_MINUTES: u64 = 100 * 365 * 24 * 60;

/// When a key last alerted and until when it stays quiet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CooldownStamp {
    stamped_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Configured cooldown as a time span, clamped so it can never overflow
pub fn cooldown_span(minutes: u64) -> TimeDelta {
    TimeDelta::try_minutes(minutes.min(MAX_COOLDOWN_MINUTES) as i64).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    level: &'a PriceLevel,
    notional: Decimal,
    distance: Decimal,
}

pub struct AnomalyDetector {
    resolver: Arc<dyn ConfigResolver>,
    volume: Arc<VolumeAggregator>,
    cooldowns: DashMap<CooldownKey, CooldownStamp>,
    alerts: broadcast::Sender<Alert>,
    settings: DetectorSettings,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("cooldowns", &self.cooldowns.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl AnomalyDetector {
    pub fn new(
        resolver: Arc<dyn ConfigResolver>,
        volume: Arc<VolumeAggregator>,
        settings: DetectorSettings,
    ) -> Self {
        let (alerts, _) = broadcast::channel(settings.alert_buffer.max(1));
        Self {
            resolver,
            volume,
            cooldowns: DashMap::new(),
            alerts,
            settings,
            sweeper: Mutex::new(None),
        }
    }

    /// Register a consumer of raised alerts
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Run one detection pass and publish the alerts it raises
    pub fn analyze(&self, snapshot: &OrderBookSnapshot) -> Vec<Alert> {
        let instrument = &snapshot.instrument;
        let Some(config) = self.resolver.effective_config(instrument) else {
            return Vec::new();
        };
        if !config.enabled {
            return Vec::new();
        }

        let now = snapshot.observed_at;
        let rolling_volume = self.volume.rolling_volume_at(instrument, now);
        let candidates = self.select_candidates(snapshot, &config, rolling_volume, now);

        let cooldown = cooldown_span(config.cooldown_minutes);
        let mut raised = Vec::with_capacity(candidates.len());
        for ((side, method), candidate) in candidates {
            let key = CooldownKey {
                instrument: instrument.clone(),
                side,
                method,
            };
            if !self.try_stamp_cooldown(key, now, cooldown) {
                telemetry::metrics()
                    .alerts_suppressed
                    .with_label_values(&[method.as_str()])
                    .inc();
                debug!(
                    instrument = %instrument,
                    side = %side,
                    method = %method,
                    "Alert suppressed by cooldown"
                );
                continue;
            }

            let alert = Alert {
                instrument: instrument.clone(),
                side,
                method,
                price: candidate.level.price,
                quantity: candidate.level.quantity,
                notional: candidate.notional,
                distance_percent: candidate.distance.round_dp(4),
                rolling_volume_15m: rolling_volume,
                comment: config.comment.clone(),
                timestamp: now,
            };
            self.emit(&alert);
            raised.push(alert);
        }
        raised
    }

    /// Best qualifying level per (side, method), by strictly larger notional
    fn select_candidates<'a>(
        &self,
        snapshot: &'a OrderBookSnapshot,
        config: &EffectiveConfig,
        rolling_volume: Decimal,
        now: DateTime<Utc>,
    ) -> BTreeMap<(Side, DetectionMethod), Candidate<'a>> {
        let stat_threshold = if config.is_method_enabled(DetectionMethod::Statistical) {
            let samples: Vec<f64> = snapshot
                .levels()
                .filter_map(|(_, level)| level.notional().to_f64())
                .collect();
            statistical_threshold(&samples)
        } else {
            f64::INFINITY
        };

        let volume_ready = config.is_method_enabled(DetectionMethod::VolumeRelative)
            && rolling_volume > Decimal::ZERO
            && self.volume.tracking_age_secs_at(&snapshot.instrument, now)
                >= self.settings.min_volume_age_secs;

        let mut best: BTreeMap<(Side, DetectionMethod), Candidate<'a>> = BTreeMap::new();
        for (side, level) in snapshot.levels() {
            let notional = level.notional();
            if notional < config.min_notional {
                continue;
            }
            let distance = distance_percent(level.price, snapshot.reference_price);
            if distance.abs() > config.max_distance_percent {
                continue;
            }

            let candidate = Candidate {
                level,
                notional,
                distance,
            };
            let statistical = notional
                .to_f64()
                .is_some_and(|n| n > stat_threshold);
            let volume_relative = volume_ready && notional > rolling_volume;

            for (method, qualifies) in [
                (DetectionMethod::Statistical, statistical),
                (DetectionMethod::VolumeRelative, volume_relative),
            ] {
                if !qualifies {
                    continue;
                }
                best.entry((side, method))
                    .and_modify(|current| {
                        if candidate.notional > current.notional {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }
        best
    }

    /// Check and stamp the cooldown in one map operation
    fn try_stamp_cooldown(&self, key: CooldownKey, now: DateTime<Utc>, cooldown: TimeDelta) -> bool {
        let stamp = CooldownStamp {
            stamped_at: now,
            expires_at: now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        match self.cooldowns.entry(key) {
            Entry::Occupied(mut entry) => {
                if now - entry.get().stamped_at < cooldown {
                    false
                } else {
                    entry.insert(stamp);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(stamp);
                true
            }
        }
    }

    fn emit(&self, alert: &Alert) {
        let side = alert.side.to_string();
        telemetry::metrics()
            .alerts_emitted
            .with_label_values(&[alert.method.as_str(), side.as_str()])
            .inc();
        info!(
            venue = %alert.instrument.venue,
            market = %alert.instrument.market,
            symbol = %alert.instrument.symbol,
            side = %alert.side,
            method = %alert.method,
            price = %alert.price,
            notional = %alert.notional,
            distance_percent = %alert.distance_percent,
            rolling_volume_15m = %alert.rolling_volume_15m,
            "Density alert raised"
        );
        if self.alerts.send(alert.clone()).is_err() {
            debug!("No alert subscribers");
        }
    }

    /// Forget cooldowns that have expired and are older than the retention bound
    pub fn sweep_cooldowns(&self) -> usize {
        self.sweep_cooldowns_at(Utc::now())
    }

    pub fn sweep_cooldowns_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.cooldowns.len();
        let retention = self.settings.cooldown_retention;
        self.cooldowns.retain(|_, stamp| {
            let retained_until = stamp
                .stamped_at
                .checked_add_signed(retention)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .max(stamp.expires_at);
            now < retained_until
        });
        let removed = before.saturating_sub(self.cooldowns.len());
        if removed > 0 {
            debug!(removed, remaining = self.cooldowns.len(), "Cleaned up alert cooldowns");
        }
        removed
    }

    pub fn cooldown_count(&self) -> usize {
        self.cooldowns.len()
    }

    /// Consume book updates until the channel closes
    pub async fn run(self: Arc<Self>, mut updates: broadcast::Receiver<BookUpdate>) {
        info!("Anomaly detector started");
        loop {
            match updates.recv().await {
                Ok(snapshot) => {
                    self.analyze(&snapshot);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    telemetry::metrics()
                        .lagged_updates
                        .with_label_values(&["anomaly_detector"])
                        .inc_by(skipped);
                    warn!(skipped, "Anomaly detector lagging, skipped stale book updates");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Book update channel closed, anomaly detector stopping");
                    break;
                }
            }
        }
    }

    /// Start the cooldown sweep; it stops when the detector is dropped
    pub fn start_maintenance(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("cooldown-sweep", self.settings.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(detector) => {
                        detector.sweep_cooldowns();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfigResolver;
    use crate::model::{MarketType, Venue};
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn key() -> InstrumentKey {
        InstrumentKey::new(Venue::Binance, MarketType::Futures, "BTCUSDT")
    }

    fn config(min_notional: Decimal, methods: &[DetectionMethod]) -> EffectiveConfig {
        EffectiveConfig {
            min_notional,
            cooldown_minutes: 5,
            max_distance_percent: dec!(10),
            methods: methods.iter().copied().collect::<BTreeSet<_>>(),
            enabled: true,
            comment: None,
        }
    }

    fn detector_with(config: Option<EffectiveConfig>) -> (AnomalyDetector, Arc<VolumeAggregator>) {
        let mut resolver = MockConfigResolver::new();
        resolver
            .expect_effective_config()
            .returning(move |_| config.clone());
        let volume = Arc::new(VolumeAggregator::default());
        let detector = AnomalyDetector::new(Arc::new(resolver), volume.clone(), DetectorSettings::default());
        (detector, volume)
    }

    fn lvl(price: Decimal, qty: Decimal) -> PriceLevel {
        PriceLevel::new(price, qty)
    }

    /// Twelve ~1,000 notional bids plus the given extra levels
    fn quiet_bids(extra: &[PriceLevel]) -> Vec<PriceLevel> {
        let mut bids: Vec<PriceLevel> = (1..=12)
            .map(|i| lvl(dec!(100) - Decimal::from(i) / dec!(10), dec!(10)))
            .collect();
        bids.extend_from_slice(extra);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        bids
    }

    fn snapshot(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, reference: Decimal, at: DateTime<Utc>) -> OrderBookSnapshot {
        OrderBookSnapshot::new(key(), bids, asks, reference, at)
    }

    #[test]
    fn test_level_larger_than_rolling_volume_alerts() {
        let all = [DetectionMethod::Statistical, DetectionMethod::VolumeRelative];
        let (detector, volume) = detector_with(Some(config(dec!(100000), &all)));
        let now = Utc::now();
        volume.seed_volume_at(&key(), dec!(500000), now);

        let book = snapshot(
            vec![lvl(dec!(50000), dec!(20)), lvl(dec!(49990), dec!(1))],
            vec![lvl(dec!(50010), dec!(1))],
            dec!(50000),
            now,
        );
        let alerts = detector.analyze(&book);

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].method, DetectionMethod::VolumeRelative);
        assert_eq!(alerts[0].price, dec!(50000));
        assert_eq!(alerts[0].notional, dec!(1000000));
        assert_eq!(alerts[0].rolling_volume_15m, dec!(500000));
        assert_eq!(alerts[0].timestamp, now);
    }

    #[test]
    fn test_min_notional_filters_before_threshold_checks() {
        let all = [DetectionMethod::Statistical, DetectionMethod::VolumeRelative];
        let (detector, volume) = detector_with(Some(config(dec!(2000000), &all)));
        let now = Utc::now();
        volume.seed_volume_at(&key(), dec!(500000), now);

        let book = snapshot(vec![lvl(dec!(50000), dec!(20))], vec![], dec!(50000), now);
        assert!(detector.analyze(&book).is_empty());
    }

    #[test]
    fn test_unwarmed_volume_is_not_trusted() {
        let (detector, volume) = detector_with(Some(config(dec!(100000), &[DetectionMethod::VolumeRelative])));
        let now = Utc::now();
        volume.add_volume_at(&key(), dec!(1000), now - TimeDelta::seconds(60));

        let book = snapshot(vec![lvl(dec!(50000), dec!(20))], vec![], dec!(50000), now);
        assert!(detector.analyze(&book).is_empty());
    }

    #[test]
    fn test_cooldown_suppresses_repeat_within_window() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let t0 = Utc::now();
        let bids = quiet_bids(&[lvl(dec!(95), dec!(20000))]);

        let first = detector.analyze(&snapshot(bids.clone(), vec![], dec!(100), t0));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].method, DetectionMethod::Statistical);
        assert_eq!(first[0].price, dec!(95));
        assert_eq!(first[0].distance_percent, dec!(-5));

        let second = detector.analyze(&snapshot(bids.clone(), vec![], dec!(100), t0 + TimeDelta::seconds(90)));
        assert!(second.is_empty());

        let third = detector.analyze(&snapshot(bids, vec![], dec!(100), t0 + TimeDelta::minutes(5)));
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn test_cooldown_ignores_price() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let t0 = Utc::now();
        detector.analyze(&snapshot(quiet_bids(&[lvl(dec!(95), dec!(20000))]), vec![], dec!(100), t0));

        let moved = quiet_bids(&[lvl(dec!(94), dec!(20000))]);
        let alerts = detector.analyze(&snapshot(moved, vec![], dec!(100), t0 + TimeDelta::seconds(30)));
        assert!(alerts.is_empty());
        assert_eq!(detector.cooldown_count(), 1);
    }

    #[test]
    fn test_only_largest_candidate_per_side_and_method() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let mut bids = quiet_bids(&[
            lvl(dec!(96), dec!(10000)),
            lvl(dec!(95), dec!(30000)),
            lvl(dec!(94), dec!(20000)),
        ]);
        bids.extend((1..=8).map(|i| lvl(dec!(90) + Decimal::from(i) / dec!(10), dec!(10))));

        let alerts = detector.analyze(&snapshot(bids, vec![], dec!(100), Utc::now()));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].side, Side::Bid);
        assert_eq!(alerts[0].price, dec!(95));
    }

    #[test]
    fn test_sides_cool_down_independently() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let asks: Vec<PriceLevel> = (1..=12)
            .map(|i| lvl(dec!(100) + Decimal::from(i) / dec!(10), dec!(10)))
            .chain([lvl(dec!(105), dec!(20000))])
            .collect();
        let bids = quiet_bids(&[lvl(dec!(95), dec!(20000))]);

        let alerts = detector.analyze(&snapshot(bids, asks, dec!(100), Utc::now()));
        let sides: BTreeSet<Side> = alerts.iter().map(|a| a.side).collect();
        assert_eq!(sides, BTreeSet::from([Side::Bid, Side::Ask]));
    }

    #[test]
    fn test_too_few_levels_disables_statistics() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let book = snapshot(vec![lvl(dec!(95), dec!(20000)), lvl(dec!(99), dec!(1))], vec![], dec!(100), Utc::now());
        assert!(detector.analyze(&book).is_empty());
    }

    #[test]
    fn test_levels_beyond_max_distance_are_ignored() {
        let mut narrow = config(dec!(100000), &[DetectionMethod::Statistical]);
        narrow.max_distance_percent = dec!(2);
        let (detector, _) = detector_with(Some(narrow));
        let book = snapshot(quiet_bids(&[lvl(dec!(95), dec!(20000))]), vec![], dec!(100), Utc::now());
        assert!(detector.analyze(&book).is_empty());
    }

    #[test]
    fn test_unresolved_config_disables_detection() {
        let (detector, volume) = detector_with(None);
        let now = Utc::now();
        volume.seed_volume_at(&key(), dec!(1000), now);
        let book = snapshot(quiet_bids(&[lvl(dec!(95), dec!(20000))]), vec![], dec!(100), now);
        assert!(detector.analyze(&book).is_empty());
        assert_eq!(detector.cooldown_count(), 0);
    }

    #[test]
    fn test_alert_carries_comment() {
        let mut commented = config(dec!(100000), &[DetectionMethod::Statistical]);
        commented.comment = Some("watch list".into());
        let (detector, _) = detector_with(Some(commented));
        let alerts = detector.analyze(&snapshot(
            quiet_bids(&[lvl(dec!(95), dec!(20000))]),
            vec![],
            dec!(100),
            Utc::now(),
        ));
        assert_eq!(alerts[0].comment.as_deref(), Some("watch list"));
    }

    #[test]
    fn test_sweep_drops_old_cooldowns() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let t0 = Utc::now();
        detector.analyze(&snapshot(quiet_bids(&[lvl(dec!(95), dec!(20000))]), vec![], dec!(100), t0));

        assert_eq!(detector.sweep_cooldowns_at(t0 + TimeDelta::minutes(10)), 0);
        assert_eq!(detector.sweep_cooldowns_at(t0 + TimeDelta::minutes(31)), 1);
    }

    #[test]
    fn test_sweep_keeps_cooldowns_longer_than_retention() {
        let mut hour = config(dec!(100000), &[DetectionMethod::Statistical]);
        hour.cooldown_minutes = 60;
        let (detector, _) = detector_with(Some(hour));
        let bids = quiet_bids(&[lvl(dec!(95), dec!(20000))]);
        let t0 = Utc::now();

        assert_eq!(detector.analyze(&snapshot(bids.clone(), vec![], dec!(100), t0)).len(), 1);
        assert_eq!(detector.sweep_cooldowns_at(t0 + TimeDelta::minutes(35)), 0);

        let later = t0 + TimeDelta::minutes(40);
        assert!(detector.analyze(&snapshot(bids.clone(), vec![], dec!(100), later)).is_empty());

        assert_eq!(detector.sweep_cooldowns_at(t0 + TimeDelta::minutes(61)), 1);
        let after = t0 + TimeDelta::minutes(61);
        assert_eq!(detector.analyze(&snapshot(bids, vec![], dec!(100), after)).len(), 1);
    }

    #[test]
    fn test_huge_cooldown_is_clamped() {
        let mut forever = config(dec!(100000), &[DetectionMethod::Statistical]);
        forever.cooldown_minutes = u64::MAX;
        let (detector, _) = detector_with(Some(forever));
        let bids = quiet_bids(&[lvl(dec!(95), dec!(20000))]);
        let t0 = Utc::now();

        assert_eq!(detector.analyze(&snapshot(bids.clone(), vec![], dec!(100), t0)).len(), 1);
        let next_year = t0 + TimeDelta::days(365);
        assert!(detector.analyze(&snapshot(bids, vec![], dec!(100), next_year)).is_empty());
        assert_eq!(detector.sweep_cooldowns_at(next_year), 0);
        assert_eq!(cooldown_span(u64::MAX), TimeDelta::minutes(MAX_COOLDOWN_MINUTES as i64));
    }

    #[tokio::test]
    async fn test_alerts_are_published() {
        let (detector, _) = detector_with(Some(config(dec!(100000), &[DetectionMethod::Statistical])));
        let mut rx = detector.subscribe();
        detector.analyze(&snapshot(quiet_bids(&[lvl(dec!(95), dec!(20000))]), vec![], dec!(100), Utc::now()));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.price, dec!(95));
    }
}
