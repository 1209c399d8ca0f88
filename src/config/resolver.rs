//! Detection settings override hierarchy
//!
//! Every field resolves independently, most specific first:
//! symbol, then venue market section, then venue defaults, then global.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{DetectionMethod, InstrumentKey, MarketType, Venue};

/// Resolved detection parameters for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub min_notional: Decimal,
    pub cooldown_minutes: u64,
    pub max_distance_percent: Decimal,
    pub methods: BTreeSet<DetectionMethod>,
    pub enabled: bool,
    pub comment: Option<String>,
}

impl EffectiveConfig {
    pub fn is_method_enabled(&self, method: DetectionMethod) -> bool {
        self.methods.contains(&method)
    }
}

/// Source of per-instrument detection parameters
#[cfg_attr(test, mockall::automock)]
pub trait ConfigResolver: Send + Sync {
    /// `None` means detection is disabled for the instrument
    fn effective_config(&self, instrument: &InstrumentKey) -> Option<EffectiveConfig>;

    fn is_market_enabled(&self, venue: Venue, market: MarketType) -> bool;
}

/// Global defaults, always fully populated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalDetection {
    pub min_notional: Decimal,
    pub cooldown_minutes: u64,
    pub max_distance_percent: Decimal,
    pub methods: BTreeSet<DetectionMethod>,
    pub enabled: bool,
}

impl Default for GlobalDetection {
    fn default() -> Self {
        Self {
            min_notional: Decimal::from(100_000),
            cooldown_minutes: 5,
            max_distance_percent: Decimal::TEN,
            methods: BTreeSet::from([DetectionMethod::Statistical, DetectionMethod::VolumeRelative]),
            enabled: true,
        }
    }
}

/// Optional overrides at one level of the hierarchy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionOverrides {
    pub min_notional: Option<Decimal>,
    pub cooldown_minutes: Option<u64>,
    pub max_distance_percent: Option<Decimal>,
    pub methods: Option<BTreeSet<DetectionMethod>>,
    pub enabled: Option<bool>,
    pub comment: Option<String>,
}

/// Venue-wide overrides plus per-market sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueOverrides {
    pub defaults: DetectionOverrides,
    pub spot: DetectionOverrides,
    pub futures: DetectionOverrides,
}

impl VenueOverrides {
    fn market(&self, market: MarketType) -> &DetectionOverrides {
        match market {
            MarketType::Spot => &self.spot,
            MarketType::Futures => &self.futures,
        }
    }
}

/// The full override hierarchy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub global: GlobalDetection,
    /// Keyed by lowercase venue name
    pub venues: HashMap<String, VenueOverrides>,
    /// Keyed by uppercase symbol
    pub symbols: HashMap<String, DetectionOverrides>,
}

impl DetectionSettings {
    /// Load from an optional file plus `DENSITY__`-prefixed environment overrides
    ///
    /// A missing file yields the global defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("DENSITY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        let loaded = loaded.normalized();
        info!(
            venues = loaded.venues.len(),
            symbols = loaded.symbols.len(),
            "Detection settings loaded"
        );
        Ok(loaded)
    }

    /// Lowercase venue keys and uppercase symbol keys
    pub fn normalized(self) -> Self {
        Self {
            global: self.global,
            venues: self
                .venues
                .into_iter()
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v))
                .collect(),
            symbols: self
                .symbols
                .into_iter()
                .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
                .collect(),
        }
    }

    /// Overrides from most to least specific, global excluded
    fn layers(&self, instrument: &InstrumentKey) -> Vec<&DetectionOverrides> {
        let mut layers = Vec::with_capacity(3);
        if let Some(symbol) = self.symbols.get(&instrument.symbol) {
            layers.push(symbol);
        }
        if let Some(venue) = self.venues.get(instrument.venue.as_str()) {
            layers.push(venue.market(instrument.market));
            layers.push(&venue.defaults);
        }
        layers
    }

    pub fn resolve(&self, instrument: &InstrumentKey) -> EffectiveConfig {
        let layers = self.layers(instrument);

        EffectiveConfig {
            min_notional: layers
                .iter()
                .find_map(|l| l.min_notional)
                .unwrap_or(self.global.min_notional),
            cooldown_minutes: layers
                .iter()
                .find_map(|l| l.cooldown_minutes)
                .unwrap_or(self.global.cooldown_minutes),
            max_distance_percent: layers
                .iter()
                .find_map(|l| l.max_distance_percent)
                .unwrap_or(self.global.max_distance_percent),
            methods: layers
                .iter()
                .find_map(|l| l.methods.clone())
                .unwrap_or_else(|| self.global.methods.clone()),
            enabled: layers
                .iter()
                .find_map(|l| l.enabled)
                .unwrap_or(self.global.enabled),
            comment: layers.iter().find_map(|l| l.comment.clone()),
        }
    }
}

impl ConfigResolver for DetectionSettings {
    fn effective_config(&self, instrument: &InstrumentKey) -> Option<EffectiveConfig> {
        let resolved = self.resolve(instrument);
        if !resolved.enabled || resolved.methods.is_empty() {
            debug!(instrument = %instrument, "Detection disabled for instrument");
            return None;
        }
        Some(resolved)
    }

    fn is_market_enabled(&self, venue: Venue, market: MarketType) -> bool {
        let Some(overrides) = self.venues.get(venue.as_str()) else {
            return self.global.enabled;
        };
        overrides
            .market(market)
            .enabled
            .or(overrides.defaults.enabled)
            .unwrap_or(self.global.enabled)
    }
}
