//! Venue-agnostic market model shared by every stage of the pipeline

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Supported trading venues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
    Bitget,
    Gate,
    Mexc,
    Hyperliquid,
    Lighter,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
            Venue::Bitget => "bitget",
            Venue::Gate => "gate",
            Venue::Mexc => "mexc",
            Venue::Hyperliquid => "hyperliquid",
            Venue::Lighter => "lighter",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "binance" => Some(Venue::Binance),
            "bybit" => Some(Venue::Bybit),
            "okx" => Some(Venue::Okx),
            "bitget" => Some(Venue::Bitget),
            "gate" => Some(Venue::Gate),
            "mexc" => Some(Venue::Mexc),
            "hyperliquid" => Some(Venue::Hyperliquid),
            "lighter" => Some(Venue::Lighter),
            _ => None,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

/// Market type of a venue feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Futures => "futures",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "spot" => Some(MarketType::Spot),
            "futures" | "perp" | "perpetual" => Some(MarketType::Futures),
            _ => None,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => f.write_str("BID"),
            Side::Ask => f.write_str("ASK"),
        }
    }
}

/// (venue, market, symbol) triple identifying one tradable book
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub venue: Venue,
    pub market: MarketType,
    pub symbol: String,
}

impl InstrumentKey {
    pub fn new(venue: Venue, market: MarketType, symbol: &str) -> Self {
        Self {
            venue,
            market,
            symbol: symbol.trim().to_uppercase(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.venue, self.market, self.symbol)
    }
}

/// A single level in the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Quote-currency value resting at this level
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// One matched trade reported by a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub instrument: InstrumentKey,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Aggressor side
    pub side: Side,
    pub observed_at: DateTime<Utc>,
}

impl TradeTick {
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// How an anomalous level was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Statistical,
    VolumeRelative,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Statistical => "statistical",
            DetectionMethod::VolumeRelative => "volume_relative",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted when a level passes one of the detection methods and is not in cooldown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub method: DetectionMethod,
    pub price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    /// Signed distance from the reference price, in percent
    pub distance_percent: Decimal,
    pub rolling_volume_15m: Decimal,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}
