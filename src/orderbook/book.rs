//! Immutable order book snapshot
//!
//! A snapshot is produced fresh on every update and superseded, never
//! mutated. Bids are kept best (highest) first, asks best (lowest) first.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{InstrumentKey, PriceLevel, Side};

/// Latest normalized book for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument: InstrumentKey,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub reference_price: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn new(
        instrument: InstrumentKey,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        reference_price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument,
            bids,
            asks,
            reference_price,
            observed_at,
        }
    }

    /// Iterate both sides, bids first
    pub fn levels(&self) -> impl Iterator<Item = (Side, &PriceLevel)> {
        self.bids
            .iter()
            .map(|l| (Side::Bid, l))
            .chain(self.asks.iter().map(|l| (Side::Ask, l)))
    }
}

/// Mid of the best bid and best ask, if both sides are populated
pub fn mid_price(bids: &[PriceLevel], asks: &[PriceLevel]) -> Option<Decimal> {
    match (bids.first(), asks.first()) {
        (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::from(2)),
        _ => None,
    }
}

/// Signed distance of `price` from `reference`, in percent
///
/// Zero when the reference is zero.
pub fn distance_percent(price: Decimal, reference: Decimal) -> Decimal {
    if reference.is_zero() {
        return Decimal::ZERO;
    }
    (price - reference) / reference * Decimal::ONE_HUNDRED
}

/// Drop non-positive levels and order the side best first
pub fn normalize_side(mut levels: Vec<PriceLevel>, side: Side) -> Vec<PriceLevel> {
    levels.retain(|l| l.quantity > Decimal::ZERO && l.price > Decimal::ZERO);
    match side {
        Side::Bid => levels.sort_by(|a, b| b.price.cmp(&a.price)),
        Side::Ask => levels.sort_by(|a, b| a.price.cmp(&b.price)),
    }
    levels
}

/// Keep only levels within `max_percent` of the reference price
///
/// The comparison uses the exact decimal distance. A zero reference keeps
/// every level since no distance can be computed.
pub fn filter_by_distance(
    levels: Vec<PriceLevel>,
    reference: Decimal,
    max_percent: Decimal,
) -> Vec<PriceLevel> {
    if reference.is_zero() {
        return levels;
    }
    levels
        .into_iter()
        .filter(|l| distance_percent(l.price, reference).abs() <= max_percent)
        .collect()
}
