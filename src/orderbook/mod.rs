//! Order book module
//!
//! Keeps the latest filtered snapshot per instrument and publishes book
//! updates to the density tracker and the anomaly detector.

mod book;
mod store;

pub use book::{distance_percent, filter_by_distance, mid_price, normalize_side, OrderBookSnapshot};
pub use store::{BookUpdate, OrderBookStore, DEFAULT_MAX_DISTANCE_PERCENT};
