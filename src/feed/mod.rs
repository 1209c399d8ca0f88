//! Venue feed ingestion
//!
//! A generic connection engine ([`FeedConnection`]) driven by per-venue
//! [`VenueAdapter`]s, plus the [`FeedSupervisor`] that owns them all.

mod binance;
mod connection;
mod policy;
mod rest;
mod supervisor;
mod venue;

pub use binance::BinanceAdapter;
pub use connection::{AppliedEvent, ConnectionState, ConnectionStatus, FeedConnection, FeedSink};
pub use policy::{ConnectionSettings, ReconnectPolicy};
pub use rest::RestClient;
pub use supervisor::{default_adapter, AdapterFactory, FeedSupervisor};
pub use venue::{FeedEvent, VenueAdapter};
