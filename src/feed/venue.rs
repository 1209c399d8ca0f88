//! Venue capability interface
//!
//! The connection engine is generic; everything venue-specific (endpoint,
//! subscribe frames, wire parsing, keepalive) comes from a [`VenueAdapter`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::model::{MarketType, PriceLevel, Side, Venue};

/// Normalized output of one venue message
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Book {
        symbol: String,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        last_price: Option<Decimal>,
    },
    Trade {
        symbol: String,
        price: Decimal,
        quantity: Decimal,
        side: Side,
        observed_at: DateTime<Utc>,
    },
    LastPrice {
        symbol: String,
        price: Decimal,
    },
}

/// Per-venue strategy plugged into [`super::FeedConnection`]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    fn market(&self) -> MarketType;

    fn websocket_url(&self) -> String;

    /// Subscribe frame for one batch of symbols
    fn build_subscribe_message(&self, symbols: &[String]) -> String;

    /// Symbols per subscribe frame
    fn subscribe_batch_size(&self) -> usize {
        50
    }

    /// Symbols one connection may carry; the rest are dropped with a warning
    fn max_symbols(&self) -> usize {
        usize::MAX
    }

    /// Parse one text frame; an empty vector means nothing to apply
    fn handle_message(&self, text: &str) -> Result<Vec<FeedEvent>>;

    /// Bare `pong` or any JSON frame carrying a `"pong"` value
    fn is_pong(&self, text: &str) -> bool {
        let trimmed = text.trim();
        trimmed.eq_ignore_ascii_case("pong") || trimmed.contains("\"pong\"")
    }

    /// Text keepalive payload; `None` sends a protocol ping frame instead
    fn ping_message(&self) -> Option<String> {
        None
    }

    fn ping_interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Silence tolerated while subscribed before the connection is recycled
    fn staleness_threshold(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }

    /// Frames to send right after the transport opens
    fn on_connected(&self) -> Vec<String> {
        Vec::new()
    }

    /// REST endpoint listing tradable symbols
    fn instruments_url(&self) -> Option<String> {
        None
    }

    fn parse_instruments(&self, _body: &serde_json::Value) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// REST endpoint returning recent candles for volume seeding
    fn volume_seed_url(&self, _symbol: &str) -> Option<String> {
        None
    }

    /// Quote volume traded over the last 15 minutes
    fn parse_volume_seed(&self, _body: &serde_json::Value) -> Result<Decimal> {
        Ok(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl VenueAdapter for Plain {
        fn venue(&self) -> Venue {
            Venue::Okx
        }

        fn market(&self) -> MarketType {
            MarketType::Futures
        }

        fn websocket_url(&self) -> String {
            "ws://127.0.0.1:1".into()
        }

        fn build_subscribe_message(&self, symbols: &[String]) -> String {
            symbols.join(",")
        }

        fn handle_message(&self, _text: &str) -> Result<Vec<FeedEvent>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_default_pong_shapes() {
        let adapter = Plain;
        for frame in [
            "pong",
            " PONG\n",
            "\"pong\"",
            r#"{"msg":"pong"}"#,
            r#"{"op":"pong"}"#,
            r#"{"event":"pong","ts":1}"#,
            r#"{"channel":"pong","result":null}"#,
        ] {
            assert!(adapter.is_pong(frame), "{frame} not treated as pong");
        }
    }

    #[test]
    fn test_market_data_is_not_pong() {
        let adapter = Plain;
        assert!(!adapter.is_pong(r#"{"stream":"btcusdt@aggTrade","data":{"p":"1"}}"#));
        assert!(!adapter.is_pong("ping"));
        assert!(!adapter.is_pong(r#"{"topic":"ponger"}"#));
    }
}
