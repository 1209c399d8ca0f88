//! Binance spot and USDT-M futures adapter
//!
//! Subscribes to partial depth and aggregated trades on the combined stream
//! endpoint. Binance answers protocol pings natively, so no text keepalive.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::venue::{FeedEvent, VenueAdapter};
use crate::error::{Result, ScannerError};
use crate::model::{MarketType, PriceLevel, Side, Venue};

const SPOT_WS_URL: &str = "wss://stream.binance.com:9443/stream";
const FUTURES_WS_URL: &str = "wss://fstream.binance.com/stream";
const SPOT_REST_URL: &str = "https://api.binance.com/api/v3";
const FUTURES_REST_URL: &str = "https://fapi.binance.com/fapi/v1";

/// 1024 streams per connection, two streams per symbol
const MAX_SYMBOLS: usize = 512;
const SUBSCRIBE_BATCH: usize = 20;

/// Depth payload, either a diff-style event (`b`/`a`) or a partial book (`bids`/`asks`)
#[derive(Debug, Clone, Deserialize)]
struct DepthPayload {
    #[serde(rename = "s", default)]
    symbol: Option<String>,

    #[serde(rename = "b", alias = "bids", default, deserialize_with = "deserialize_price_levels")]
    bids: Vec<PriceLevel>,

    #[serde(rename = "a", alias = "asks", default, deserialize_with = "deserialize_price_levels")]
    asks: Vec<PriceLevel>,
}

/// Aggregated trade event
#[derive(Debug, Clone, Deserialize)]
struct AggTrade {
    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    quantity: Decimal,

    /// Buyer is maker, i.e. the aggressor sold
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug)]
pub struct BinanceAdapter {
    market: MarketType,
    ws_url: String,
    rest_url: String,
    request_id: AtomicU64,
}

impl BinanceAdapter {
    pub fn new(market: MarketType) -> Self {
        let (ws_url, rest_url) = match market {
            MarketType::Spot => (SPOT_WS_URL, SPOT_REST_URL),
            MarketType::Futures => (FUTURES_WS_URL, FUTURES_REST_URL),
        };
        Self::with_endpoints(market, ws_url, rest_url)
    }

    /// Point the adapter at other endpoints, e.g. a local test server
    pub fn with_endpoints(market: MarketType, ws_url: &str, rest_url: &str) -> Self {
        Self {
            market,
            ws_url: ws_url.to_string(),
            rest_url: rest_url.trim_end_matches('/').to_string(),
            request_id: AtomicU64::new(1),
        }
    }

    fn depth_events(&self, stream_symbol: Option<&str>, data: &Value) -> Result<Vec<FeedEvent>> {
        let depth = DepthPayload::deserialize(data)?;
        let Some(symbol) = stream_symbol.map(str::to_string).or(depth.symbol) else {
            return Err(ScannerError::Parse("depth update without symbol".to_string()));
        };
        if depth.bids.is_empty() && depth.asks.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![FeedEvent::Book {
            symbol: symbol.to_uppercase(),
            bids: depth.bids,
            asks: depth.asks,
            last_price: None,
        }])
    }

    fn trade_events(&self, data: &Value) -> Result<Vec<FeedEvent>> {
        let trade = AggTrade::deserialize(data)?;
        let side = if trade.is_buyer_maker { Side::Ask } else { Side::Bid };
        Ok(vec![FeedEvent::Trade {
            symbol: trade.symbol.to_uppercase(),
            price: trade.price,
            quantity: trade.quantity,
            side,
            observed_at: Utc::now(),
        }])
    }
}

impl VenueAdapter for BinanceAdapter {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn market(&self) -> MarketType {
        self.market
    }

    fn websocket_url(&self) -> String {
        self.ws_url.clone()
    }

    fn build_subscribe_message(&self, symbols: &[String]) -> String {
        let params: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let s_lower = s.to_lowercase();
                [format!("{s_lower}@depth20@500ms"), format!("{s_lower}@aggTrade")]
            })
            .collect();
        serde_json::json!({
            "method": "SUBSCRIBE",
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        })
        .to_string()
    }

    fn subscribe_batch_size(&self) -> usize {
        SUBSCRIBE_BATCH
    }

    fn max_symbols(&self) -> usize {
        MAX_SYMBOLS
    }

    fn handle_message(&self, text: &str) -> Result<Vec<FeedEvent>> {
        let root: Value = serde_json::from_str(text)?;

        // Subscription acknowledgement
        if root.get("result").is_some() && root.get("id").is_some() {
            return Ok(Vec::new());
        }
        if let Some(error) = root.get("error") {
            return Err(ScannerError::WebSocketMessage(error.to_string()));
        }

        let data = root.get("data").unwrap_or(&root);
        match root.get("stream").and_then(Value::as_str) {
            Some(stream) if stream.contains("@depth") => {
                let symbol = stream.split('@').next();
                self.depth_events(symbol, data)
            }
            Some(stream) if stream.contains("@aggTrade") => self.trade_events(data),
            Some(_) => Ok(Vec::new()),
            None => match data.get("e").and_then(Value::as_str) {
                Some("aggTrade") => self.trade_events(data),
                Some("depthUpdate") => self.depth_events(None, data),
                _ => Ok(Vec::new()),
            },
        }
    }

    fn instruments_url(&self) -> Option<String> {
        Some(format!("{}/exchangeInfo", self.rest_url))
    }

    fn parse_instruments(&self, body: &Value) -> Result<Vec<String>> {
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| ScannerError::Parse("exchangeInfo without symbols".to_string()))?;

        let field = |s: &Value, name: &str| s.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(symbols
            .iter()
            .filter(|s| field(s, "status") == "TRADING" && field(s, "quoteAsset") == "USDT")
            .filter(|s| self.market == MarketType::Spot || field(s, "contractType") == "PERPETUAL")
            .map(|s| field(s, "symbol"))
            .filter(|name| !name.is_empty())
            .collect())
    }

    fn volume_seed_url(&self, symbol: &str) -> Option<String> {
        Some(format!(
            "{}/klines?symbol={}&interval=1m&limit=15",
            self.rest_url,
            symbol.to_uppercase()
        ))
    }

    /// Sum of the quote asset volume column over the returned candles
    fn parse_volume_seed(&self, body: &Value) -> Result<Decimal> {
        let candles = body
            .as_array()
            .ok_or_else(|| ScannerError::Parse("klines response is not an array".to_string()))?;
        candles
            .iter()
            .map(|candle| {
                let raw = candle
                    .get(7)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ScannerError::Parse("kline without quote volume".to_string()))?;
                Decimal::from_str(raw).map_err(|e| ScannerError::Parse(e.to_string()))
            })
            .sum()
    }
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() < 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel::new(
                Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn futures() -> BinanceAdapter {
        BinanceAdapter::new(MarketType::Futures)
    }

    #[test]
    fn test_parse_combined_depth() {
        let raw = r#"{
            "stream": "btcusdt@depth20@500ms",
            "data": {
                "e": "depthUpdate",
                "E": 1672531200000,
                "s": "BTCUSDT",
                "U": 100,
                "u": 105,
                "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
                "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
            }
        }"#;

        let events = futures().handle_message(raw).unwrap();
        match &events[..] {
            [FeedEvent::Book { symbol, bids, asks, last_price }] => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(bids.len(), 2);
                assert_eq!(asks[1], PriceLevel::new(dec!(50002), dec!(0.5)));
                assert_eq!(*last_price, None);
            }
            other => panic!("Expected one book event, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_spot_partial_depth() {
        let raw = r#"{
            "stream": "ethusdt@depth20@500ms",
            "data": {
                "lastUpdateId": 160,
                "bids": [["3000.10", "4.0"]],
                "asks": [["3000.20", "2.0"]]
            }
        }"#;

        let events = BinanceAdapter::new(MarketType::Spot).handle_message(raw).unwrap();
        assert!(matches!(&events[..], [FeedEvent::Book { symbol, .. }] if symbol == "ETHUSDT"));
    }

    #[test]
    fn test_parse_agg_trade_side() {
        let raw = r#"{
            "stream": "btcusdt@aggTrade",
            "data": {"e": "aggTrade", "E": 1, "s": "BTCUSDT", "a": 5, "p": "50000.50",
                     "q": "0.5", "f": 1, "l": 2, "T": 1, "m": true}
        }"#;

        let events = futures().handle_message(raw).unwrap();
        match &events[..] {
            [FeedEvent::Trade { symbol, price, quantity, side, .. }] => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(*price, dec!(50000.50));
                assert_eq!(*quantity, dec!(0.5));
                assert_eq!(*side, Side::Ask);
            }
            other => panic!("Expected one trade event, got {other:?}"),
        }
    }

    #[test]
    fn test_subscription_ack_yields_nothing() {
        let events = futures().handle_message(r#"{"result":null,"id":1}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        assert!(futures().handle_message("{not json").is_err());
        let bad_level = r#"{"stream":"btcusdt@depth20@500ms","data":{"b":[["x","1"]],"a":[]}}"#;
        assert!(matches!(futures().handle_message(bad_level), Err(ScannerError::Parse(_))));
    }

    #[test]
    fn test_subscribe_message_lists_both_streams() {
        let adapter = futures();
        let msg = adapter.build_subscribe_message(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let value: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        assert_eq!(
            value["params"],
            serde_json::json!([
                "btcusdt@depth20@500ms",
                "btcusdt@aggTrade",
                "ethusdt@depth20@500ms",
                "ethusdt@aggTrade"
            ])
        );

        let next: Value = serde_json::from_str(&adapter.build_subscribe_message(&[])).unwrap();
        assert_ne!(value["id"], next["id"]);
    }

    #[test]
    fn test_instrument_filter() {
        let body = serde_json::json!({"symbols": [
            {"symbol": "BTCUSDT", "status": "TRADING", "quoteAsset": "USDT", "contractType": "PERPETUAL"},
            {"symbol": "BTCUSDT_240628", "status": "TRADING", "quoteAsset": "USDT", "contractType": "CURRENT_QUARTER"},
            {"symbol": "ETHBTC", "status": "TRADING", "quoteAsset": "BTC", "contractType": "PERPETUAL"},
            {"symbol": "LUNAUSDT", "status": "BREAK", "quoteAsset": "USDT", "contractType": "PERPETUAL"}
        ]});
        assert_eq!(futures().parse_instruments(&body).unwrap(), vec!["BTCUSDT"]);

        let spot_body = serde_json::json!({"symbols": [
            {"symbol": "SOLUSDT", "status": "TRADING", "quoteAsset": "USDT"}
        ]});
        let spot = BinanceAdapter::new(MarketType::Spot);
        assert_eq!(spot.parse_instruments(&spot_body).unwrap(), vec!["SOLUSDT"]);
    }

    #[test]
    fn test_volume_seed_sums_quote_volume() {
        let body = serde_json::json!([
            [0, "1", "1", "1", "1", "10", 0, "1500.5", 3, "0", "0", "0"],
            [0, "1", "1", "1", "1", "10", 0, "499.5", 3, "0", "0", "0"]
        ]);
        assert_eq!(futures().parse_volume_seed(&body).unwrap(), dec!(2000));
        assert!(futures()
            .volume_seed_url("btcusdt")
            .unwrap()
            .ends_with("/klines?symbol=BTCUSDT&interval=1m&limit=15"));
    }
}
