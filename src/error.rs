//! Error types for the density scanner

use thiserror::Error;

/// Scanner errors
///
/// Everything raised inside a feed connection is logged and counted at the
/// connection boundary; these values never unwind into the analytics pipeline.
#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("WebSocket connect failed: {0}")]
    WebSocketConnection(String),

    #[error("Venue rejected request: {0}")]
    WebSocketMessage(String),

    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("REST request failed: {0}")]
    RestApi(String),

    #[error("Alert socket error: {0}")]
    Ipc(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Alert encoding failed: {0}")]
    Serialization(String),

    #[error("Timed out opening the feed connection")]
    ConnectionTimeout,

    #[error("Feed is not connected")]
    NotConnected,

    #[error("Reconnect budget of {0} attempts spent")]
    ReconnectExhausted(u32),
}

impl From<tokio_tungstenite::tungstenite::Error> for ScannerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ScannerError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for ScannerError {
    fn from(err: serde_json::Error) -> Self {
        ScannerError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for ScannerError {
    fn from(err: reqwest::Error) -> Self {
        ScannerError::RestApi(err.to_string())
    }
}

impl From<std::io::Error> for ScannerError {
    fn from(err: std::io::Error) -> Self {
        ScannerError::Ipc(err.to_string())
    }
}

impl From<config::ConfigError> for ScannerError {
    fn from(err: config::ConfigError) -> Self {
        ScannerError::Config(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ScannerError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ScannerError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScannerError>;
