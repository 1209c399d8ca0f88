//! Alert publishing over IPC
//!
//! Forwards every raised alert to a Unix socket as a 4-byte big-endian
//! length followed by a MessagePack body.

use std::path::Path;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, ScannerError};
use crate::model::Alert;
use crate::telemetry;

/// Encode one alert as a length-prefixed frame
pub fn encode_frame(alert: &Alert) -> Result<BytesMut> {
    let body = rmp_serde::to_vec_named(alert)?;
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame)
}

/// Alert sink writing to a Unix socket
#[derive(Debug)]
pub struct AlertPublisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl AlertPublisher {
    /// Create a publisher; the socket is opened lazily if it is not ready yet
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        match publisher.open().await {
            Ok(stream) => *publisher.stream.lock().await = Some(stream),
            Err(e) => warn!(error = %e, "Initial IPC connection failed, will retry on publish"),
        }

        publisher
    }

    async fn open(&self) -> Result<UnixStream> {
        let path = Path::new(&self.socket_path);
        if !path.exists() {
            return Err(ScannerError::Ipc(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            ScannerError::Ipc(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;
        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(stream)
    }

    /// Write one alert; returns whether it reached the socket
    pub async fn publish(&self, alert: &Alert) -> Result<bool> {
        let frame = encode_frame(alert)?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            match self.open().await {
                Ok(stream) => *guard = Some(stream),
                Err(e) => {
                    debug!(error = %e, "IPC socket unavailable, alert dropped");
                    return Ok(false);
                }
            }
        }

        let Some(stream) = guard.as_mut() else {
            return Ok(false);
        };
        match stream.write_all(&frame).await {
            Ok(()) => {
                debug!(
                    instrument = %alert.instrument,
                    method = %alert.method,
                    "Published alert"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "Failed to write to IPC socket");
                *guard = None;
                Ok(false)
            }
        }
    }

    /// Forward alerts until the detector's channel closes
    pub async fn run(self, mut alerts: broadcast::Receiver<Alert>) {
        info!(path = %self.socket_path, "Alert publisher started");
        loop {
            match alerts.recv().await {
                Ok(alert) => {
                    if let Err(e) = self.publish(&alert).await {
                        warn!(error = %e, "Alert publish failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    telemetry::metrics()
                        .lagged_updates
                        .with_label_values(&["alert_publisher"])
                        .inc_by(skipped);
                    warn!(skipped, "Alert publisher lagging, alerts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Alert channel closed, publisher stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectionMethod, InstrumentKey, MarketType, Side, Venue};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn alert() -> Alert {
        Alert {
            instrument: InstrumentKey::new(Venue::Binance, MarketType::Futures, "BTCUSDT"),
            side: Side::Bid,
            method: DetectionMethod::Statistical,
            price: dec!(99),
            quantity: dec!(5000),
            notional: dec!(495000),
            distance_percent: dec!(-1),
            rolling_volume_15m: dec!(0),
            comment: Some("watch".into()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_frame_is_length_prefixed() {
        let frame = encode_frame(&alert()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[tokio::test]
    async fn test_missing_socket_drops_alert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let publisher = AlertPublisher::new(path.to_str().unwrap()).await;
        assert!(!publisher.publish(&alert()).await.unwrap());
    }

    #[tokio::test]
    async fn test_alert_reaches_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let publisher = AlertPublisher::new(path.to_str().unwrap()).await;
        let (mut socket, _) = listener.accept().await.unwrap();

        let sent = alert();
        assert!(tokio_test::assert_ok!(publisher.publish(&sent).await));

        let len = socket.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        socket.read_exact(&mut body).await.unwrap();
        let received: Alert = rmp_serde::from_slice(&body).unwrap();
        assert_eq!(received, sent);
    }
}
