//! Prometheus metrics
//!
//! Registered once into the default registry and served by the health server
//! at `/metrics`. Connection counters mirror [`crate::feed::ConnectionStatus`].

use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts};
use tracing::warn;

const FEED_LABELS: &[&str] = &["venue", "market"];

pub struct Telemetry {
    pub messages_received: IntCounterVec,
    pub parse_errors: IntCounterVec,
    pub book_updates: IntCounterVec,
    pub trade_updates: IntCounterVec,
    pub reconnects: IntCounterVec,
    pub connected: IntGaugeVec,
    pub subscribed_symbols: IntGaugeVec,
    pub alerts_emitted: IntCounterVec,
    pub alerts_suppressed: IntCounterVec,
    pub lagged_updates: IntCounterVec,
    pub tracked_densities: IntGauge,
}

static TELEMETRY: OnceLock<Telemetry> = OnceLock::new();

/// Process-wide metric handles
pub fn metrics() -> &'static Telemetry {
    TELEMETRY.get_or_init(Telemetry::register)
}

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = prometheus::register(Box::new(collector.clone())) {
        warn!(error = %e, "Failed to register metric");
    }
    collector
}

// Metric definitions are static, construction only fails on malformed names
fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    register(IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter definition"))
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    register(IntGaugeVec::new(Opts::new(name, help), labels).expect("valid gauge definition"))
}

impl Telemetry {
    fn register() -> Self {
        Self {
            messages_received: counter_vec(
                "density_feed_messages_total",
                "Messages received per feed",
                FEED_LABELS,
            ),
            parse_errors: counter_vec(
                "density_feed_parse_errors_total",
                "Messages that failed to parse",
                FEED_LABELS,
            ),
            book_updates: counter_vec(
                "density_feed_book_updates_total",
                "Book updates applied to the store",
                FEED_LABELS,
            ),
            trade_updates: counter_vec(
                "density_feed_trade_updates_total",
                "Trades applied to rolling volume",
                FEED_LABELS,
            ),
            reconnects: counter_vec(
                "density_feed_reconnects_total",
                "Scheduled reconnect attempts",
                FEED_LABELS,
            ),
            connected: gauge_vec("density_feed_connected", "1 while the feed is connected", FEED_LABELS),
            subscribed_symbols: gauge_vec(
                "density_feed_subscribed_symbols",
                "Symbols recorded as subscribed",
                FEED_LABELS,
            ),
            alerts_emitted: counter_vec(
                "density_alerts_total",
                "Alerts raised",
                &["method", "side"],
            ),
            alerts_suppressed: counter_vec(
                "density_alerts_suppressed_total",
                "Alerts suppressed by cooldown",
                &["method"],
            ),
            lagged_updates: counter_vec(
                "density_lagged_updates_total",
                "Events skipped by a lagging consumer",
                &["consumer"],
            ),
            tracked_densities: register(
                IntGauge::new("density_tracked_levels", "Currently tracked densities")
                    .expect("valid gauge definition"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_registered_once() {
        let first = metrics() as *const Telemetry;
        let second = metrics() as *const Telemetry;
        assert_eq!(first, second);

        metrics()
            .messages_received
            .with_label_values(&["binance", "futures"])
            .inc();
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "density_feed_messages_total"));
    }
}
