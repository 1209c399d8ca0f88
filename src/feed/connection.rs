//! Feed connection lifecycle
//!
//! One [`FeedConnection`] per (venue, market). States move
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...`
//! and settle in `Disconnected` once the reconnect budget is spent; only an
//! explicit [`FeedConnection::restart`] leaves that state.
//!
//! Each open transport is a session with its own generation number and four
//! tasks: writer, reader, keepalive and staleness watchdog. Events from an
//! older generation are ignored, so a late close from a torn-down session can
//! never schedule a second reconnect.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::policy::ConnectionSettings;
use super::venue::{FeedEvent, VenueAdapter};
use crate::error::{Result, ScannerError};
use crate::model::{InstrumentKey, MarketType, TradeTick, Venue};
use crate::orderbook::OrderBookStore;
use crate::telemetry;
use crate::volume::VolumeAggregator;

const RAW_PREVIEW_CHARS: usize = 300;
const ERROR_PREVIEW_CHARS: usize = 200;
const CONNECT_POLL: Duration = Duration::from_millis(50);
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What a feed event turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedEvent {
    Book,
    Trade,
    LastPrice,
}

/// Applies normalized venue events to the analytics inputs
#[derive(Debug, Clone)]
pub struct FeedSink {
    store: Arc<OrderBookStore>,
    volume: Arc<VolumeAggregator>,
}

impl FeedSink {
    pub fn new(store: Arc<OrderBookStore>, volume: Arc<VolumeAggregator>) -> Self {
        Self { store, volume }
    }

    pub fn apply(&self, venue: Venue, market: MarketType, event: FeedEvent) -> AppliedEvent {
        match event {
            FeedEvent::Book {
                symbol,
                bids,
                asks,
                last_price,
            } => {
                let key = InstrumentKey::new(venue, market, &symbol);
                self.store.update(key, bids, asks, last_price);
                AppliedEvent::Book
            }
            FeedEvent::Trade {
                symbol,
                price,
                quantity,
                side,
                observed_at,
            } => {
                let tick = TradeTick {
                    instrument: InstrumentKey::new(venue, market, &symbol),
                    price,
                    quantity,
                    side,
                    observed_at,
                };
                self.store.update_last_price(&tick.instrument, tick.price);
                self.volume.record_trade(&tick);
                AppliedEvent::Trade
            }
            FeedEvent::LastPrice { symbol, price } => {
                let key = InstrumentKey::new(venue, market, &symbol);
                self.store.update_last_price(&key, price);
                AppliedEvent::LastPrice
            }
        }
    }
}

/// Read-only operational view of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub venue: Venue,
    pub market: MarketType,
    pub state: ConnectionState,
    pub connected: bool,
    pub exhausted: bool,
    pub reconnect_attempts: u32,
    pub messages_received: u64,
    pub parse_errors: u64,
    pub book_updates: u64,
    pub trade_updates: u64,
    pub seconds_since_last_message: Option<i64>,
    pub subscribed_symbols: usize,
}

#[derive(Debug, Default)]
struct Counters {
    messages_received: AtomicU64,
    parse_errors: AtomicU64,
    book_updates: AtomicU64,
    trade_updates: AtomicU64,
}

#[derive(Debug)]
struct Session {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

impl Session {
    /// Abort everything but the writer, which is left to flush a close frame
    fn abort_background(&self) {
        self.reader.abort();
        self.keepalive.abort();
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }

    fn abort(self) {
        self.abort_background();
        self.writer.abort();
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    reconnect_attempts: u32,
    exhausted: bool,
    /// Set by `disconnect`, cleared by `connect`; suppresses automatic reconnects
    stopped: bool,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    session: Option<Session>,
    reconnect_task: Option<JoinHandle<()>>,
    subscribed: BTreeSet<String>,
}

/// Generic lifecycle engine parameterized by a [`VenueAdapter`]
pub struct FeedConnection {
    adapter: Arc<dyn VenueAdapter>,
    sink: FeedSink,
    settings: ConnectionSettings,
    /// Serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
    reconnect_pending: AtomicBool,
    counters: Counters,
    /// Unix millis of the last received frame, zero before the first
    last_message_ms: AtomicI64,
    self_ref: Weak<FeedConnection>,
}

impl std::fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection")
            .field("venue", &self.adapter.venue())
            .field("market", &self.adapter.market())
            .field("state", &self.state())
            .finish()
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl FeedConnection {
    pub fn new(adapter: Arc<dyn VenueAdapter>, sink: FeedSink, settings: ConnectionSettings) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            adapter,
            sink,
            settings,
            lifecycle: tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                generation: 0,
                reconnect_attempts: 0,
                exhausted: false,
                stopped: false,
                outbound: None,
                session: None,
                reconnect_task: None,
                subscribed: BTreeSet::new(),
            }),
            reconnect_pending: AtomicBool::new(false),
            counters: Counters::default(),
            last_message_ms: AtomicI64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn venue(&self) -> Venue {
        self.adapter.venue()
    }

    pub fn market(&self) -> MarketType {
        self.adapter.market()
    }

    pub fn adapter(&self) -> &Arc<dyn VenueAdapter> {
        &self.adapter
    }

    /// `VENUE:MARKET` tag used in logs
    pub fn label(&self) -> String {
        format!("{}:{}", self.venue(), self.market())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect budget spent; needs an explicit restart
    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().exhausted
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.inner.lock().subscribed.iter().cloned().collect()
    }

    fn metric_labels(&self) -> [&'static str; 2] {
        [self.venue().as_str(), self.market().as_str()]
    }

    fn touch(&self) {
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn millis_since_last_message(&self) -> Option<i64> {
        match self.last_message_ms.load(Ordering::Relaxed) {
            0 => None,
            last => Some((Utc::now().timestamp_millis() - last).max(0)),
        }
    }

    /// Open the transport; no-op while already connecting or connected
    pub async fn connect(&self) -> Result<()> {
        self.open_session().await.map(|_| ())
    }

    /// Returns `true` only when this call opened the session
    async fn open_session(&self) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ConnectionState::Connecting | ConnectionState::Connected) {
                return Ok(false);
            }
            if inner.exhausted {
                return Err(ScannerError::ReconnectExhausted(self.settings.reconnect.max_attempts));
            }
            inner.stopped = false;
            inner.state = ConnectionState::Connecting;
        }

        let url = self.adapter.websocket_url();
        info!(venue = %self.venue(), market = %self.market(), url = %url, "Connecting to venue WebSocket");

        let ws_stream = match timeout(self.settings.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                ws_stream
            }
            Ok(Err(e)) => {
                warn!(venue = %self.venue(), market = %self.market(), error = %e, "WebSocket connect failed");
                self.on_connect_failure();
                return Err(e.into());
            }
            Err(_) => {
                warn!(venue = %self.venue(), market = %self.market(), "WebSocket connect timed out");
                self.on_connect_failure();
                return Err(ScannerError::ConnectionTimeout);
            }
        };

        let Some(this) = self.self_ref.upgrade() else {
            return Err(ScannerError::NotConnected);
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let generation = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = ConnectionState::Connected;
            inner.reconnect_attempts = 0;
            inner.exhausted = false;
            inner.outbound = Some(tx.clone());
            inner.generation
        };
        self.touch();

        let writer = {
            let this = this.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = write.send(message).await {
                        warn!(error = %e, "WebSocket write failed");
                        this.handle_disconnect(generation, "write failed");
                        return;
                    }
                    if closing {
                        return;
                    }
                }
            })
        };

        let reader = {
            let this = this.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reason = loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => this.on_text(&text),
                        Some(Ok(Message::Binary(data))) => {
                            let text = String::from_utf8_lossy(&data).to_string();
                            this.on_text(&text);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            this.touch();
                            let _ = tx.send(Message::Pong(data));
                        }
                        Some(Ok(Message::Pong(_))) => this.touch(),
                        Some(Ok(Message::Close(frame))) => {
                            info!(frame = ?frame, "Received close frame");
                            break "closed by venue";
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket read error");
                            break "transport error";
                        }
                        None => break "stream ended",
                    }
                };
                this.handle_disconnect(generation, reason);
            })
        };

        let keepalive = {
            let tx = tx.clone();
            let ping_text = self.adapter.ping_message();
            let period = self.adapter.ping_interval();
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let ping = match &ping_text {
                        Some(text) => Message::Text(text.clone()),
                        None => Message::Ping(Vec::new()),
                    };
                    if tx.send(ping).is_err() {
                        break;
                    }
                }
            })
        };

        let watchdog = self.adapter.staleness_threshold().map(|threshold| {
            let this = this.clone();
            let check_every = self.settings.watchdog_interval;
            tokio::spawn(async move {
                let mut ticker = interval(check_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if this.is_stale(threshold) {
                        warn!(
                            venue = %this.venue(),
                            market = %this.market(),
                            silent_ms = ?this.millis_since_last_message(),
                            "No messages within staleness threshold, recycling connection"
                        );
                        this.force_close(generation);
                        break;
                    }
                }
            })
        });

        for frame in self.adapter.on_connected() {
            let _ = tx.send(Message::Text(frame));
        }

        let session = Session {
            writer,
            reader,
            keepalive,
            watchdog,
        };
        // The reader may already have seen the transport drop
        let orphaned = {
            let mut inner = self.inner.lock();
            if inner.generation == generation && inner.state == ConnectionState::Connected {
                inner.session = Some(session);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = orphaned {
            session.abort();
            return Err(ScannerError::NotConnected);
        }
        telemetry::metrics()
            .connected
            .with_label_values(&self.metric_labels())
            .set(1);
        info!(venue = %self.venue(), market = %self.market(), generation, "Connected, ready to subscribe");
        Ok(true)
    }

    /// Connect and poll until connected or `wait` elapses
    pub async fn connect_and_wait(&self, wait: Duration) -> bool {
        if self.is_connected() {
            return true;
        }
        let deadline = Instant::now() + wait;
        match self.connect().await {
            Err(e @ ScannerError::ReconnectExhausted(_)) => {
                warn!(venue = %self.venue(), market = %self.market(), error = %e, "Not connecting until restarted");
                return false;
            }
            Err(e) => debug!(error = %e, "Connect attempt failed"),
            Ok(()) => {}
        }
        loop {
            if self.is_connected() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(CONNECT_POLL).await;
        }
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        let has_symbols = !self.inner.lock().subscribed.is_empty();
        has_symbols
            && self
                .millis_since_last_message()
                .is_some_and(|ms| ms > threshold.as_millis() as i64)
    }

    fn force_close(&self, generation: u64) {
        if let Some(tx) = self.inner.lock().outbound.clone() {
            let _ = tx.send(Message::Close(None));
        }
        self.handle_disconnect(generation, "stale");
    }

    fn on_connect_failure(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Connecting {
                inner.state = ConnectionState::Reconnecting;
            }
        }
        self.schedule_reconnect();
    }

    /// Transport of `generation` went away; ignored for stale sessions and explicit disconnects
    fn handle_disconnect(&self, generation: u64, reason: &str) {
        let session = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Reconnecting;
            inner.outbound = None;
            inner.session.take()
        };

        telemetry::metrics()
            .connected
            .with_label_values(&self.metric_labels())
            .set(0);
        warn!(venue = %self.venue(), market = %self.market(), reason, "Feed disconnected");

        self.schedule_reconnect();
        if let Some(session) = session {
            session.abort();
        }
    }

    fn schedule_reconnect(&self) {
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already pending");
            return;
        }

        let scheduled = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                None
            } else {
                inner.reconnect_attempts += 1;
                let attempt = inner.reconnect_attempts;
                match self.settings.reconnect.delay_for(attempt) {
                    Some(delay) => {
                        inner.state = ConnectionState::Reconnecting;
                        Some((attempt, delay))
                    }
                    None => {
                        inner.state = ConnectionState::Disconnected;
                        inner.exhausted = true;
                        error!(
                            venue = %self.venue(),
                            market = %self.market(),
                            attempts = attempt - 1,
                            "Max reconnect attempts reached, giving up until restarted"
                        );
                        None
                    }
                }
            }
        };

        let (Some((attempt, delay)), Some(this)) = (scheduled, self.self_ref.upgrade()) else {
            self.reconnect_pending.store(false, Ordering::SeqCst);
            return;
        };

        telemetry::metrics()
            .reconnects
            .with_label_values(&self.metric_labels())
            .inc();
        warn!(
            venue = %self.venue(),
            market = %self.market(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            this.reconnect_pending.store(false, Ordering::SeqCst);
            // A failed attempt has already scheduled the next one, which owns the replay
            match this.open_session().await {
                Ok(true) => {
                    info!(venue = %this.venue(), market = %this.market(), "Reconnected");
                    this.resubscribe_all().await;
                }
                Ok(false) => debug!("Already connected, reconnect skipped"),
                Err(e) => debug!(error = %e, "Reconnect attempt failed"),
            }
        });
        self.inner.lock().reconnect_task = Some(handle);
    }

    /// Close the transport and cancel every timer; idempotent
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let (previous, session, outbound, reconnect_task) = {
            let mut inner = self.inner.lock();
            inner.stopped = true;
            let previous = inner.state;
            inner.state = ConnectionState::Disconnected;
            (
                previous,
                inner.session.take(),
                inner.outbound.take(),
                inner.reconnect_task.take(),
            )
        };
        self.reconnect_pending.store(false, Ordering::SeqCst);

        if let Some(task) = reconnect_task {
            task.abort();
        }
        if let Some(session) = session {
            session.abort_background();
            if let Some(tx) = outbound {
                let _ = tx.send(Message::Close(None));
            }
            let mut writer = session.writer;
            if timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        }

        telemetry::metrics()
            .connected
            .with_label_values(&self.metric_labels())
            .set(0);
        if previous != ConnectionState::Disconnected {
            info!(venue = %self.venue(), market = %self.market(), "Disconnected");
        }
    }

    /// Operator action: reset the reconnect budget, reconnect and replay subscriptions
    pub async fn restart(&self) -> Result<()> {
        self.disconnect().await;
        {
            let mut inner = self.inner.lock();
            inner.reconnect_attempts = 0;
            inner.exhausted = false;
        }
        info!(venue = %self.venue(), market = %self.market(), "Restarting connection");
        if self.open_session().await? {
            self.resubscribe_all().await;
        }
        Ok(())
    }

    /// Send subscribe frames for `symbols` and record them for replay
    ///
    /// Returns `false` without sending anything when not connected.
    pub fn subscribe(&self, symbols: &[String]) -> bool {
        let outbound = {
            let inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connected => inner.outbound.clone(),
                _ => None,
            }
        };
        let Some(tx) = outbound else {
            warn!(venue = %self.venue(), market = %self.market(), "Cannot subscribe, not connected");
            return false;
        };

        let symbols: Vec<String> = symbols.iter().map(|s| s.trim().to_uppercase()).collect();
        for batch in symbols.chunks(self.adapter.subscribe_batch_size().max(1)) {
            let message = self.adapter.build_subscribe_message(batch);
            if tx.send(Message::Text(message)).is_err() {
                warn!(venue = %self.venue(), market = %self.market(), "Subscribe failed, writer closed");
                return false;
            }
        }

        let total = {
            let mut inner = self.inner.lock();
            inner.subscribed.extend(symbols.iter().cloned());
            inner.subscribed.len()
        };
        telemetry::metrics()
            .subscribed_symbols
            .with_label_values(&self.metric_labels())
            .set(total as i64);
        debug!(venue = %self.venue(), market = %self.market(), symbols = symbols.len(), "Subscribed");
        true
    }

    /// Wait for the connection, then subscribe in paced batches; returns the symbols sent
    pub async fn subscribe_all(&self, symbols: Vec<String>) -> usize {
        let mut symbols: Vec<String> = symbols
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let max = self.adapter.max_symbols();
        if symbols.len() > max {
            warn!(
                venue = %self.venue(),
                market = %self.market(),
                requested = symbols.len(),
                max,
                "Limiting symbols to the per-connection maximum"
            );
            symbols.truncate(max);
        }

        if !self.connect_and_wait(self.settings.connect_timeout).await {
            error!(venue = %self.venue(), market = %self.market(), "Failed to connect, aborting subscribe");
            return 0;
        }
        let sent = self.send_batches(&symbols).await;
        info!(venue = %self.venue(), market = %self.market(), symbols = sent, "Subscribed to symbols");
        sent
    }

    async fn send_batches(&self, symbols: &[String]) -> usize {
        let mut sent = 0;
        for (i, batch) in symbols.chunks(self.adapter.subscribe_batch_size().max(1)).enumerate() {
            if i > 0 {
                sleep(self.settings.subscribe_batch_delay).await;
            }
            if !self.subscribe(batch) {
                break;
            }
            sent += batch.len();
        }
        sent
    }

    /// Replay every recorded symbol after a reconnect
    async fn resubscribe_all(&self) {
        let symbols = self.subscribed_symbols();
        if symbols.is_empty() {
            return;
        }
        info!(venue = %self.venue(), market = %self.market(), symbols = symbols.len(), "Resubscribing");
        self.send_batches(&symbols).await;
    }

    fn on_text(&self, text: &str) {
        self.touch();
        let received = self.counters.messages_received.fetch_add(1, Ordering::Relaxed) + 1;
        let labels = self.metric_labels();
        telemetry::metrics().messages_received.with_label_values(&labels).inc();

        if received <= self.settings.raw_message_log_limit {
            debug!(
                venue = %self.venue(),
                market = %self.market(),
                n = received,
                preview = %preview(text, RAW_PREVIEW_CHARS),
                "Raw message"
            );
        }
        if self.adapter.is_pong(text) {
            return;
        }

        match self.adapter.handle_message(text) {
            Ok(events) => {
                for event in events {
                    match self.sink.apply(self.venue(), self.market(), event) {
                        AppliedEvent::Book => {
                            self.counters.book_updates.fetch_add(1, Ordering::Relaxed);
                            telemetry::metrics().book_updates.with_label_values(&labels).inc();
                        }
                        AppliedEvent::Trade => {
                            self.counters.trade_updates.fetch_add(1, Ordering::Relaxed);
                            telemetry::metrics().trade_updates.with_label_values(&labels).inc();
                        }
                        AppliedEvent::LastPrice => {}
                    }
                }
            }
            Err(e) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                telemetry::metrics().parse_errors.with_label_values(&labels).inc();
                warn!(
                    venue = %self.venue(),
                    market = %self.market(),
                    error = %e,
                    preview = %preview(text, ERROR_PREVIEW_CHARS),
                    "Failed to parse message"
                );
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock();
        ConnectionStatus {
            venue: self.venue(),
            market: self.market(),
            state: inner.state,
            connected: inner.state == ConnectionState::Connected,
            exhausted: inner.exhausted,
            reconnect_attempts: inner.reconnect_attempts,
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            parse_errors: self.counters.parse_errors.load(Ordering::Relaxed),
            book_updates: self.counters.book_updates.load(Ordering::Relaxed),
            trade_updates: self.counters.trade_updates.load(Ordering::Relaxed),
            seconds_since_last_message: self.millis_since_last_message().map(|ms| ms / 1000),
            subscribed_symbols: inner.subscribed.len(),
        }
    }

    /// One-line summary for periodic status logs
    pub fn status_summary(&self) -> String {
        let status = self.status();
        let last = status
            .seconds_since_last_message
            .map_or_else(|| "never".to_string(), |s| format!("{s}s ago"));
        format!(
            "[{}:{}] state={:?} symbols={} msgs={} books={} trades={} errors={} last={}{}",
            status.venue,
            status.market,
            status.state,
            status.subscribed_symbols,
            status.messages_received,
            status.book_updates,
            status.trade_updates,
            status.parse_errors,
            last,
            if status.exhausted { " EXHAUSTED" } else { "" }
        )
    }
}
