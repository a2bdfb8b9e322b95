//! Aggregator Facade - history seed plus live subscription into one window
//!
//! ```text
//! TelemetrySource ──load_history──► TelemetryBuffer (seed)
//!                                        ▲
//! Connector ──StreamConnection──► decoder┘ (append)
//!
//! AggregatorHandle ──► snapshot() / last_error() / changes() / close()
//! ```
//!
//! The seed always completes (success or failure) before the subscription is
//! started, so a late history response can never overwrite live readings.
//! After `close()` returns, nothing is applied to the buffer any more: the
//! pending history result is discarded and late messages are dropped.

use crate::config::AggregatorConfig;
use crate::history::{load_history, FetchError, StaticToken, TelemetryClient, TelemetrySource};
use crate::stream_core::{
    ConnectionError, ConnectionState, Connector, StreamConnection, StreamHandler, StreamSettings,
    WebSocketConnector,
};
use crate::telemetry::{reading_from_message, DecodeError, Reading, Scope, Snapshot, TelemetryBuffer};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Last thing that went wrong on any path of an aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorError {
    /// A live message whose envelope could not be decoded (the message was dropped)
    Decode(DecodeError),
    /// The history query failed (the window started empty)
    Fetch(FetchError),
    /// The subscription failed (the window keeps what it had)
    Connection(ConnectionError),
}

impl From<DecodeError> for AggregatorError {
    fn from(err: DecodeError) -> Self {
        AggregatorError::Decode(err)
    }
}

impl From<FetchError> for AggregatorError {
    fn from(err: FetchError) -> Self {
        AggregatorError::Fetch(err)
    }
}

impl From<ConnectionError> for AggregatorError {
    fn from(err: ConnectionError) -> Self {
        AggregatorError::Connection(err)
    }
}

impl std::fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregatorError::Decode(e) => write!(f, "{}", e),
            AggregatorError::Fetch(e) => write!(f, "{}", e),
            AggregatorError::Connection(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AggregatorError {}

/// Factory for aggregator handles sharing one source, connector and settings
pub struct TelemetryAggregator {
    source: Arc<dyn TelemetrySource>,
    connector: Arc<dyn Connector>,
    stream: StreamSettings,
    capacity: usize,
}

impl TelemetryAggregator {
    pub fn new(source: Arc<dyn TelemetrySource>, connector: Arc<dyn Connector>) -> Self {
        Self {
            source,
            connector,
            stream: StreamSettings::new("", "localhost"),
            capacity: crate::telemetry::DEFAULT_CAPACITY,
        }
    }

    /// HTTP history source and WebSocket push endpoint from configuration
    pub fn from_config(config: &AggregatorConfig) -> Result<Self, FetchError> {
        let client = TelemetryClient::new(
            &config.api_url,
            Arc::new(StaticToken(config.token.clone())),
            config.http_timeout,
        )?;

        let mut stream = StreamSettings::new("", &config.ws_host());
        stream.bearer_token = config.token.clone();
        stream.connect_timeout = config.connect_timeout;
        stream.reconnect = config.reconnect.clone();

        Ok(Self {
            source: Arc::new(client),
            connector: Arc::new(WebSocketConnector::new(&config.ws_url)),
            stream,
            capacity: config.buffer_capacity,
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Settings for each subscription; the topic is replaced by the scope's
    pub fn with_stream_settings(mut self, settings: StreamSettings) -> Self {
        self.stream = settings;
        self
    }

    /// Start loading history for `scope`, then subscribe to its topic
    ///
    /// Returns immediately. Fails without a tokio runtime to run the load on.
    pub fn open(&self, scope: Scope) -> Result<AggregatorHandle, AggregatorError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectionError::Transport(format!("no async runtime: {}", e)))?;

        let mut settings = self.stream.clone();
        settings.topic = scope.topic();

        let (revision, _) = watch::channel(0u64);
        let (settled, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            connection: StreamConnection::new(Arc::clone(&self.connector), settings),
            buffer: TelemetryBuffer::with_capacity(self.capacity),
            scope,
            closed: Mutex::new(false),
            last_error: Mutex::new(None),
            revision,
            settled,
        });

        log::info!("🚀 Opening telemetry aggregator for {}", inner.scope);

        let loader = runtime.spawn(seed_then_subscribe(
            Arc::clone(&inner),
            Arc::clone(&self.source),
        ));

        Ok(AggregatorHandle {
            inner,
            loader: Mutex::new(Some(loader)),
        })
    }
}

struct Inner {
    scope: Scope,
    buffer: TelemetryBuffer,
    connection: StreamConnection,
    /// Held while applying anything to the buffer so close() fences ingestion
    closed: Mutex<bool>,
    last_error: Mutex<Option<AggregatorError>>,
    revision: watch::Sender<u64>,
    settled: watch::Sender<bool>,
}

impl Inner {
    /// Run `apply` against the buffer unless closed; returns whether it ran
    fn ingest(&self, apply: impl FnOnce(&TelemetryBuffer)) -> bool {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        apply(&self.buffer);
        drop(closed);

        self.revision.send_modify(|r| *r += 1);
        true
    }

    fn record_error(&self, error: AggregatorError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_stream(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let handler: Arc<dyn StreamHandler> = Arc::new(LiveIngest {
            inner: Arc::downgrade(self),
        });
        self.connection.start(handler)
    }
}

async fn seed_then_subscribe(inner: Arc<Inner>, source: Arc<dyn TelemetrySource>) {
    let result = load_history(source.as_ref(), &inner.scope).await;

    let applied = match result {
        Ok(readings) => {
            let count = readings.len();
            let applied = inner.ingest(|buffer| buffer.seed(readings));
            if applied {
                log::info!("🌱 Seeded window with {} readings", count.min(inner.buffer.capacity()));
            }
            applied
        }
        Err(e) => {
            let open = !inner.is_closed();
            if open {
                log::warn!("⚠️  Starting with an empty window: {}", e);
                inner.record_error(e.into());
            }
            open
        }
    };
    inner.settled.send_replace(true);

    if !applied {
        log::info!("History for {} arrived after close, discarded", inner.scope);
        return;
    }

    if let Err(e) = inner.start_stream() {
        if !inner.is_closed() {
            inner.record_error(e.into());
        }
    }
}

struct LiveIngest {
    inner: Weak<Inner>,
}

impl StreamHandler for LiveIngest {
    fn on_message(&self, body: String) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        match reading_from_message(&body) {
            Ok(reading) => {
                log::debug!(
                    "📊 {} @ {:?}: temperature={:?} humidity={:?}",
                    reading.device_id,
                    reading.timestamp,
                    reading.temperature(),
                    reading.humidity()
                );
                if !inner.ingest(|buffer| {
                    buffer.append(reading);
                }) {
                    log::debug!("Dropping live reading received after close");
                }
            }
            Err(e) => {
                log::warn!("⚠️  Dropping telemetry message: {}", e);
                inner.record_error(e.into());
            }
        }
    }

    fn on_error(&self, error: ConnectionError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.record_error(error.into());
        }
    }
}

/// An open aggregator; closing it (or dropping it) tears down the subscription
pub struct AggregatorHandle {
    inner: Arc<Inner>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl AggregatorHandle {
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Current window, oldest first; unaffected by later mutations
    pub fn snapshot(&self) -> Snapshot {
        self.inner.buffer.snapshot()
    }

    /// Most recent error from any path; not cleared by later successes
    pub fn last_error(&self) -> Option<AggregatorError> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    /// Revision counter bumped on every change to the window
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Wait until the history load has been applied, failed, or discarded
    pub async fn history_settled(&self) {
        let mut settled = self.inner.settled.subscribe();
        let _ = settled.wait_for(|done| *done).await;
    }

    /// Start a fresh subscription after the previous one failed
    ///
    /// Only valid from `Failed`. While history is still loading the
    /// subscription is already pending, so this is `AlreadyActive`.
    pub fn restart(&self) -> Result<(), AggregatorError> {
        if self.inner.is_closed() {
            return Err(ConnectionError::Terminated.into());
        }
        let settled = *self.inner.settled.borrow();
        match self.connection_state() {
            ConnectionState::Failed if settled => {}
            ConnectionState::Closed => return Err(ConnectionError::Terminated.into()),
            _ => return Err(ConnectionError::AlreadyActive.into()),
        }

        log::info!("🔄 Restarting subscription for {}", self.inner.scope);
        self.inner.start_stream().map_err(AggregatorError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stop ingesting and tear down the subscription; idempotent
    ///
    /// The window stays readable through `snapshot()`.
    pub fn close(&self) {
        {
            let mut closed = self.inner.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                return;
            }
            *closed = true;
        }

        if let Some(loader) = self
            .loader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            loader.abort();
        }
        self.inner.connection.stop();
        self.inner.settled.send_replace(true);

        log::info!(
            "👋 Closed telemetry aggregator for {} ({} readings kept)",
            self.inner.scope,
            self.inner.buffer.len()
        );
    }

    /// Latest reading, if any
    pub fn latest(&self) -> Option<Reading> {
        self.snapshot().latest().cloned()
    }
}

impl Drop for AggregatorHandle {
    fn drop(&mut self) {
        self.close();
    }
}
