//! Stream Connection Manager
//!
//! Owns at most one push-subscription session and delivers every inbound
//! MESSAGE body, unmodified and in transport order, to a `StreamHandler`.
//!
//! ```text
//! Idle ──start()──► Connecting ──CONNECTED + SUBSCRIBE──► Subscribed
//!                      │                                     │
//!                      └────── transport / STOMP error ──────┴──► Failed
//!
//! any state ──stop()──► Closed (terminal)
//! Failed ──start()──► Connecting (fresh session)
//! Failed ──backoff (when enabled)──► Connecting
//! ```

use super::error_handler::ReconnectPolicy;
use super::stomp::{Command, Frame};
use super::transport::{ConnectionError, Connector, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const SUBSCRIPTION_ID: &str = "sub-0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Subscribed,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Receives the output of a subscription session
pub trait StreamHandler: Send + Sync {
    /// One inbound message body, exactly as delivered by the transport
    fn on_message(&self, body: String);

    /// A session failure
    ///
    /// Called once per transition into `Failed`. When reconnect is enabled and
    /// gives up, it is called once more with `RetriesExhausted` while the state
    /// stays `Failed`.
    fn on_error(&self, error: ConnectionError);
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// STOMP destination to subscribe to
    pub topic: String,
    /// Value of the CONNECT `host` header
    pub host: String,
    pub bearer_token: Option<String>,
    /// Bound on socket open plus STOMP handshake
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl StreamSettings {
    pub fn new(topic: &str, host: &str) -> Self {
        Self {
            topic: topic.to_string(),
            host: host.to_string(),
            bearer_token: None,
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::disabled(),
        }
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl Shared {
    /// Apply a transition on behalf of session `generation`
    ///
    /// Rejected once the manager is closed or a newer session has started.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let mut allowed = false;
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed
                || self.generation.load(Ordering::SeqCst) != generation
            {
                return false;
            }
            allowed = true;
            if *current == next {
                return false;
            }
            log::debug!("Connection {} → {}", current.as_str(), next.as_str());
            *current = next;
            true
        });
        allowed
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && *self.state.borrow() == ConnectionState::Subscribed
    }
}

struct Session {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct StreamConnection {
    connector: Arc<dyn Connector>,
    settings: StreamSettings,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl StreamConnection {
    pub fn new(connector: Arc<dyn Connector>, settings: StreamSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            connector,
            settings,
            shared: Arc::new(Shared {
                state,
                generation: AtomicU64::new(0),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    /// Open a new session from `Idle` or `Failed`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, handler: Arc<dyn StreamHandler>) -> Result<(), ConnectionError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectionError::Transport(format!("no async runtime: {}", e)))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        let mut rejected = None;
        let mut generation = 0;
        self.shared.state.send_if_modified(|current| match *current {
            ConnectionState::Connecting | ConnectionState::Subscribed => {
                rejected = Some(ConnectionError::AlreadyActive);
                false
            }
            ConnectionState::Closed => {
                rejected = Some(ConnectionError::Terminated);
                false
            }
            ConnectionState::Idle | ConnectionState::Failed => {
                generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *current = ConnectionState::Connecting;
                true
            }
        });
        if let Some(err) = rejected {
            return Err(err);
        }

        // A failed session may still be waiting out its backoff
        if let Some(previous) = session.take() {
            let _ = previous.shutdown.send(true);
        }

        log::info!(
            "🔌 Connecting to {} (topic {})",
            self.connector.endpoint(),
            self.settings.topic
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(run_session(
            Arc::clone(&self.connector),
            self.settings.clone(),
            Arc::clone(&self.shared),
            generation,
            handler,
            shutdown_rx,
        ));

        *session = Some(Session {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Release the subscription and socket; idempotent, callable from any state
    ///
    /// The session task sends UNSUBSCRIBE and DISCONNECT and closes the socket
    /// in the background. Use `stop_and_wait` to wait for that teardown.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let previous = self.shared.state.send_replace(ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            log::info!("🔌 Connection closed (was {})", previous.as_str());
        }

        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let _ = session.shutdown.send(true);
        Some(session.task)
    }

    /// `stop`, then wait for the session task to finish its teardown
    pub async fn stop_and_wait(&self) {
        if let Some(task) = self.stop() {
            if let Err(e) = task.await {
                log::warn!("Session task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionEnd {
    Stopped,
}

async fn run_session(
    connector: Arc<dyn Connector>,
    settings: StreamSettings,
    shared: Arc<Shared>,
    generation: u64,
    handler: Arc<dyn StreamHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = settings.reconnect.backoff();

    loop {
        let mut subscribed = false;
        let outcome = run_once(
            connector.as_ref(),
            &settings,
            &shared,
            generation,
            handler.as_ref(),
            &mut shutdown,
            &mut subscribed,
        )
        .await;

        let error = match outcome {
            Ok(SessionEnd::Stopped) => break,
            Err(e) => e,
        };

        if !shared.transition(generation, ConnectionState::Failed) {
            log::debug!("Dropping error from superseded session: {}", error);
            break;
        }
        log::error!("❌ Subscription to {} failed: {}", settings.topic, error);
        handler.on_error(error);

        if !settings.reconnect.enabled {
            break;
        }
        if subscribed {
            backoff.reset();
        }

        let waited = tokio::select! {
            _ = shutdown.changed() => break,
            waited = backoff.sleep() => waited,
        };
        if let Err(e) = waited {
            log::error!("❌ {}", e);
            handler.on_error(ConnectionError::RetriesExhausted(e.0));
            break;
        }
        if !shared.transition(generation, ConnectionState::Connecting) {
            break;
        }
        log::info!("🔄 Reconnecting to {}", connector.endpoint());
    }
}

async fn run_once(
    connector: &dyn Connector,
    settings: &StreamSettings,
    shared: &Shared,
    generation: u64,
    handler: &dyn StreamHandler,
    shutdown: &mut watch::Receiver<bool>,
    subscribed: &mut bool,
) -> Result<SessionEnd, ConnectionError> {
    let establish = timeout(settings.connect_timeout, establish(connector, settings));
    let mut transport = tokio::select! {
        _ = shutdown.changed() => return Ok(SessionEnd::Stopped),
        result = establish => result.map_err(|_| ConnectionError::Timeout)??,
    };

    if let Err(e) = transport
        .send_text(Frame::subscribe(SUBSCRIPTION_ID, &settings.topic).encode())
        .await
    {
        transport.close().await;
        return Err(e);
    }

    if !shared.transition(generation, ConnectionState::Subscribed) {
        transport.close().await;
        return Ok(SessionEnd::Stopped);
    }
    *subscribed = true;
    log::info!("✅ Subscribed to {}", settings.topic);

    loop {
        let inbound = tokio::select! {
            _ = shutdown.changed() => {
                teardown(transport.as_mut()).await;
                return Ok(SessionEnd::Stopped);
            }
            inbound = transport.next_text() => inbound,
        };

        let text = match inbound {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                transport.close().await;
                return Err(e);
            }
            None => return Err(ConnectionError::Closed),
        };

        let frames = match Frame::parse_all(&text) {
            Ok(frames) => frames,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => {
                    if !shared.is_live(generation) {
                        log::debug!("Discarding message received after close");
                        continue;
                    }
                    handler.on_message(frame.body);
                }
                Command::Error => {
                    transport.close().await;
                    return Err(ConnectionError::Protocol(error_message(&frame)));
                }
                other => log::debug!("Ignoring {} frame", other.as_str()),
            }
        }
    }
}

/// Open a transport and complete the STOMP CONNECT handshake
async fn establish(
    connector: &dyn Connector,
    settings: &StreamSettings,
) -> Result<Box<dyn Transport>, ConnectionError> {
    let mut transport = connector.connect().await?;

    let connect = Frame::connect(&settings.host, settings.bearer_token.as_deref());
    if let Err(e) = transport.send_text(connect.encode()).await {
        transport.close().await;
        return Err(e);
    }

    loop {
        let text = match transport.next_text().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                transport.close().await;
                return Err(e);
            }
            None => return Err(ConnectionError::Closed),
        };

        for frame in Frame::parse_all(&text)? {
            match frame.command {
                Command::Connected => {
                    log::debug!(
                        "STOMP session established (version {})",
                        frame.get_header("version").unwrap_or("1.0")
                    );
                    return Ok(transport);
                }
                Command::Error => {
                    transport.close().await;
                    return Err(ConnectionError::Protocol(error_message(&frame)));
                }
                other => log::debug!("Ignoring {} frame before CONNECTED", other.as_str()),
            }
        }
    }
}

async fn teardown(transport: &mut dyn Transport) {
    let frames = [
        Frame::unsubscribe(SUBSCRIPTION_ID).encode(),
        Frame::disconnect().encode(),
    ];
    for frame in frames {
        if transport.send_text(frame).await.is_err() {
            break;
        }
    }
    transport.close().await;
    log::debug!("Unsubscribed and closed transport");
}

fn error_message(frame: &Frame) -> String {
    match frame.get_header("message") {
        Some(message) if !message.is_empty() => message.to_string(),
        _ if !frame.body.is_empty() => frame.body.trim().to_string(),
        _ => "broker sent ERROR".to_string(),
    }
}
