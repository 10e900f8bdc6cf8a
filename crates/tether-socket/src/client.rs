use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use tether_core::credentials::{CredentialSource, SessionCredentials};
use tether_core::errors::TransportError;
use tether_core::events::Envelope;
use tether_core::status::ConnectionStatus;
use tether_telemetry::MetricsRegistry;

use crate::dispatch::{HandlerId, HandlerRegistry, StatusRegistry, StatusSubscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Delay before the first reconnect attempt; doubles per failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fractional jitter applied to each delay (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Persistent socket connection to the server.
///
/// Owned by the application's composition root and passed by reference to
/// whatever needs it; there is no module-level instance. At most one
/// underlying socket is live at any time: `connect` while connected tears
/// down the previous socket before opening the next.
pub struct SocketClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
}

struct Shared {
    credentials: Arc<dyn CredentialSource>,
    config: SocketConfig,
    handlers: HandlerRegistry,
    status_observers: Arc<StatusRegistry>,
    status: Mutex<ConnectionStatus>,
    /// Whether the next unexpected close should trigger a reconnect. Cleared
    /// by `disconnect` before the socket is closed.
    should_reconnect: AtomicBool,
    metrics: Arc<MetricsRegistry>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
        self.status_observers.emit(status);
    }
}

struct WorkerHandle {
    task: tokio::task::JoinHandle<()>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
}

impl SocketClient {
    pub fn new(credentials: Arc<dyn CredentialSource>, config: SocketConfig) -> Self {
        Self::with_metrics(credentials, config, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(
        credentials: Arc<dyn CredentialSource>,
        config: SocketConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                credentials,
                config,
                handlers: HandlerRegistry::new(),
                status_observers: Arc::new(StatusRegistry::new()),
                status: Mutex::new(ConnectionStatus::Disconnected),
                should_reconnect: AtomicBool::new(false),
                metrics,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Open (or replace) the connection. Must be called within a Tokio
    /// runtime. Status moves to `connecting`, then `connected` once the
    /// handshake succeeds. Credentials are re-read from the source on every
    /// attempt, including reconnects.
    pub fn connect(&self) {
        self.teardown_worker();
        self.shared.should_reconnect.store(true, Ordering::SeqCst);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(socket_worker(
            Arc::clone(&self.shared),
            outbound_rx,
            shutdown.clone(),
        ));

        *self.worker.lock() = Some(WorkerHandle {
            task,
            outbound_tx,
            shutdown,
        });
    }

    /// Intentionally close the connection. The reconnect policy is cleared
    /// *before* the socket closes, so this never produces a `reconnecting`
    /// transition; status goes straight to `disconnected`.
    pub fn disconnect(&self) {
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        self.teardown_worker();
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    /// Register a handler for a named event type. All handlers registered
    /// for a type fire, in registration order.
    pub fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> HandlerId {
        self.shared.handlers.on(event_type, handler)
    }

    /// Remove one registration made with [`SocketClient::on`].
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        self.shared.handlers.off(event_type, id)
    }

    /// Observe status transitions. Every transition reaches every observer
    /// registered at the time it happens.
    pub fn on_status_change(
        &self,
        handler: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> StatusSubscription {
        self.shared.status_observers.subscribe(handler)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    /// Queue an outbound `{"type", "data"}` frame on the live connection.
    pub fn send(&self, event_type: &str, data: Value) -> Result<(), TransportError> {
        let worker = self.worker.lock();
        let Some(handle) = worker.as_ref() else {
            return Err(TransportError::ChannelClosed);
        };
        handle
            .outbound_tx
            .send(Envelope::new(event_type, data))
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.shared.metrics
    }

    fn teardown_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.shutdown.cancel();
            handle.task.abort();
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.teardown_worker();
    }
}

enum SessionEnd {
    /// Unexpected loss; reconnect unless the policy was cleared.
    ClosedByPeer,
    /// Deliberate teardown; do not reconnect.
    Shutdown,
}

/// Owns the socket for the lifetime of one `connect` call, across every
/// reconnect. The socket itself is replaced per attempt, never reused.
async fn socket_worker(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    shutdown: CancellationToken,
) {
    let mut backoff = shared.config.initial_backoff;

    loop {
        if !shared.should_reconnect.load(Ordering::SeqCst) || shutdown.is_cancelled() {
            return;
        }

        // Fresh credentials every attempt
        let creds = shared.credentials.current();
        shared.set_status(ConnectionStatus::Connecting);

        match open_socket(&creds, &shutdown).await {
            Ok(Some(socket)) => {
                backoff = shared.config.initial_backoff;
                shared.set_status(ConnectionStatus::Connected);
                shared.metrics.counter("socket.connects").increment(1);
                shared.metrics.gauge("socket.active").set(1.0);

                let outcome = run_session(&shared, socket, &mut outbound_rx, &shutdown).await;

                shared.metrics.gauge("socket.active").set(0.0);
                if matches!(outcome, SessionEnd::Shutdown) {
                    return;
                }
            }
            Ok(None) => return, // shutdown raced the handshake
            Err(e) => {
                tracing::warn!(error = %e, "socket connect failed");
            }
        }

        if !shared.should_reconnect.load(Ordering::SeqCst) || shutdown.is_cancelled() {
            return;
        }

        shared.set_status(ConnectionStatus::Reconnecting);
        shared.metrics.counter("socket.reconnects").increment(1);

        let delay = jittered(backoff, shared.config.jitter_factor);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = next_backoff(backoff, shared.config.max_backoff);
    }
}

async fn open_socket(
    creds: &SessionCredentials,
    shutdown: &CancellationToken,
) -> Result<Option<WsStream>, TransportError> {
    let url = socket_url(creds)?;
    let connected = tokio::select! {
        _ = shutdown.cancelled() => return Ok(None),
        connected = connect_async(url.as_str()) => connected,
    };
    match connected {
        Ok((socket, _resp)) => Ok(Some(socket)),
        Err(e) => Err(TransportError::Network(e.to_string())),
    }
}

/// One connected stretch: pump outbound frames and dispatch inbound ones
/// until the peer goes away or the client tears the worker down.
async fn run_session(
    shared: &Shared,
    mut socket: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = socket.close(None).await;
                return SessionEnd::Shutdown;
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        let text = match serde_json::to_string(&envelope) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping unserializable frame");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            return SessionEnd::ClosedByPeer;
                        }
                    }
                    None => {
                        // Client dropped; close out and stop.
                        let _ = socket.close(None).await;
                        return SessionEnd::Shutdown;
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => dispatch_frame(shared, text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::ClosedByPeer;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::ClosedByPeer,
                    Some(Ok(_)) => {} // binary/pong frames are not part of the protocol
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket read failed");
                        return SessionEnd::ClosedByPeer;
                    }
                }
            }
        }
    }
}

/// Parse a `{"type", "data"}` frame and route it. Malformed frames and
/// unknown types are dropped without error.
fn dispatch_frame(shared: &Shared, text: &str) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => {
            shared.metrics.counter("socket.frames_received").increment(1);
            let invoked = shared.handlers.dispatch(&envelope.event_type, &envelope.data);
            if invoked == 0 {
                tracing::trace!(event_type = %envelope.event_type, "no handlers for frame");
            }
        }
        Err(_) => {
            tracing::trace!(len = text.len(), "ignoring malformed frame");
        }
    }
}

/// Derive the socket URL from the server URL: scheme swaps to ws(s), path
/// gains `/ws`, and the token rides as a query parameter on every attempt.
fn socket_url(creds: &SessionCredentials) -> Result<String, TransportError> {
    let base = creds.server_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https") {
        format!("wss{rest}")
    } else if let Some(rest) = base.strip_prefix("http") {
        format!("ws{rest}")
    } else {
        base.to_string()
    };

    let mut url = Url::parse(&format!("{ws_base}/ws"))
        .map_err(|e| TransportError::Protocol(format!("invalid server url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("token", creds.token.expose_secret());
    Ok(url.into())
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

fn jittered(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let base = delay.as_millis() as f64;
    let range = base * factor;
    let jitter = (random_u64() % (range as u64 * 2 + 1)) as f64 - range;
    Duration::from_millis((base + jitter).max(0.0) as u64)
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::credentials::StaticCredentials;

    fn creds(url: &str) -> SessionCredentials {
        StaticCredentials::new(url, "tok 1/2").current()
    }

    #[test]
    fn socket_url_swaps_scheme_and_appends_path() {
        let url = socket_url(&creds("http://localhost:8000")).unwrap();
        assert!(url.starts_with("ws://localhost:8000/ws?token="));

        let url = socket_url(&creds("https://api.example.com")).unwrap();
        assert!(url.starts_with("wss://api.example.com/ws?token="));
    }

    #[test]
    fn socket_url_encodes_the_token() {
        let url = socket_url(&creds("http://localhost:8000")).unwrap();
        // space and slash must not appear raw in the query
        assert!(url.ends_with("token=tok+1%2F2"));
    }

    #[test]
    fn socket_url_tolerates_trailing_slash() {
        let url = socket_url(&creds("http://localhost:8000/")).unwrap();
        assert!(url.starts_with("ws://localhost:8000/ws?"));
    }

    #[test]
    fn socket_url_rejects_garbage() {
        assert!(socket_url(&creds("not a url")).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let delayed = jittered(base, 0.2);
            assert!(delayed >= Duration::from_millis(800), "got {delayed:?}");
            assert!(delayed <= Duration::from_millis(1200), "got {delayed:?}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(
            jittered(Duration::from_millis(500), 0.0),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn default_config_matches_reconnect_policy() {
        let config = SocketConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.jitter_factor, 0.2);
    }

    #[tokio::test]
    async fn send_without_connect_is_channel_closed() {
        let client = SocketClient::new(
            Arc::new(StaticCredentials::new("http://localhost:1", "t")),
            SocketConfig::default(),
        );
        let err = client.send("ping", Value::Null).unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn initial_status_is_disconnected() {
        let client = SocketClient::new(
            Arc::new(StaticCredentials::new("http://localhost:1", "t")),
            SocketConfig::default(),
        );
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }
}
