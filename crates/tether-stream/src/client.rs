use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use tether_core::errors::TransportError;
use tether_core::events::StreamRequest;
use tether_telemetry::MetricsRegistry;

use crate::frames::{classify, FrameDecoder, Payload};
use crate::session::{PayloadOutcome, StreamCallbacks, StreamSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How response bytes reach the event parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Decode chunks as they arrive; tokens surface progressively.
    Incremental,
    /// Degraded mode for transports without a streaming body: read the whole
    /// response, then run the same parser over it once. Callback sequence and
    /// termination semantics are identical, only timing differs.
    Buffered,
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub connect_timeout: Duration,
    pub delivery: DeliveryMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            delivery: DeliveryMode::Incremental,
        }
    }
}

/// Issues streaming chat requests and feeds the decoded events to
/// per-session callbacks. One HTTP request per [`StreamingClient::connect`]
/// call; sessions are independent and individually cancellable.
pub struct StreamingClient {
    client: reqwest::Client,
    config: StreamConfig,
    metrics: Arc<MetricsRegistry>,
}

impl StreamingClient {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_metrics(config, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(config: StreamConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(config.connect_timeout)
                .build()
                .expect("failed to build HTTP client"),
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Start one streaming request. Must be called within a Tokio runtime.
    ///
    /// Sends `POST url` with `Accept: text/event-stream` and, when a token is
    /// given, `Authorization: Bearer <token>`. Returns immediately with a
    /// handle whose sole operation is cancellation; cancelling aborts the
    /// transport and still completes the session with the partial text.
    pub fn connect(
        &self,
        url: &str,
        request: &StreamRequest,
        bearer: Option<&str>,
        callbacks: StreamCallbacks,
    ) -> StreamHandle {
        let cancel = CancellationToken::new();
        let session = StreamSession::new(callbacks);

        let task = tokio::spawn(run_stream(
            self.client.clone(),
            self.config.delivery,
            url.to_string(),
            request.clone(),
            bearer.map(str::to_owned),
            cancel.clone(),
            session,
            Arc::clone(&self.metrics),
        ));

        StreamHandle { cancel, task }
    }
}

/// Cancellation capability for one in-flight stream.
pub struct StreamHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    /// Abort the in-flight transport. The session still terminates through
    /// its done callback with whatever text accumulated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the session to reach its terminal callback.
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(url = %url))]
async fn run_stream(
    client: reqwest::Client,
    delivery: DeliveryMode,
    url: String,
    request: StreamRequest,
    bearer: Option<String>,
    cancel: CancellationToken,
    mut session: StreamSession,
    metrics: Arc<MetricsRegistry>,
) {
    metrics.counter("stream.started").increment(1);
    let started_at = Instant::now();

    let mut req = client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "text/event-stream")
        .json(&request);
    if let Some(token) = &bearer {
        req = req.bearer_auth(token);
    }

    let resp = tokio::select! {
        _ = cancel.cancelled() => {
            metrics.counter("stream.cancelled").increment(1);
            session.finish();
            return;
        }
        resp = req.send() => resp,
    };

    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "stream request failed to send");
            metrics.counter("stream.failed").increment(1);
            session.fail(TransportError::Network(e.to_string()));
            return;
        }
    };

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = status, "stream request rejected");
        metrics.counter("stream.failed").increment(1);
        session.fail(TransportError::from_status(status, body));
        return;
    }

    match delivery {
        DeliveryMode::Incremental => {
            read_incremental(resp, &cancel, &mut session, &metrics).await;
        }
        DeliveryMode::Buffered => {
            read_buffered(resp, &cancel, &mut session, &metrics).await;
        }
    }

    metrics
        .histogram("stream.duration_ms")
        .observe(started_at.elapsed().as_millis() as f64);
}

async fn read_incremental(
    resp: reqwest::Response,
    cancel: &CancellationToken,
    session: &mut StreamSession,
    metrics: &MetricsRegistry,
) {
    let mut decoder = FrameDecoder::new();
    let mut stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(partial_len = session.accumulated().len(), "stream cancelled");
                metrics.counter("stream.cancelled").increment(1);
                session.finish();
                return;
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if apply_payloads(session, metrics, decoder.feed(&bytes)) {
                    metrics.counter("stream.completed").increment(1);
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "stream interrupted mid-body");
                metrics.counter("stream.failed").increment(1);
                session.fail(TransportError::Network(e.to_string()));
                return;
            }
            None => {
                // End of input without a [DONE] sentinel still completes
                let stopped = apply_payloads(session, metrics, decoder.finish());
                if !stopped {
                    session.finish();
                }
                metrics.counter("stream.completed").increment(1);
                return;
            }
        }
    }
}

async fn read_buffered(
    resp: reqwest::Response,
    cancel: &CancellationToken,
    session: &mut StreamSession,
    metrics: &MetricsRegistry,
) {
    let text = tokio::select! {
        _ = cancel.cancelled() => {
            metrics.counter("stream.cancelled").increment(1);
            session.finish();
            return;
        }
        text = resp.text() => text,
    };

    match text {
        Ok(text) => {
            let mut decoder = FrameDecoder::new();
            let mut payloads = decoder.feed(text.as_bytes());
            payloads.extend(decoder.finish());
            let stopped = apply_payloads(session, metrics, payloads);
            if !stopped {
                session.finish();
            }
            metrics.counter("stream.completed").increment(1);
        }
        Err(e) => {
            metrics.counter("stream.failed").increment(1);
            session.fail(TransportError::Network(e.to_string()));
        }
    }
}

/// Feed raw payloads through classification into the session.
/// Returns true once the session has completed.
fn apply_payloads(
    session: &mut StreamSession,
    metrics: &MetricsRegistry,
    payloads: Vec<String>,
) -> bool {
    for raw in payloads {
        let payload = classify(&raw);
        if matches!(payload, Payload::Token(_)) {
            metrics.counter("stream.tokens_received").increment(1);
        }
        if session.on_payload(payload) == PayloadOutcome::Completed {
            return true;
        }
    }
    false
}
