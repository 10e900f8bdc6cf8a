use std::sync::Arc;

use clap::Parser;

use tether_core::credentials::StaticCredentials;
use tether_core::events::StreamRequest;
use tether_core::ids::ConversationId;
use tether_socket::{SocketClient, SocketConfig};
use tether_stream::{StreamCallbacks, StreamConfig, StreamingClient};
use tether_telemetry::{MetricsRegistry, TelemetryConfig};

/// Realtime client for the chat server: keeps a socket open for pushed
/// events and can stream one assistant reply from the command line.
#[derive(Parser, Debug)]
#[command(name = "tether", version)]
struct Args {
    /// Server base URL.
    #[arg(long, default_value = "http://localhost:8000")]
    server: String,

    /// Bearer token for the session.
    #[arg(long, env = "TETHER_TOKEN", default_value = "")]
    token: String,

    /// Send this message and stream the reply, then keep listening.
    #[arg(long)]
    message: Option<String>,

    /// Conversation to send the message into (a new one by default).
    #[arg(long)]
    conversation: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tether_telemetry::init_logging(&TelemetryConfig {
        json_output: args.json_logs,
        ..TelemetryConfig::default()
    });

    tracing::info!(server = %args.server, "starting tether client");

    let metrics = Arc::new(MetricsRegistry::new());
    let credentials = Arc::new(StaticCredentials::new(&args.server, &args.token));

    let socket = SocketClient::with_metrics(
        credentials,
        SocketConfig::default(),
        Arc::clone(&metrics),
    );

    let _status_sub = socket.on_status_change(|status| {
        tracing::info!(status = %status, "connection status changed");
    });
    for event_type in [
        "module_data_changed",
        "reminder",
        "task_completed",
        "task_failed",
        "task_progress",
    ] {
        socket.on(event_type, {
            let event_type = event_type.to_string();
            move |data| tracing::info!(event = %event_type, payload = %data, "server event")
        });
    }

    socket.connect();

    if let Some(message) = args.message {
        let streamer = StreamingClient::with_metrics(StreamConfig::default(), Arc::clone(&metrics));
        let conversation_id = args
            .conversation
            .map(ConversationId::from_raw)
            .unwrap_or_default();
        let request = StreamRequest::new(conversation_id, message);

        let callbacks = StreamCallbacks::new()
            .on_meta(|meta| {
                tracing::info!(
                    conversation_id = %meta.conversation_id,
                    message_id = %meta.message_id,
                    "reply started"
                );
            })
            .on_token(|token| {
                use std::io::Write as _;
                print!("{token}");
                let _ = std::io::stdout().flush();
            })
            .on_done(|text| {
                println!();
                tracing::info!(chars = text.len(), "reply complete");
            })
            .on_error(|err| {
                tracing::error!(kind = err.error_kind(), error = %err, "stream failed");
            });

        let bearer = if args.token.is_empty() {
            None
        } else {
            Some(args.token.as_str())
        };
        let handle = streamer.connect(
            &format!("{}/api/chat/stream", args.server.trim_end_matches('/')),
            &request,
            bearer,
            callbacks,
        );
        handle.finished().await;
    }

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    socket.disconnect();
    for point in metrics.snapshot() {
        tracing::info!(metric = %point.name, value = point.value, "final metric");
    }
    tracing::info!("shutting down");
}
