//! Connection handlers for the Parley server.
//!
//! This module handles the connection lifecycle and frame processing.

use crate::api::{self, ApiError};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{ChatError, ConnectionId, ConnectionLease, Engine, EventReceiver, Session};
use parley_protocol::codec::{self, LENGTH_PREFIX_SIZE};
use parley_protocol::{
    ClientEvent, ProtocolError, ServerEvent, User, Version, WireFormat, PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The messaging engine.
    pub engine: Engine,
    /// Server configuration.
    pub config: Config,
    /// Connections admitted, including handshakes not yet upgraded.
    slots: Arc<AtomicUsize>,
}

/// A reserved place under `limits.max_connections`, released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = Engine::builder()
            .with_config(config.engine_config())
            .with_identity(config.identity_resolver())
            .build();
        Self::with_engine(config, engine)
    }

    /// Wrap an already built engine.
    #[must_use]
    pub fn with_engine(config: Config, engine: Engine) -> Self {
        Self {
            engine,
            config,
            slots: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Claim a connection slot, or `None` when the server is full.
    fn reserve_slot(&self) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(&self.slots)))
    }
}

/// Build the axum application.
pub fn build_app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));
    let sweeper = spawn_sweeper(Arc::clone(&state));
    let app = build_app(Arc::clone(&state));

    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app).await?;
    sweeper.abort();

    Ok(())
}

/// Periodic maintenance: room expiry, typing idle expiry, gauges.
pub fn spawn_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let period = state.config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = state.engine.sweep().await;
            if !report.expired_rooms.is_empty() {
                metrics::record_expired_rooms(report.expired_rooms.len());
            }
            metrics::record_engine_stats(&state.engine.stats());
        }
    })
}

/// Handshake query string.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
    /// Protocol version spoken by the client, `major[.minor]`.
    #[serde(default)]
    pub v: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The caller is authenticated before the upgrade; a failed handshake is
/// answered with a plain HTTP error.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(v) = params.v.as_deref() {
        let compatible = v
            .parse::<Version>()
            .is_ok_and(|v| PROTOCOL_VERSION.is_compatible_with(&v));
        if !compatible {
            debug!(version = v, "Handshake with unsupported protocol version");
            return ApiError(ChatError::InvalidPayload(format!(
                "unsupported protocol version {v}, server speaks {PROTOCOL_VERSION}"
            )))
            .into_response();
        }
    }

    let token = params
        .token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| api::bearer_token(&headers));
    let Some(token) = token else {
        debug!("Handshake without token");
        return ApiError(ChatError::Unauthorized).into_response();
    };

    let Some(slot) = state.reserve_slot() else {
        warn!(
            max_connections = state.config.limits.max_connections,
            "Connection limit reached"
        );
        return ApiError(ChatError::Unavailable("connection limit reached".into())).into_response();
    };

    let user = match state.engine.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => {
            debug!(error = %e, "Handshake rejected");
            return ApiError(e).into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        handle_websocket(socket, state, user).await;
        drop(slot);
    })
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user: User) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let ConnectionLease { session, events } = state.engine.open_connection(user).await;
    let connection_id = session.connection_id().clone();
    debug!(connection = %connection_id, user = %session.user_id(), "WebSocket connected");

    let (sink, mut receiver) = socket.split();

    // Replies follow the format of the client's latest frame.
    let (format_tx, format_rx) = watch::channel(WireFormat::Text);
    let writer = tokio::spawn(write_loop(
        sink,
        events,
        format_rx,
        state.config.heartbeat_interval(),
        connection_id.clone(),
    ));

    let timeout = state.config.heartbeat_timeout();
    let max_size = state.config.limits.max_message_size;
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        let msg = match tokio::time::timeout(timeout, receiver.next()).await {
            Ok(msg) => msg,
            Err(_) => {
                info!(connection = %connection_id, "Heartbeat timeout");
                metrics::record_error("HEARTBEAT_TIMEOUT");
                break;
            }
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                format_tx.send_replace(WireFormat::Text);
                let frame = if text.len() > max_size {
                    Err(ProtocolError::FrameTooLarge(text.len()))
                } else {
                    codec::decode_text(&text)
                };
                handle_intent(&state, &session, frame, text.len()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                if !state.config.transport.binary_frames {
                    let frame = Err(ProtocolError::Malformed("binary frames are disabled".into()));
                    handle_intent(&state, &session, frame, data.len()).await;
                    continue;
                }
                format_tx.send_replace(WireFormat::Binary);

                if read_buffer.len() + data.len() > max_size + LENGTH_PREFIX_SIZE {
                    read_buffer.clear();
                    let frame = Err(ProtocolError::FrameTooLarge(data.len()));
                    handle_intent(&state, &session, frame, data.len()).await;
                    continue;
                }

                read_buffer.extend_from_slice(&data);
                loop {
                    match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                        Ok(Some(event)) => {
                            handle_intent(&state, &session, Ok(event), data.len()).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            read_buffer.clear();
                            handle_intent(&state, &session, Err(e), data.len()).await;
                            break;
                        }
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                // Pings are answered by axum; either way the peer is alive.
            }
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %connection_id, "Received close frame");
                break;
            }
            Some(Err(e)) => {
                warn!(connection = %connection_id, error = %e, "WebSocket error");
                metrics::record_error("WEBSOCKET");
                break;
            }
            None => {
                debug!(connection = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }

    state.engine.close_connection(&session).await;
    writer.abort();

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Dispatch one inbound frame and record it.
async fn handle_intent(
    state: &AppState,
    session: &Session,
    frame: Result<ClientEvent, ProtocolError>,
    bytes: usize,
) {
    let start = Instant::now();
    let name = frame.as_ref().map_or("invalid", ClientEvent::name);
    metrics::record_event(name, bytes, "inbound");

    if let Err(e) = state.engine.dispatch_frame(session, frame).await {
        metrics::record_error(e.code());
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Drain a connection's queue onto the socket and keep it alive with pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut events: EventReceiver,
    format: watch::Receiver<WireFormat>,
    ping_every: Duration,
    connection_id: ConnectionId,
) {
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let wire = *format.borrow();
                match encode_event(&event, wire) {
                    Ok((message, len)) => {
                        metrics::record_event(event.name(), len, "outbound");
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection = %connection_id, event = event.name(), error = %e, "Failed to encode event");
                        metrics::record_error("ENCODE");
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

fn encode_event(event: &ServerEvent, format: WireFormat) -> Result<(Message, usize), ProtocolError> {
    Ok(match format {
        WireFormat::Text => {
            let text = codec::encode_text(event)?;
            let len = text.len();
            (Message::Text(text), len)
        }
        WireFormat::Binary => {
            let data = codec::encode_binary(event)?;
            let len = data.len();
            (Message::Binary(data.to_vec()), len)
        }
    })
}
