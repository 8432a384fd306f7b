//! WebSocket streaming surface
//!
//! One persistent connection per client. The socket is split: a reader
//! loop parses tagged requests and mutates the subscription registry,
//! while an independent writer task drains the session's bounded queue.
//! The pipeline only ever enqueues, so a stalled client stalls nothing
//! but itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::debug;
use types::ids::Symbol;

use crate::cache::CacheLayer;
use crate::dispatch::{Dispatcher, SessionHandle};
use crate::events::RawRecord;
use crate::ingestion::{IngestOutcome, IngestionGateway};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{now_nanos, Pipeline};
use crate::protocol::{parse_request, ClientRequest, ServerMessage};
use crate::subscriptions::SubscriptionRegistry;

/// Messages drained per writer wakeup.
const WRITE_BATCH: usize = 64;

/// Shared handles the HTTP/WS layer needs.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: Arc<SubscriptionRegistry>,
    pub cache: Arc<CacheLayer>,
    pub metrics: Arc<PipelineMetrics>,
}

impl AppState {
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            gateway: pipeline.gateway().clone(),
            dispatcher: pipeline.dispatcher().clone(),
            registry: pipeline.registry().clone(),
            cache: pipeline.cache().clone(),
            metrics: pipeline.metrics().clone(),
        }
    }
}

/// Build the service router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ingest/:source", post(ingest_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    let mut exported = state.metrics.export();
    exported.insert(
        "dispatcher_queue_depth".to_string(),
        state.dispatcher.total_queue_depth() as u64,
    );
    Json(exported)
}

/// Ingress endpoint for feed adapters: a batch of framed records.
async fn ingest_handler(
    Path(source): Path<String>,
    State(state): State<AppState>,
    Json(records): Json<Vec<RawRecord>>,
) -> (StatusCode, Json<BTreeMap<String, u64>>) {
    let mut routed = 0u64;
    let mut dropped = 0u64;
    for record in records {
        match state.gateway.ingest(&source, record, now_nanos()) {
            IngestOutcome::Routed => routed += 1,
            _ => dropped += 1,
        }
    }
    let mut body = BTreeMap::new();
    body.insert("routed".to_string(), routed);
    body.insert("dropped".to_string(), dropped);
    (StatusCode::ACCEPTED, Json(body))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = state.dispatcher.register(now_nanos());
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: the only place this connection is written to.
    let writer_session = session.clone();
    let writer = tokio::spawn(async move {
        loop {
            let batch = writer_session.drain(WRITE_BATCH);
            if batch.is_empty() {
                if !writer_session.is_connected() {
                    break;
                }
                writer_session.wait_for_messages().await;
                continue;
            }
            for message in batch {
                if ws_tx.send(Message::Text(message.payload)).await.is_err() {
                    return;
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Reader loop: requests in, registry updates out.
    while let Some(Ok(message)) = ws_rx.next().await {
        let now = now_nanos();
        session.touch_heartbeat(now);
        match message {
            Message::Text(text) => handle_request(&text, &session, &state, now),
            Message::Close(_) => break,
            // Control frames are answered by the WS layer itself.
            _ => {}
        }
        if !session.is_connected() {
            break;
        }
    }

    state.dispatcher.disconnect(session.id);
    session.wake();
    let _ = writer.await;
    debug!(client_id = session.id, "Socket closed");
}

/// Apply one inbound request to the session. Bad input answers with an
/// `error` message; the connection stays up.
pub(crate) fn handle_request(
    text: &str,
    session: &Arc<SessionHandle>,
    state: &AppState,
    now: i64,
) {
    match parse_request(text) {
        Ok(ClientRequest::Subscribe { symbols, kinds }) => {
            for code in symbols {
                let Some(symbol) = Symbol::try_new(code.clone()) else {
                    let reply = ServerMessage::error("invalid_symbol", code).to_json();
                    state.dispatcher.send_direct(session.id, &reply, now);
                    continue;
                };
                for kind in &kinds {
                    state.registry.subscribe(session.id, symbol.clone(), *kind);
                }
            }
        }
        Ok(ClientRequest::Unsubscribe { symbols, kinds }) => {
            for code in symbols {
                let Some(symbol) = Symbol::try_new(code) else {
                    continue;
                };
                for kind in &kinds {
                    state.registry.unsubscribe(session.id, &symbol, *kind);
                }
            }
        }
        Ok(ClientRequest::Ping) => {
            let pong = ServerMessage::Pong { timestamp: now }.to_json();
            state.dispatcher.send_heartbeat(session.id, &pong, now);
        }
        Err(err) => {
            let reply = ServerMessage::error("malformed", err.to_string()).to_json();
            state.dispatcher.send_direct(session.id, &reply, now);
        }
    }
}
