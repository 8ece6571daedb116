use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use portbridge_core::{Config, OutboundMessage, Paths};
use portbridge_port::ChannelSink;
use portbridge_storage::StorageAreas;
use portbridge_worker::{BackgroundWorker, HandlerRegistry};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct ServeState {
    worker: Arc<BackgroundWorker>,
}

pub async fn run(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths)?;

    let host = host.unwrap_or_else(|| config.gateway.host.clone());
    let port = port.unwrap_or(config.gateway.port);

    let areas = StorageAreas::open(&paths);
    let worker = Arc::new(BackgroundWorker::new(
        config,
        &areas,
        HandlerRegistry::with_defaults(),
    ));
    worker.start().await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let supervisor_handle = worker.spawn_supervisor(shutdown_tx.subscribe());

    let state = ServeState {
        worker: Arc::clone(&worker),
    };
    let app = Router::new()
        .route("/port", get(handle_port_upgrade))
        .route("/runtime", get(handle_runtime_upgrade))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let bind_addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "portbridge listening");

    let http_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = http_shutdown_rx;
                let _ = rx.recv().await;
            })
            .await
            .ok();
    });

    println!("portbridge worker");
    println!("  port sessions:  ws://{}/port", bind_addr);
    println!("  runtime:        ws://{}/runtime", bind_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    for (name, handle) in [("http_server", http_handle), ("supervisor", supervisor_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    Ok(())
}

async fn handle_health(State(state): State<ServeState>) -> impl IntoResponse {
    let sessions = state.worker.router().sessions().await;
    let pending = state
        .worker
        .store()
        .snapshot()
        .await
        .map(|p| p.len())
        .ok();
    let session = state.worker.supervisor().state().await;
    Json(serde_json::json!({
        "status": "ok",
        "portSessions": sessions.len(),
        "pendingRequests": pending,
        "sessionUnlocked": session.unlocked,
    }))
}

async fn handle_port_upgrade(ws: WebSocketUpgrade, State(state): State<ServeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_port_connection(socket, state))
}

async fn handle_runtime_upgrade(ws: WebSocketUpgrade, State(state): State<ServeState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_runtime_connection(socket, state))
}

/// One websocket is one port: its lifetime is the session's lifetime.
async fn handle_port_connection(socket: WebSocket, state: ServeState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (sink, mut outbound_rx) = ChannelSink::new();
    let port_id = state.worker.connect_port(Arc::new(sink)).await;
    info!(port = %port_id, "Port connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Could not encode port message");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(port = %port_id, error = %e, "WebSocket receive error");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => state.worker.on_port_text(&port_id, &text).await,
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.worker.on_port_closed(&port_id).await;
    send_task.abort();
    info!(port = %port_id, "Port disconnected");
}

/// Runtime clients get every broadcast plus direct replies to what they send.
async fn handle_runtime_connection(socket: WebSocket, state: ServeState) {
    debug!("Runtime client connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut broadcast_rx = state.worker.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(reply) = reply_rx.recv() => reply,
                event = broadcast_rx.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Runtime client lagging, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                else => break,
            };
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Could not encode runtime message");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "WebSocket receive error");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                if let Some(reply) = state.worker.on_runtime_text(&text).await {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    debug!("Runtime client disconnected");
}
