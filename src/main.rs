//! Room sync server
//!
//! Serves rooms over WebSocket using the binary wire protocol:
//! - `/ws/:room_id` sessions (first frame must be `Hello`)
//! - `/api/rooms/:room_id/stats` and `/api/rooms/:room_id/export` for inspection
//! - Snapshots persisted to sled, flushed periodically and on shutdown

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use room_sync::room::{RoomError, RoomRegistry};
use room_sync::storage::SledStore;
use room_sync::sync::protocol::{ErrorCode, WireCodec, PROTOCOL_VERSION};
use room_sync::sync::WireMessage;
use room_sync::ServerConfig;

/// Shared application state
struct AppState {
    registry: Arc<RoomRegistry>,
    started_at: Instant,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol_version: u8,
    uptime_seconds: u64,
    active_rooms: usize,
}

type ApiError = (StatusCode, String);

fn api_error(err: RoomError) -> ApiError {
    let status = match err {
        RoomError::NotFound(_) => StatusCode::NOT_FOUND,
        RoomError::Validation(_) => StatusCode::BAD_REQUEST,
        RoomError::Full(_) | RoomError::TooManyRooms(_) => StatusCode::SERVICE_UNAVAILABLE,
        RoomError::Closed(_) | RoomError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: state.registry.room_count(),
    })
}

async fn room_stats(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.registry.get_stats(&room_id).await.map_err(api_error)?;
    Ok(Json(stats))
}

async fn export_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let exported = state
        .registry
        .export_room(&room_id)
        .await
        .map_err(api_error)?;
    Ok(Json(exported))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id))
}

async fn send_frame(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &WireMessage,
) -> bool {
    match WireCodec::encode(msg) {
        Ok(bytes) => sender.send(Message::Binary(bytes.to_vec())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode {:?}: {}", msg.message_type(), e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, room_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first frame must introduce the client
    let hello = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => break WireCodec::decode(&data),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => {
                debug!(room = %room_id, "socket closed before hello");
                return;
            }
        }
    };

    let (client, resume_token) = match hello {
        Ok(WireMessage::Hello {
            protocol_version,
            room_id: hello_room,
            client,
            resume_token,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                let msg = WireMessage::error(
                    ErrorCode::VersionMismatch,
                    format!("server speaks protocol {}", PROTOCOL_VERSION),
                );
                send_frame(&mut ws_sender, &msg).await;
                return;
            }
            if hello_room != room_id {
                let msg = WireMessage::error(ErrorCode::InvalidMessage, "hello names another room");
                send_frame(&mut ws_sender, &msg).await;
                return;
            }
            (client, resume_token)
        }
        Ok(other) => {
            warn!(room = %room_id, "expected hello, got {:?}", other.message_type());
            let msg = WireMessage::error(ErrorCode::InvalidMessage, "first frame must be hello");
            send_frame(&mut ws_sender, &msg).await;
            return;
        }
        Err(e) => {
            warn!(room = %room_id, "malformed hello: {}", e);
            let msg = WireMessage::error(ErrorCode::InvalidMessage, e.to_string());
            send_frame(&mut ws_sender, &msg).await;
            return;
        }
    };

    let client_id = client.client_id.clone();
    let mut handle = match state
        .registry
        .join_room(&room_id, client, resume_token)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!(room = %room_id, client = %client_id, "join refused: {}", e);
            let code = match e {
                RoomError::Full(_) | RoomError::TooManyRooms(_) => ErrorCode::RoomFull,
                RoomError::Validation(_) => ErrorCode::InvalidMessage,
                _ => ErrorCode::ServerError,
            };
            send_frame(&mut ws_sender, &WireMessage::error(code, e.to_string())).await;
            return;
        }
    };
    info!(room = %room_id, client = %client_id, session = %handle.session_id(), "socket joined room");

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<WireMessage>();

    // Frames from the socket are decoded here and handed to the pump below
    let recv_room = room_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Binary(data)) => match WireCodec::decode(&data) {
                    Ok(msg) => {
                        if inbound_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(room = %recv_room, "dropping malformed frame: {}", e),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            msg = handle.recv() => match msg {
                Some(msg) => {
                    let goodbye = matches!(msg, WireMessage::Goodbye { .. });
                    if !send_frame(&mut ws_sender, &msg).await || goodbye {
                        break;
                    }
                }
                None => break,
            },
            msg = inbound_rx.recv() => match msg {
                Some(msg) => {
                    if handle.send(msg).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    recv_task.abort();
    let _ = ws_sender.close().await;
    info!(room = %room_id, client = %client_id, "socket left room");
}

async fn shutdown_signal(registry: Arc<RoomRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down, flushing rooms");
    registry.shutdown().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_sync=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;

    info!("Initializing storage at: {}", config.storage.path);
    let storage = SledStore::open(config.storage.clone()).context("failed to open storage")?;

    let registry = Arc::new(RoomRegistry::new(Arc::new(storage), config.registry.clone()));
    let background = registry.clone().start_background_tasks();

    let state = Arc::new(AppState {
        registry: registry.clone(),
        started_at: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/rooms/:room_id/stats", get(room_stats))
        .route("/api/rooms/:room_id/export", get(export_room))
        .route("/ws/:room_id", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Room sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:room_id", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .context("server error")?;

    background.wait().await;
    Ok(())
}
