//! collab-sync server
//!
//! Serves one workspace directory to collaborating editors:
//! - DocOp editing sessions transformed against a per-file revision counter
//! - Workspace tree listings and ADD/DELETE/MOVE/COPY mutations
//! - Sled-backed save metadata and applied-op journal
//! - Axum WebSocket transport with the binary sync protocol

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use collab_sync::storage::{DiskStore, DocumentMetadata, DocumentStore, StorageConfig};
use collab_sync::sync::messages::GetDirectoryResponse;
use collab_sync::sync::protocol::{
    ClientMessage, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION,
};
use collab_sync::sync::{SyncServer, SyncServerConfig};
use collab_sync::workspace::{ScanOptions, WorkspaceTree, ROOT_PATH};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// DocOp and workspace tree server
    sync_server: Arc<SyncServer>,
    /// Workspace directory being served
    workspace_root: PathBuf,
}

/// Settings read from the environment
struct Settings {
    port: u16,
    storage_path: String,
    workspace_root: PathBuf,
    server: SyncServerConfig,
}

impl Settings {
    fn from_env() -> Self {
        let mut server = SyncServerConfig::default();
        if let Some(ms) = env_parse::<u64>("SAVE_INTERVAL_MS") {
            server = server.with_save_interval(Duration::from_millis(ms));
        }
        if let Some(max_history) = env_parse::<usize>("MAX_HISTORY") {
            server = server.with_max_history(max_history);
        }

        Self {
            port: env_parse("PORT").unwrap_or(5000),
            storage_path: std::env::var("STORAGE_PATH")
                .unwrap_or_else(|_| "./data/collab.sled".to_string()),
            workspace_root: std::env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            server,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid {}={}", name, value);
            None
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_sessions: usize,
    connected_clients: usize,
    tree_version: u64,
    workspace_root: String,
}

#[derive(Debug, Serialize)]
struct SavedFilesResponse {
    files: Vec<DocumentMetadata>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct TreeQuery {
    path: Option<String>,
    depth: Option<i32>,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: stats.uptime_seconds,
        active_sessions: stats.active_sessions,
        connected_clients: stats.connected_clients,
        tree_version: stats.tree_version,
        workspace_root: state.workspace_root.display().to_string(),
    })
}

/// Save metadata of the documents written this run
async fn list_saved_files(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SavedFilesResponse>, (StatusCode, String)> {
    match state.sync_server.list_saved_documents() {
        Ok(files) => {
            let total = files.len();
            Ok(Json(SavedFilesResponse { files, total }))
        }
        Err(e) => {
            error!("Failed to list saved files: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Directory listing over HTTP
async fn get_tree(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TreeQuery>,
) -> Result<Json<GetDirectoryResponse>, StatusCode> {
    let path = query.path.unwrap_or_else(|| ROOT_PATH.to_string());
    let response = state
        .sync_server
        .get_directory(&path, query.depth.unwrap_or(1))
        .await;

    if response.base_directory.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(response))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Every message to this client goes through one channel so replies and
    // broadcasts keep their order.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let client_id = state.sync_server.connect(tx.clone());

    let client_id_send = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match SyncProtocol::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for client {}", client_id_send);
    });

    let client_id_recv = client_id.clone();
    let state_recv = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Binary(data) => SyncProtocol::decode_client(&data),
                // JSON for debugging and scripting
                Message::Text(text) => SyncProtocol::decode_client_json(&text),
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", client_id_recv);
                    break;
                }
                _ => continue,
            };

            match decoded {
                Ok(client_msg) => {
                    let is_goodbye = matches!(client_msg, ClientMessage::Goodbye { .. });
                    if let Some(reply) = state_recv
                        .sync_server
                        .handle_message(&client_id_recv, client_msg)
                        .await
                    {
                        let _ = tx.send(reply);
                    }
                    if is_goodbye {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to decode message from {}: {}", client_id_recv, e);
                    let _ = tx.send(SyncProtocol::error_response(
                        None,
                        ErrorCode::InvalidMessage,
                        e.to_string(),
                    ));
                }
            }
        }
        debug!("Receive task ended for client {}", client_id_recv);
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.sync_server.disconnect(&client_id).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync=info,tower_http=info".into()),
        )
        .init();

    let settings = Settings::from_env();

    // Initialize storage
    info!("Initializing storage at: {}", settings.storage_path);
    let storage = DocumentStore::open(StorageConfig::new(&settings.storage_path))
        .context("Failed to open storage")?;
    // Session keys are allocated per run, so old journal entries are
    // meaningless.
    storage
        .clear_journal()
        .context("Failed to clear the op journal")?;

    // Scan the workspace
    let (tree, summary) = WorkspaceTree::scan(&settings.workspace_root, &ScanOptions::default())
        .with_context(|| {
            format!(
                "Failed to scan workspace {}",
                settings.workspace_root.display()
            )
        })?;
    info!(
        "Workspace {}: {} files, {} folders, {} bytes ({} skipped)",
        settings.workspace_root.display(),
        summary.file_count,
        summary.folder_count,
        summary.total_size,
        summary.skipped_files.len()
    );

    let sync_server = Arc::new(SyncServer::new(
        tree,
        Arc::new(DiskStore::new(&settings.workspace_root)),
        Some(storage),
        settings.server,
    ));
    let background = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState {
        sync_server: sync_server.clone(),
        workspace_root: settings.workspace_root.clone(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/files", get(list_saved_files))
        .route("/api/tree", get(get_tree))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    info!("collab-sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Final save
    sync_server.shutdown();
    background.wait().await;
    info!("Server stopped");
    Ok(())
}
