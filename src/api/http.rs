//! HTTP API Server
//!
//! Status queries for operators and an operation submission endpoint for
//! the application layer.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::executor::StateStore;
use crate::oplog::{Operation, OperationEntry, Sequence};
use crate::replication::{EngineState, ReplicationEngine};
use crate::state::PeerAddress;

/// Default number of entries returned by `/log`
const DEFAULT_LOG_LIMIT: usize = 100;
/// Upper bound on entries returned by `/log`
const MAX_LOG_LIMIT: usize = 1000;

/// Shared application state
pub struct AppState {
    /// Replication engine of this node
    pub engine: Arc<ReplicationEngine>,
    /// Local state store, written once an operation is logged
    pub store: Arc<dyn StateStore>,
    /// When the API was created
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, engine: Arc<ReplicationEngine>, store: Arc<dyn StateStore>) -> Self {
        let state = Arc::new(AppState {
            engine,
            store,
            started: Instant::now(),
        });

        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/peers", get(handle_peers))
            .route("/log", get(handle_log))
            .route("/operations", post(handle_submit))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub state: String,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub address: String,
    pub state: String,
    pub watermark: Sequence,
    pub log_entries: u64,
    pub peers: usize,
    pub monitored_peers: usize,
    pub uptime_seconds: u64,
}

/// Peers response
#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    pub local: PeerAddress,
    pub peers: Vec<PeerAddress>,
}

/// Query for `/log`
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Entries strictly above this sequence
    #[serde(default)]
    pub from: Sequence,
    pub limit: Option<usize>,
}

/// Log tail response
#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub watermark: Sequence,
    pub entries: Vec<OperationEntry>,
}

/// Submit response
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub sequence: Sequence,
    pub kind: String,
    /// Whether the local store accepted the operation
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine_state = state.engine.state();
    let healthy = engine_state == EngineState::Active;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            healthy,
            state: engine_state.to_string(),
        }),
    )
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = &state.engine;
    Json(StatusResponse {
        address: engine.local_address().to_string(),
        state: engine.state().to_string(),
        watermark: engine.watermark(),
        log_entries: engine.log().len(),
        peers: engine.peers().len(),
        monitored_peers: engine.detector().watched().len(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn handle_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PeersResponse {
        local: state.engine.local_address().clone(),
        peers: state.engine.peers().into_iter().collect(),
    })
}

async fn handle_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let iter = match state.engine.log().read_from(query.from) {
        Ok(iter) => iter,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "LOG_ERROR", e),
    };

    let read = tokio::task::spawn_blocking(move || iter.take(limit).collect::<Result<Vec<_>>>()).await;

    match read {
        Ok(Ok(entries)) => Json(LogResponse {
            watermark: state.engine.watermark(),
            entries,
        })
        .into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "LOG_ERROR", e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e),
    }
}

async fn handle_submit(
    State(state): State<Arc<AppState>>,
    Json(operation): Json<Operation>,
) -> impl IntoResponse {
    let engine_state = state.engine.state();
    if engine_state != EngineState::Active {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "NOT_ACTIVE",
            format!("Node is {}", engine_state),
        );
    }

    // Log before apply: the store must never hold a change the log lacks
    let entry = match state.engine.broadcast(operation).await {
        Ok(entry) => entry,
        Err(e @ (Error::NotActive(_) | Error::ShuttingDown)) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "NOT_ACTIVE", e);
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "BROADCAST_FAILED", e),
    };

    // The submitting node is the origin, so it materializes the operation itself
    let apply_error = match state.store.apply(&entry.operation).await {
        Ok(()) => None,
        Err(e) => {
            let reason = e.to_string();
            state.engine.report_apply_failure(&entry, reason.clone());
            Some(reason)
        }
    };

    (
        StatusCode::CREATED,
        Json(SubmitResponse {
            sequence: entry.sequence,
            kind: entry.operation.kind().to_string(),
            applied: apply_error.is_none(),
            apply_error,
        }),
    )
        .into_response()
}
