//! REST front door for a ConsignChain peer
//!
//! Clients submit consignment events here and query the local chain. A
//! submitted transaction is signed with the peer's key, pooled and gossiped.

use axum::{
    extract::{Path, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::blockchain::{Block, Blockchain};
use crate::error::{ChainError, ErrorKind};
use crate::message::Action;
use crate::peer::Peer;
use crate::transaction::{Transaction, TransactionType};

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    InvalidInput(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Chain(e) => {
                let status = match e.kind() {
                    ErrorKind::Validation | ErrorKind::Ordering => StatusCode::BAD_REQUEST,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::State => StatusCode::CONFLICT,
                    ErrorKind::Transport | ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /transactions`. Non-string `data` is stored as its JSON text.
#[derive(Debug, Deserialize)]
pub struct SubmitTransactionRequest {
    pub consignmentid: String,
    pub transactiontype: String,
    pub datatype: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PoolResponse {
    pub size: usize,
    pub reposize: usize,
    pub threshold: usize,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub uptime_millis: u64,
    pub state: String,
    pub pool_size: usize,
    pub peers: Vec<String>,
}

async fn logging_middleware(State(peer): State<Arc<Peer>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let peer_state = peer.state().await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %duration.as_millis(),
        peer_state = %peer_state,
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

pub fn build_api_router(peer: Arc<Peer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(vec![http::header::CONTENT_TYPE]);

    Router::new()
        .route("/transactions", get(get_transactions).post(submit_transaction))
        .route("/blocks", get(get_blocks))
        .route("/blockchain", get(get_blockchain))
        .route("/consignments/:consignmentid", get(get_consignment))
        .route("/status", get(get_status))
        .layer(middleware::from_fn_with_state(peer.clone(), logging_middleware))
        .with_state(peer)
        .layer(cors)
}

pub async fn run_api_server(peer: Arc<Peer>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "api server listening");

    axum::serve(listener, build_api_router(peer)).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn submit_transaction(
    State(peer): State<Arc<Peer>>,
    Json(req): Json<SubmitTransactionRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let transactiontype: TransactionType = req.transactiontype.parse()?;
    let data = match req.data {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => {
            return Err(ApiError::InvalidInput("data must be provided".to_string()))
        }
        other => other.to_string(),
    };

    let tx = Transaction::from_scratch(
        req.consignmentid,
        transactiontype,
        req.datatype,
        data,
        peer.keypair(),
    )?;

    if peer.add_transaction(tx.clone()).await? {
        if let Err(e) = peer.broadcast_message(Action::AddTransaction, Some(tx.serialize()?)) {
            tracing::warn!(tx_id = %tx.id(), error = %e, "addtransaction broadcast failed");
        }
    }
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn get_transactions(State(peer): State<Arc<Peer>>) -> Result<Json<PoolResponse>, ApiError> {
    let transactions = peer.repository().get_all_transactions()?;
    let reposize = transactions.iter().map(Transaction::get_size).sum();
    Ok(Json(PoolResponse {
        size: peer.pool_size(),
        reposize,
        threshold: peer.pool_threshold(),
        transactions,
    }))
}

async fn get_blocks(State(peer): State<Arc<Peer>>) -> Result<Json<Vec<Block>>, ApiError> {
    Ok(Json(peer.repository().get_all_blocks()?))
}

async fn get_blockchain(State(peer): State<Arc<Peer>>) -> Result<Json<Blockchain>, ApiError> {
    Ok(Json(peer.repository().get_blockchain()?))
}

async fn get_consignment(
    State(peer): State<Arc<Peer>>,
    Path(consignmentid): Path<String>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    Ok(Json(peer.consignment_transactions(&consignmentid)?))
}

async fn get_status(State(peer): State<Arc<Peer>>) -> Json<StatusResponse> {
    let status = peer.status();
    Json(StatusResponse {
        status: status.status,
        uptime_millis: status.uptime_millis,
        state: peer.state().await.to_string(),
        pool_size: peer.pool_size(),
        peers: peer.transport().connected_peers(),
    })
}
