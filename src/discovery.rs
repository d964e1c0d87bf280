//! Peer discovery for ConsignChain
//!
//! A discovery server keeps the list of active peers grouped by IP. Peers
//! fetch the list on start, dial everyone on it and then register themselves.

use crate::error::ChainError;
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// One registered peer process on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub port: u16,
    #[serde(default)]
    pub webport: u16,
}

/// Registered peers keyed by IP.
pub type ActiveNodes = BTreeMap<String, Vec<NodeEntry>>;

/// `ip:port` addresses of every registered peer.
pub fn peer_addresses(nodes: &ActiveNodes) -> Vec<String> {
    nodes
        .iter()
        .flat_map(|(ip, entries)| entries.iter().map(move |e| format!("{}:{}", ip, e.port)))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub port: u16,
    #[serde(default)]
    pub webport: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub port: u16,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the discovery server.
pub struct DiscoveryClient {
    client: reqwest::Client,
    base_url: String,
}

impl DiscoveryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self) -> String {
        format!("{}/activeNodes", self.base_url)
    }

    pub async fn get_peers(&self) -> Result<ActiveNodes, ChainError> {
        let response = self.client.get(self.url()).send().await.map_err(|e| {
            ChainError::NetworkError(format!(
                "cannot retrieve list of peers from discovery server: {}",
                e
            ))
        })?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn register(&self, port: u16, webport: u16) -> Result<ActiveNodes, ChainError> {
        let response = self
            .client
            .post(self.url())
            .json(&RegisterRequest { port, webport })
            .send()
            .await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn deregister(&self, port: u16) -> Result<(), ChainError> {
        let response = self
            .client
            .delete(self.url())
            .json(&DeregisterRequest { port })
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::NotFound(format!("port {} is not registered", port)));
        }
        response.error_for_status()?;
        Ok(())
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub hosts: usize,
    pub nodes: usize,
    pub registrations: u64,
    pub uptime_secs: u64,
}

/// In-memory registry behind the discovery server. Writes go through one lock.
pub struct DiscoveryRegistry {
    nodes: RwLock<ActiveNodes>,
    registrations: AtomicU64,
    started: Instant,
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            registrations: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Adds (or refreshes) `ip:port`. Returns the registry after the change.
    pub fn register(&self, ip: &str, entry: NodeEntry) -> ActiveNodes {
        let mut nodes = self.nodes.write();
        let entries = nodes.entry(ip.to_string()).or_default();
        match entries.iter_mut().find(|e| e.port == entry.port) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.registrations.fetch_add(1, Ordering::Relaxed);
        nodes.clone()
    }

    pub fn deregister(&self, ip: &str, port: u16) -> Result<ActiveNodes, ChainError> {
        let mut nodes = self.nodes.write();
        let entries = nodes
            .get_mut(ip)
            .ok_or_else(|| ChainError::NotFound(format!("no peers registered from {}", ip)))?;
        let before = entries.len();
        entries.retain(|e| e.port != port);
        if entries.len() == before {
            return Err(ChainError::NotFound(format!("{}:{} is not registered", ip, port)));
        }
        if entries.is_empty() {
            nodes.remove(ip);
        }
        Ok(nodes.clone())
    }

    pub fn snapshot(&self) -> ActiveNodes {
        self.nodes.read().clone()
    }

    pub fn stats(&self) -> DiscoveryStats {
        let nodes = self.nodes.read();
        DiscoveryStats {
            hosts: nodes.len(),
            nodes: nodes.values().map(Vec::len).sum(),
            registrations: self.registrations.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

struct DiscoveryError(ChainError);

impl IntoResponse for DiscoveryError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ChainError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn caller_ip(info: Option<ConnectInfo<SocketAddr>>) -> String {
    info.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

async fn get_active_nodes(State(registry): State<Arc<DiscoveryRegistry>>) -> Json<ActiveNodes> {
    Json(registry.snapshot())
}

async fn post_active_node(
    State(registry): State<Arc<DiscoveryRegistry>>,
    info: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let ip = caller_ip(info);
    info!(ip = %ip, port = req.port, webport = req.webport, "discovery.register");
    let nodes = registry.register(
        &ip,
        NodeEntry {
            port: req.port,
            webport: req.webport,
        },
    );
    (StatusCode::CREATED, Json(nodes))
}

async fn delete_active_node(
    State(registry): State<Arc<DiscoveryRegistry>>,
    info: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<DeregisterRequest>,
) -> Result<Json<ActiveNodes>, DiscoveryError> {
    let ip = caller_ip(info);
    info!(ip = %ip, port = req.port, "discovery.deregister");
    registry
        .deregister(&ip, req.port)
        .map(Json)
        .map_err(DiscoveryError)
}

async fn get_stats(State(registry): State<Arc<DiscoveryRegistry>>) -> Json<DiscoveryStats> {
    Json(registry.stats())
}

pub fn build_discovery_router(registry: Arc<DiscoveryRegistry>) -> Router {
    Router::new()
        .route(
            "/activeNodes",
            get(get_active_nodes)
                .post(post_active_node)
                .delete(delete_active_node),
        )
        .route("/stats", get(get_stats))
        .with_state(registry)
}

pub async fn run_discovery_server(
    registry: Arc<DiscoveryRegistry>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "discovery server listening");

    let app = build_discovery_router(registry);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_groups_by_ip() {
        let registry = DiscoveryRegistry::new();
        registry.register("10.0.0.1", NodeEntry { port: 4000, webport: 3000 });
        registry.register("10.0.0.1", NodeEntry { port: 4001, webport: 3001 });
        let nodes = registry.register("10.0.0.2", NodeEntry { port: 4000, webport: 3000 });

        assert_eq!(nodes.len(), 2);
        assert_eq!(
            peer_addresses(&nodes),
            vec!["10.0.0.1:4000", "10.0.0.1:4001", "10.0.0.2:4000"]
        );
    }

    #[test]
    fn test_reregistration_does_not_duplicate() {
        let registry = DiscoveryRegistry::new();
        registry.register("10.0.0.1", NodeEntry { port: 4000, webport: 3000 });
        let nodes = registry.register("10.0.0.1", NodeEntry { port: 4000, webport: 3005 });
        assert_eq!(nodes["10.0.0.1"], vec![NodeEntry { port: 4000, webport: 3005 }]);
        assert_eq!(registry.stats().registrations, 2);
        assert_eq!(registry.stats().nodes, 1);
    }

    #[test]
    fn test_deregister_removes_empty_host() {
        let registry = DiscoveryRegistry::new();
        registry.register("10.0.0.1", NodeEntry { port: 4000, webport: 3000 });
        let nodes = registry.deregister("10.0.0.1", 4000).unwrap();
        assert!(nodes.is_empty());
        assert!(matches!(
            registry.deregister("10.0.0.1", 4000),
            Err(ChainError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_client_registers_and_deregisters() {
        let registry = Arc::new(DiscoveryRegistry::new());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_discovery_router(registry.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        let client = DiscoveryClient::new(format!("http://{}/", addr), Duration::from_secs(5)).unwrap();
        let nodes = client.register(4100, 3100).await.unwrap();
        assert_eq!(peer_addresses(&nodes), vec!["127.0.0.1:4100"]);
        let nodes = client.get_peers().await.unwrap();
        assert_eq!(nodes["127.0.0.1"], vec![NodeEntry { port: 4100, webport: 3100 }]);

        client.deregister(4100).await.unwrap();
        assert!(registry.snapshot().is_empty());
        assert!(matches!(
            client.deregister(4100).await,
            Err(ChainError::NotFound(_))
        ));
    }
}
