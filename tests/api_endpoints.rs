//! Integration tests for the ConsignChain REST endpoints
//!
//! These tests drive the router against a bootstrapped peer backed by the
//! in-memory repository and check the JSON shapes clients rely on.

use axum_test::TestServer;
use consignchain::api::build_api_router;
use consignchain::crypto::KeyPair;
use consignchain::network::NetworkNode;
use consignchain::peer::{Peer, PeerConfig};
use consignchain::persistence::{InMemoryRepository, Repository};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn test_server(threshold: usize) -> (TestServer, Arc<Peer>) {
    let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let config = PeerConfig {
        pool_threshold: threshold,
        countdown_minimum: Duration::from_secs(3600),
        countdown_range: Duration::ZERO,
    };
    let peer = Arc::new(Peer::new(
        repository,
        NetworkNode::new(),
        KeyPair::generate().expect("Failed to generate key"),
        config,
    ));
    peer.bootstrap(true).await.expect("Failed to bootstrap peer");

    let server = TestServer::new(build_api_router(peer.clone())).expect("Failed to create test server");
    (server, peer)
}

#[tokio::test]
async fn test_fresh_peer_endpoints() {
    let (server, _peer) = test_server(4000).await;

    let response = server.get("/status").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "OK");
    assert_eq!(json["state"], "running");
    assert!(json["uptimeMillis"].is_number());
    assert!(json["peers"].is_array());

    let response = server.get("/blockchain").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["id"], "blockchain");
    assert_eq!(json["length"], 1);
    assert_eq!(json["latestblockindex"], 0);

    let response = server.get("/blocks").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["previousHash"], "-1");

    let response = server.get("/transactions").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["size"], 0);
    assert_eq!(json["reposize"], 0);
    assert_eq!(json["threshold"], 4000);
    assert_eq!(json["transactions"], json!([]));
}

#[tokio::test]
async fn test_submit_transaction_signs_and_pools() {
    let (server, peer) = test_server(4000).await;

    let response = server
        .post("/transactions")
        .json(&json!({
            "consignmentid": "c-100",
            "transactiontype": "despatched",
            "datatype": "application/json",
            "data": { "from": "Rotterdam", "pallets": 12 }
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    let tx: Value = response.json();
    assert_eq!(tx["consignmentid"], "c-100");
    assert_eq!(tx["publickey"], peer.public_key_hex());
    // non-string payloads are stored as their JSON text
    let data: Value = serde_json::from_str(tx["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["pallets"], 12);

    let json: Value = server.get("/transactions").await.json();
    assert_eq!(json["transactions"].as_array().unwrap().len(), 1);
    assert!(json["size"].as_u64().unwrap() > 0);
    assert_eq!(json["size"], json["reposize"]);
}

#[tokio::test]
async fn test_submit_rejects_bad_input() {
    let (server, _peer) = test_server(4000).await;

    let response = server
        .post("/transactions")
        .json(&json!({
            "consignmentid": "c-100",
            "transactiontype": "shipped",
            "datatype": "text/plain",
            "data": "x"
        }))
        .await;
    assert_eq!(response.status_code(), 400);
    let json: Value = response.json();
    assert!(json["error"].as_str().unwrap().contains("shipped"));

    let response = server
        .post("/transactions")
        .json(&json!({
            "consignmentid": "c-100",
            "transactiontype": "received",
            "datatype": "",
            "data": "x"
        }))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_consignment_history_after_mining() {
    let (server, peer) = test_server(1_000_000).await;

    for (consignment, step) in [("c-7", "left depot"), ("c-8", "booked"), ("c-7", "at border")] {
        let response = server
            .post("/transactions")
            .json(&json!({
                "consignmentid": consignment,
                "transactiontype": "crossedborder",
                "datatype": "text/plain",
                "data": step
            }))
            .await;
        assert_eq!(response.status_code(), 201);
    }

    let response = server.get("/consignments/c-7").await;
    assert_eq!(response.status_code(), 404);

    peer.mine().await.unwrap().expect("nothing mined");

    let response = server.get("/consignments/c-7").await;
    assert_eq!(response.status_code(), 200);
    let history: Value = response.json();
    let steps: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["data"].as_str().unwrap())
        .collect();
    assert_eq!(steps.len(), 2);
    assert!(steps.contains(&"left depot") && steps.contains(&"at border"));

    let json: Value = server.get("/blockchain").await.json();
    assert_eq!(json["length"], 2);
    let json: Value = server.get("/transactions").await.json();
    assert_eq!(json["size"], 0);
}
