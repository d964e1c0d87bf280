//! P2P transport for ConsignChain
//!
//! Every connection carries newline-delimited JSON [`Message`]s in both
//! directions. Inbound lines are decoded, tagged with the connection's address
//! and handed to the registered handler; the peer only ever enqueues them.

use crate::error::ChainError;
use crate::message::Message;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub type InboundHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Outbound side of the peer network.
pub trait Transport: Send + Sync {
    /// Sends to one connected peer. Unknown addresses fail immediately.
    fn send(&self, peer: &str, message: &Message) -> Result<(), ChainError>;
    /// Sends to every connected peer; returns how many were reached.
    fn broadcast(&self, message: &Message) -> Result<usize, ChainError>;
    fn connected_peers(&self) -> Vec<String>;
    /// Drops the connection to `peer`; `false` if there was none.
    fn end_connection(&self, peer: &str) -> bool;
}

struct Connection {
    // distinguishes a reconnect under the same address
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

/// TCP implementation of [`Transport`].
pub struct NetworkNode {
    connections: RwLock<HashMap<String, Connection>>,
    handler: RwLock<Option<InboundHandler>>,
    next_id: AtomicU64,
}

impl NetworkNode {
    pub fn new() -> Arc<Self> {
        Arc::new(NetworkNode {
            connections: RwLock::new(HashMap::new()),
            handler: RwLock::new(None),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn set_inbound_handler(&self, handler: InboundHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Binds `addr` and accepts connections in the background. Returns the
    /// bound address (useful with port 0).
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, ChainError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("P2P port {} unavailable: {}", addr, e)))?;
        let local = listener.local_addr()?;
        info!(addr = %local, "p2p listening");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        info!(peer = %remote, "incoming connection");
                        node.attach(stream, remote.to_string());
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dials `addr` and registers the connection under that address.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), ChainError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChainError::NetworkError(format!("Failed to connect to {}: {}", addr, e)))?;
        info!(peer = %addr, "connected");
        self.attach(stream, addr.to_string());
        Ok(())
    }

    /// Dials every address, logging failures. Returns the number connected.
    pub async fn connect_all(self: &Arc<Self>, addrs: &[String]) -> usize {
        let mut connected = 0;
        for addr in addrs {
            match self.connect(addr).await {
                Ok(()) => connected += 1,
                Err(e) => warn!(peer = %addr, error = %e, "peer unreachable"),
            }
        }
        connected
    }

    fn attach(self: &Arc<Self>, stream: TcpStream, key: String) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_key = key.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!(peer = %writer_key, error = %e, "write failed");
                    break;
                }
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // held until the entry is in, so a reader that ends at once still finds it
        let mut connections = self.connections.write();

        let node = Arc::clone(self);
        let reader_key = key.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match Message::from_wire(&line, &reader_key) {
                        Ok(message) => node.dispatch(message),
                        Err(e) => warn!(peer = %reader_key, error = %e, "dropping malformed message"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %reader_key, error = %e, "read failed");
                        break;
                    }
                }
            }
            debug!(peer = %reader_key, "connection closed");
            let mut connections = node.connections.write();
            if connections.get(&reader_key).map(|c| c.id) == Some(id) {
                connections.remove(&reader_key);
            }
        });

        let replaced = connections.insert(
            key.clone(),
            Connection {
                id,
                outbound: tx,
                reader: reader.abort_handle(),
            },
        );
        if let Some(old) = replaced {
            debug!(peer = %key, "replaced existing connection");
            old.reader.abort();
        }
    }

    fn dispatch(&self, message: Message) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!(action = %message.action, "no inbound handler; message dropped"),
        }
    }
}

impl Transport for NetworkNode {
    fn send(&self, peer: &str, message: &Message) -> Result<(), ChainError> {
        let line = message.to_wire()?;
        let connections = self.connections.read();
        let connection = connections
            .get(peer)
            .ok_or_else(|| ChainError::NetworkError(format!("No connection to peer {}", peer)))?;
        connection
            .outbound
            .send(line)
            .map_err(|_| ChainError::NetworkError(format!("Connection to {} is closed", peer)))
    }

    fn broadcast(&self, message: &Message) -> Result<usize, ChainError> {
        let line = message.to_wire()?;
        let connections = self.connections.read();
        let reached = connections
            .values()
            .filter(|c| c.outbound.send(line.clone()).is_ok())
            .count();
        Ok(reached)
    }

    fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn end_connection(&self, peer: &str) -> bool {
        match self.connections.write().remove(peer) {
            Some(connection) => {
                connection.reader.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let node = NetworkNode::new();
        let message = Message::broadcast(Action::Ping, None).unwrap();
        assert!(matches!(
            node.send("127.0.0.1:1", &message),
            Err(ChainError::NetworkError(_))
        ));
        assert_eq!(node.broadcast(&message).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_messages_cross_the_wire() {
        let server = NetworkNode::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        server.set_inbound_handler(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        let addr = server.listen("127.0.0.1:0").await.unwrap();

        let client = NetworkNode::new();
        client.connect(&addr.to_string()).await.unwrap();
        assert_eq!(client.connected_peers(), vec![addr.to_string()]);

        let message = Message::broadcast(Action::SendBlocks, None).unwrap();
        assert_eq!(client.broadcast(&message).unwrap(), 1);

        let received = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .unwrap();
        assert_eq!(received.action, Action::SendBlocks);
        assert!(received.peer.is_some());

        assert!(client.end_connection(&addr.to_string()));
        assert!(client.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_survives_old_connection_closing() {
        let server = NetworkNode::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        server.set_inbound_handler(Arc::new(move |m| {
            let _ = tx.send(m);
        }));
        let addr = server.listen("127.0.0.1:0").await.unwrap().to_string();

        let client = NetworkNode::new();
        client.connect(&addr).await.unwrap();
        client.connect(&addr).await.unwrap();

        // let the first connection's teardown run its course
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.connected_peers(), vec![addr.clone()]);

        let message = Message::broadcast(Action::Ping, None).unwrap();
        assert_eq!(client.broadcast(&message).unwrap(), 1);
        let received = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .unwrap();
        assert_eq!(received.action, Action::Ping);
    }
}
