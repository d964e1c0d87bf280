//! Peer orchestrator for ConsignChain
//!
//! The peer owns the transaction pool accounting, the state machine
//! (`running` / `mining` / `awaitingblockchain`), the inbound message queue
//! and every mutation of the local chain. Storage and transport are injected.

pub mod handlers;
pub mod mining;
pub mod state;

pub use state::{MessageOutcome, PeerConfig, PeerState, PeerStatus};

use crate::blockchain::{validate_blocks, Block, Blockchain, ConsignmentIndex};
use crate::crypto::KeyPair;
use crate::discovery::{peer_addresses, DiscoveryClient};
use crate::error::{ChainError, ErrorKind};
use crate::message::{Action, Message};
use crate::miner::{CountdownCancel, CountdownLauncher, CountdownOutcome, TokioCountdownLauncher};
use crate::network::{InboundHandler, NetworkNode, Transport};
use crate::persistence::{Collection, Repository};
use crate::sync::ChainReplacement;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Peer {
    repository: Arc<dyn Repository>,
    transport: Arc<dyn Transport>,
    keypair: KeyPair,
    config: PeerConfig,
    launcher: Arc<dyn CountdownLauncher>,
    state: RwLock<PeerState>,
    queue: Arc<Mutex<VecDeque<Message>>>,
    pool_size: AtomicUsize,
    // pairs pool inserts with their size accounting
    pool_lock: Mutex<()>,
    // serializes add-block and chain replacement
    chain_lock: tokio::sync::Mutex<()>,
    countdown: Mutex<Option<CountdownCancel>>,
    // index of the block whose gap triggered the current resync
    resync_target: Mutex<Option<u64>>,
    last_outcome: Mutex<Option<CountdownOutcome>>,
    started: Instant,
}

impl Peer {
    pub fn new(
        repository: Arc<dyn Repository>,
        transport: Arc<dyn Transport>,
        keypair: KeyPair,
        config: PeerConfig,
    ) -> Self {
        Self {
            repository,
            transport,
            keypair,
            config,
            launcher: Arc::new(TokioCountdownLauncher),
            state: RwLock::new(PeerState::Running),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            pool_size: AtomicUsize::new(0),
            pool_lock: Mutex::new(()),
            chain_lock: tokio::sync::Mutex::new(()),
            countdown: Mutex::new(None),
            resync_target: Mutex::new(None),
            last_outcome: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn CountdownLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Prepares storage and returns the chain the peer starts from.
    ///
    /// A stored chain that passes the audit is resumed; otherwise block
    /// storage is cleared and a fresh chain is rooted at the origin block.
    pub async fn bootstrap(&self, reset: bool) -> Result<Blockchain, ChainError> {
        let _guard = self.chain_lock.lock().await;

        if reset {
            info!("resetting local storage");
            for collection in Collection::ALL {
                self.repository.delete_collection(collection)?;
            }
        }
        for collection in Collection::ALL {
            self.repository.create_collection(collection)?;
        }

        let stored = match self.repository.get_blockchain() {
            Ok(chain) if validate_blocks(&chain, self.repository.as_ref()) => Some(chain),
            Ok(_) => {
                warn!("stored chain failed its audit; starting from the origin block");
                None
            }
            Err(ChainError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let blockchain = match stored {
            Some(chain) => {
                info!(
                    length = chain.length(),
                    latest_index = chain.latest_block_index(),
                    "resuming stored chain"
                );
                chain
            }
            None => {
                for collection in [Collection::Blocks, Collection::ConsignmentIndex, Collection::Blockchain] {
                    self.repository.delete_collection(collection)?;
                    self.repository.create_collection(collection)?;
                }
                let origin = Block::origin();
                self.repository.add_block(&origin)?;
                let chain = Blockchain::from_origin(&origin);
                self.repository.add_blockchain(&chain)?;
                info!(origin = %origin.id(), "created chain from origin block");
                chain
            }
        };

        let pool = self.recompute_pool_size()?;
        debug!(pool_size = pool, "pool size restored");
        Ok(blockchain)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub async fn state(&self) -> PeerState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: PeerState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!(from = %*current, to = %state, "peer state change");
            *current = state;
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn pool_threshold(&self) -> usize {
        self.config.pool_threshold
    }

    /// Running byte total of the pool, as last accounted.
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::SeqCst)
    }

    /// Byte total of the pool as currently stored.
    pub fn repository_pool_size(&self) -> Result<usize, ChainError> {
        Ok(self
            .repository
            .get_all_transactions()?
            .iter()
            .map(Transaction::get_size)
            .sum())
    }

    pub(crate) fn recompute_pool_size(&self) -> Result<usize, ChainError> {
        let _pool = self.pool_lock.lock();
        let size = self.repository_pool_size()?;
        self.pool_size.store(size, Ordering::SeqCst);
        Ok(size)
    }

    pub fn last_countdown_outcome(&self) -> Option<CountdownOutcome> {
        *self.last_outcome.lock()
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            status: "OK".to_string(),
            uptime_millis: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    // ------------------------------------------------------------------
    // Transaction pool
    // ------------------------------------------------------------------

    /// Admits a transaction to the pool. Returns `false` when it was already
    /// pooled. Admission may start a mining countdown.
    pub async fn add_transaction(self: &Arc<Self>, tx: Transaction) -> Result<bool, ChainError> {
        tx.check()?;
        let size = {
            let _pool = self.pool_lock.lock();
            if self.repository.contains_transaction(tx.id())? {
                debug!(tx_id = %tx.id(), "transaction already pooled");
                return Ok(false);
            }
            self.repository.add_transaction(&tx)?;
            self.pool_size.fetch_add(tx.get_size(), Ordering::SeqCst) + tx.get_size()
        };
        info!(
            tx_id = %tx.id(),
            consignment = %tx.consignmentid(),
            pool_size = size,
            threshold = self.config.pool_threshold,
            "transaction pooled"
        );

        self.check_transaction_pool().await;
        Ok(true)
    }

    /// Starts a mining countdown when the pool is over threshold and the peer
    /// is idle. Returns whether a countdown was started.
    pub async fn check_transaction_pool(self: &Arc<Self>) -> bool {
        if self.pool_size() <= self.config.pool_threshold {
            return false;
        }
        let (minimum, range) = (self.config.countdown_minimum, self.config.countdown_range);
        self.start_mining_countdown(minimum, range).await.is_ok()
    }

    // ------------------------------------------------------------------
    // Chain mutation
    // ------------------------------------------------------------------

    /// Appends a block from the network or from local mining.
    pub async fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        let _guard = self.chain_lock.lock().await;
        self.append_block(block)
    }

    // Caller holds `chain_lock`.
    pub(crate) fn append_block(&self, block: &Block) -> Result<(), ChainError> {
        if !Block::validate(block) {
            return Err(ChainError::InvalidBlock(format!(
                "hash mismatch for block {}",
                block.id()
            )));
        }

        let mut chain = self.repository.get_blockchain()?;
        let latest = chain.latest_block_index();
        if block.index() <= latest {
            return Err(ChainError::StaleBlock {
                index: block.index(),
                latest,
            });
        }
        if block.index() > latest + 1 {
            return Err(ChainError::BlockGap {
                index: block.index(),
                expected: latest + 1,
            });
        }
        if block.previous_hash() != chain.latest_block_id() {
            return Err(ChainError::BlockLinkage {
                expected: chain.latest_block_id().to_string(),
                found: block.previous_hash().to_string(),
            });
        }
        let transactions = block.transactions()?;

        self.repository.add_block(block)?;
        chain.increment_length();
        chain.set_latest_block_id(block.id());
        chain.set_latest_block_index(block.index());
        chain.rehash();
        self.repository.add_blockchain(&chain)?;

        for tx in &transactions {
            self.index_block(block.id(), tx.consignmentid())?;
            self.repository.delete_transaction(tx.id())?;
        }
        let pool = self.recompute_pool_size()?;

        info!(
            index = block.index(),
            block_id = %block.id(),
            transactions = transactions.len(),
            length = chain.length(),
            pool_size = pool,
            "block appended"
        );
        Ok(())
    }

    /// Records that `blockid` holds a transaction of `consignmentid`.
    pub fn index_block(&self, blockid: &str, consignmentid: &str) -> Result<(), ChainError> {
        let index = match self.repository.get_consignment_index(consignmentid) {
            Ok(mut index) => {
                if !index.insert(blockid) {
                    return Ok(());
                }
                index
            }
            Err(ChainError::NotFound(_)) => ConsignmentIndex::new(consignmentid, blockid),
            Err(e) => return Err(e),
        };
        self.repository.add_consignment_index(&index)
    }

    /// Replaces the local chain with a validated `blocks` payload and returns
    /// the peer to `running`. The payload must extend past the local tip and
    /// reach the block that triggered the resync.
    pub async fn replace_chain(&self, payload: &str) -> Result<Blockchain, ChainError> {
        let _guard = self.chain_lock.lock().await;

        let local = self.repository.get_all_blocks()?;
        let replacement = ChainReplacement::prepare(payload, &local)?;
        let target = *self.resync_target.lock();
        if let Some(target) = target {
            replacement.require_tip_beyond(target.saturating_sub(1))?;
        }
        let contents = replacement
            .blocks()
            .iter()
            .map(|b| b.transactions().map(|txs| (b.id().to_string(), txs)))
            .collect::<Result<Vec<_>, _>>()?;

        for collection in [Collection::Blocks, Collection::ConsignmentIndex] {
            self.repository.delete_collection(collection)?;
            self.repository.create_collection(collection)?;
        }
        for block in replacement.blocks() {
            self.repository.add_block(block)?;
        }
        for (blockid, transactions) in &contents {
            for tx in transactions {
                self.index_block(blockid, tx.consignmentid())?;
                self.repository.delete_transaction(tx.id())?;
            }
        }

        let chain = replacement.blockchain();
        self.repository.add_blockchain(&chain)?;
        self.recompute_pool_size()?;
        self.resync_target.lock().take();
        self.set_state(PeerState::Running).await;

        info!(
            length = chain.length(),
            latest_index = chain.latest_block_index(),
            received = replacement.received(),
            "chain replaced"
        );
        Ok(chain)
    }

    /// Transactions of `consignmentid` across every block that holds one.
    pub fn consignment_transactions(&self, consignmentid: &str) -> Result<Vec<Transaction>, ChainError> {
        let index = self.repository.get_consignment_index(consignmentid)?;
        let mut found = Vec::new();
        for blockid in &index.blockids {
            let block = self.repository.get_block(blockid)?;
            found.extend(
                block
                    .transactions()?
                    .into_iter()
                    .filter(|tx| tx.consignmentid() == consignmentid),
            );
        }
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    pub fn enqueue(&self, message: Message) {
        self.queue.lock().push_back(message);
    }

    /// Callback for the transport: only enqueues.
    pub fn inbound_handler(&self) -> InboundHandler {
        let queue = Arc::clone(&self.queue);
        Arc::new(move |message: Message| {
            queue.lock().push_back(message);
        })
    }

    pub fn broadcast_message(&self, action: Action, data: Option<String>) -> Result<usize, ChainError> {
        let message = Message::broadcast(action, data)?;
        let reached = self.transport.broadcast(&message)?;
        debug!(action = %action, reached, "broadcast");
        Ok(reached)
    }

    /// Pops and processes at most one queued message.
    pub async fn process_next_message(self: &Arc<Self>) -> Option<Result<MessageOutcome, ChainError>> {
        let message = self.queue.lock().pop_front()?;
        Some(self.process_received_message(message).await)
    }

    /// Spawns the polling loop draining the inbound queue.
    pub fn listen(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match peer.process_next_message().await {
                    None | Some(Ok(_)) => {}
                    Some(Err(e)) => match e.kind() {
                        ErrorKind::Validation | ErrorKind::Ordering | ErrorKind::NotFound => {
                            warn!(error = %e, "message rejected")
                        }
                        _ => error!(error = %e, "message processing failed"),
                    },
                }
            }
        })
    }

    /// Spawns the periodic pool check.
    pub fn monitor_transaction_pool(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if peer.check_transaction_pool().await {
                    debug!("pool monitor started a countdown");
                }
            }
        })
    }
}

/// Wires a peer into the network: hooks the transport to the peer's queue,
/// dials every peer the discovery server knows and then registers.
/// Returns the number of peers connected.
pub async fn setup_peer_network(
    peer: &Peer,
    node: &Arc<NetworkNode>,
    discovery: &DiscoveryClient,
    host: &str,
    port: u16,
    webport: u16,
) -> Result<usize, ChainError> {
    node.set_inbound_handler(peer.inbound_handler());

    let nodes = discovery.get_peers().await?;
    let own = format!("{}:{}", host, port);
    let targets: Vec<String> = peer_addresses(&nodes)
        .into_iter()
        .filter(|addr| addr != &own)
        .collect();

    let connected = node.connect_all(&targets).await;
    discovery.register(port, webport).await?;
    info!(known = targets.len(), connected, "joined peer network");
    Ok(connected)
}
