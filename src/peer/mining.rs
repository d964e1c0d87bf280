use super::{Peer, PeerState};
use crate::blockchain::Block;
use crate::error::ChainError;
use crate::message::Action;
use crate::miner::{CountdownOutcome, MiningCountdown};
use crate::transaction::Transaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Peer {
    /// Moves `running → mining` and launches a countdown. The exit handler
    /// mines on success and returns the peer to `running` either way, unless
    /// a resync took over in the meantime.
    pub async fn start_mining_countdown(
        self: &Arc<Self>,
        minimum: Duration,
        range: Duration,
    ) -> Result<(), ChainError> {
        {
            let mut state = self.state.write().await;
            if *state != PeerState::Running {
                return Err(ChainError::InvalidState(format!(
                    "cannot start mining while {}",
                    *state
                )));
            }
            *state = PeerState::Mining;
        }

        let (cancel, handle) = self.launcher.launch(minimum, range).into_parts();
        *self.countdown.lock() = Some(cancel);
        info!(
            minimum_ms = minimum.as_millis() as u64,
            range_ms = range.as_millis() as u64,
            pool_size = self.pool_size(),
            "mining countdown started"
        );

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = MiningCountdown::outcome(handle).await;
            peer.finish_countdown(outcome).await;
        });
        Ok(())
    }

    async fn finish_countdown(&self, outcome: CountdownOutcome) {
        *self.last_outcome.lock() = Some(outcome);
        self.countdown.lock().take();

        match outcome {
            CountdownOutcome::Success => match self.mine().await {
                Ok(Some(block)) => debug!(index = block.index(), "countdown won"),
                Ok(None) => debug!("countdown won but the pool is empty"),
                Err(e) => warn!(error = %e, "mining after countdown failed"),
            },
            CountdownOutcome::Preempted => info!("mining countdown pre-empted"),
        }

        let mut state = self.state.write().await;
        if *state == PeerState::Mining {
            *state = PeerState::Running;
        }
    }

    /// Cancels a running countdown. Returns whether one was cancelled.
    pub fn preempt_countdown(&self) -> bool {
        match self.countdown.lock().take() {
            Some(cancel) => cancel.preempt(),
            None => false,
        }
    }

    /// Pool transactions for the next block: ascending timestamp (ties in
    /// arrival order), added while the running size stays within the
    /// threshold. The first transaction is always taken.
    pub fn gather_transactions(&self) -> Result<Vec<Transaction>, ChainError> {
        let pool = self.repository.get_all_transactions()?;
        let mut gathered = Vec::new();
        let mut size = 0usize;
        for tx in pool {
            let next = size + tx.get_size();
            if !gathered.is_empty() && next > self.config.pool_threshold {
                break;
            }
            size = next;
            gathered.push(tx);
        }
        debug!(count = gathered.len(), bytes = size, "gathered transactions");
        Ok(gathered)
    }

    /// Gathers and mines. `Ok(None)` when the pool is empty.
    pub async fn mine(&self) -> Result<Option<Block>, ChainError> {
        let block = {
            let _guard = self.chain_lock.lock().await;
            // gathered under the lock so an incoming block cannot claim them first
            let transactions = self.gather_transactions()?;
            if transactions.is_empty() {
                return Ok(None);
            }
            self.forge_block(&transactions)?
        };
        self.announce_block(&block)?;
        Ok(Some(block))
    }

    /// Builds the next block from `transactions`, appends it locally and
    /// broadcasts it with `addblock`.
    pub async fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, ChainError> {
        let block = {
            let _guard = self.chain_lock.lock().await;
            self.forge_block(&transactions)?
        };
        self.announce_block(&block)?;
        Ok(block)
    }

    // Caller holds `chain_lock`.
    fn forge_block(&self, transactions: &[Transaction]) -> Result<Block, ChainError> {
        let chain = self.repository.get_blockchain()?;
        let block = Block::from_scratch(
            chain.latest_block_index() + 1,
            chain.latest_block_id(),
            transactions,
        )?;
        self.append_block(&block)?;
        info!(index = block.index(), block_id = %block.id(), "mined block");
        Ok(block)
    }

    fn announce_block(&self, block: &Block) -> Result<(), ChainError> {
        match self.broadcast_message(Action::AddBlock, Some(block.serialize()?)) {
            Ok(reached) => debug!(reached, "addblock broadcast"),
            Err(e) => warn!(error = %e, "addblock broadcast failed"),
        }
        Ok(())
    }
}
