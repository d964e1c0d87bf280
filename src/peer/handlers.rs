use super::{MessageOutcome, Peer, PeerState};
use crate::blockchain::Block;
use crate::error::ChainError;
use crate::message::{Action, Message};
use crate::transaction::Transaction;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Peer {
    /// Handles one inbound message to completion.
    pub async fn process_received_message(
        self: &Arc<Self>,
        message: Message,
    ) -> Result<MessageOutcome, ChainError> {
        let state = self.state().await;
        debug!(
            action = %message.action,
            peer = message.peer.as_deref().unwrap_or("-"),
            state = %state,
            "processing message"
        );

        if state == PeerState::AwaitingBlockchain && message.action != Action::Blocks {
            debug!(action = %message.action, "awaiting blockchain; message ignored");
            return Ok(MessageOutcome::Ignored);
        }

        match message.action {
            Action::Ping => self.handle_ping(&message),
            Action::SendBlockchainLength => {
                let length = match self.repository.get_blockchain() {
                    Ok(chain) => chain.length(),
                    Err(ChainError::NotFound(_)) => 0,
                    Err(e) => return Err(e),
                };
                self.reply(&message, Action::BlockchainLength, Some(length.to_string()))?;
                Ok(MessageOutcome::Processed)
            }
            Action::BlockchainLength => {
                info!(
                    peer = message.peer.as_deref().unwrap_or("-"),
                    length = message.data.as_deref().unwrap_or("-"),
                    "peer reported blockchain length"
                );
                Ok(MessageOutcome::Processed)
            }
            Action::SendBlocks => {
                let serialized = self
                    .repository
                    .get_all_blocks()?
                    .iter()
                    .map(Block::serialize)
                    .collect::<Result<Vec<_>, _>>()?;
                self.reply(&message, Action::Blocks, Some(serde_json::to_string(&serialized)?))?;
                Ok(MessageOutcome::Processed)
            }
            Action::AddBlock => {
                if self.preempt_countdown() {
                    info!("incoming block pre-empted the mining countdown");
                }
                let block = Block::deserialize(required_data(&message)?)?;
                match self.add_block(&block).await {
                    Ok(()) => Ok(MessageOutcome::Processed),
                    Err(ChainError::BlockGap { index, expected }) => {
                        warn!(index, expected, "gap in chain; requesting blocks");
                        self.request_resync_to(index).await?;
                        Ok(MessageOutcome::ResyncRequested)
                    }
                    Err(e) => Err(e),
                }
            }
            Action::AddTransaction => {
                let tx = Transaction::deserialize(required_data(&message)?)?;
                self.add_transaction(tx).await?;
                Ok(MessageOutcome::Processed)
            }
            Action::Blocks => {
                if state != PeerState::AwaitingBlockchain {
                    debug!("unsolicited blocks message ignored");
                    return Ok(MessageOutcome::Ignored);
                }
                self.replace_chain(required_data(&message)?).await?;
                Ok(MessageOutcome::Processed)
            }
        }
    }

    // A ping without data is a request; a ping carrying a status is the reply.
    fn handle_ping(&self, message: &Message) -> Result<MessageOutcome, ChainError> {
        match &message.data {
            None => {
                let status = serde_json::to_string(&self.status())?;
                self.reply(message, Action::Ping, Some(status))?;
            }
            Some(status) => {
                info!(
                    peer = message.peer.as_deref().unwrap_or("-"),
                    status = %status,
                    "ping reply"
                );
            }
        }
        Ok(MessageOutcome::Processed)
    }

    fn reply(&self, to: &Message, action: Action, data: Option<String>) -> Result<(), ChainError> {
        let peer = to.peer.as_deref().ok_or_else(|| {
            ChainError::InvalidMessage(format!("no peer to answer '{}'", to.action))
        })?;
        let reply = Message::reply(peer, action, data)?;
        self.transport.send(peer, &reply)
    }

    /// Enters `awaitingblockchain` and asks every peer for its blocks.
    pub async fn request_resync(&self) -> Result<(), ChainError> {
        self.resync_target.lock().take();
        self.begin_resync().await
    }

    /// Like [`Peer::request_resync`], but only a chain reaching `index` will
    /// end the resync.
    pub async fn request_resync_to(&self, index: u64) -> Result<(), ChainError> {
        *self.resync_target.lock() = Some(index);
        self.begin_resync().await
    }

    async fn begin_resync(&self) -> Result<(), ChainError> {
        self.preempt_countdown();
        self.set_state(PeerState::AwaitingBlockchain).await;
        self.broadcast_message(Action::SendBlocks, None)?;
        Ok(())
    }
}

fn required_data(message: &Message) -> Result<&str, ChainError> {
    message
        .data
        .as_deref()
        .ok_or_else(|| ChainError::InvalidMessage(format!("'{}' requires data", message.action)))
}
