//! Chain replacement for a peer that fell behind
//!
//! When an `addblock` leaves a gap, the peer asks the network for blocks and
//! replaces its chain with the `blocks` response. Everything is validated here
//! before the peer touches storage, so a bad response leaves the local chain
//! exactly as it was.

use crate::blockchain::{Block, Blockchain};
use crate::error::ChainError;
use std::collections::BTreeMap;
use tracing::debug;

/// A validated replacement chain, ready to be written.
#[derive(Debug, Clone)]
pub struct ChainReplacement {
    blocks: Vec<Block>,
    received: usize,
}

impl ChainReplacement {
    /// Validates a `blocks` payload (a JSON array of serialized blocks)
    /// against the local chain.
    ///
    /// Local blocks below the lowest received index are kept, so a response
    /// holding only the missing suffix is enough. The merged chain must start
    /// at the origin block, have contiguous indices and intact hash links, and
    /// must reach past the local tip.
    pub fn prepare(payload: &str, local_blocks: &[Block]) -> Result<Self, ChainError> {
        let serialized: Vec<String> = serde_json::from_str(payload)
            .map_err(|e| ChainError::InvalidBlock(format!("malformed blocks payload: {}", e)))?;
        if serialized.is_empty() {
            return Err(ChainError::InvalidBlock("empty blocks payload".to_string()));
        }

        let received = serialized
            .iter()
            .map(|s| Block::deserialize(s))
            .collect::<Result<Vec<_>, _>>()?;
        let local_tip = local_blocks.iter().map(Block::index).max();

        let lowest = received
            .iter()
            .map(Block::index)
            .min()
            .unwrap_or_default();

        let mut by_index: BTreeMap<u64, Block> = local_blocks
            .iter()
            .filter(|b| b.index() < lowest)
            .map(|b| (b.index(), b.clone()))
            .collect();
        let received_count = received.len();
        for block in received {
            if by_index.insert(block.index(), block).is_some() {
                return Err(ChainError::InvalidBlock(
                    "duplicate index in blocks payload".to_string(),
                ));
            }
        }

        let blocks: Vec<Block> = by_index.into_values().collect();
        Self::check_links(&blocks)?;

        let replacement = ChainReplacement {
            blocks,
            received: received_count,
        };
        if let Some(latest) = local_tip {
            replacement.require_tip_beyond(latest)?;
        }

        debug!(
            received = received_count,
            kept = replacement.blocks.len() - received_count,
            "replacement chain validated"
        );
        Ok(replacement)
    }

    /// Rejects a replacement whose tip does not pass `latest`.
    pub fn require_tip_beyond(&self, latest: u64) -> Result<(), ChainError> {
        let index = self.tip().index();
        if index <= latest {
            return Err(ChainError::StaleBlock { index, latest });
        }
        Ok(())
    }

    fn check_links(blocks: &[Block]) -> Result<(), ChainError> {
        let origin = blocks
            .first()
            .ok_or_else(|| ChainError::InvalidBlock("no blocks".to_string()))?;
        if !origin.is_origin_block() {
            return Err(ChainError::InvalidBlock(format!(
                "chain starts at index {} instead of the origin block",
                origin.index()
            )));
        }

        for (expected, pair) in (1u64..).zip(blocks.windows(2)) {
            let (prev, block) = (&pair[0], &pair[1]);
            if block.index() != expected {
                return Err(ChainError::BlockGap {
                    index: block.index(),
                    expected,
                });
            }
            if block.previous_hash() != prev.id() {
                return Err(ChainError::BlockLinkage {
                    expected: prev.id().to_string(),
                    found: block.previous_hash().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of blocks that came from the response.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn tip(&self) -> &Block {
        // prepare guarantees at least the origin block
        &self.blocks[self.blocks.len() - 1]
    }

    /// Summary record describing the replacement chain.
    pub fn blockchain(&self) -> Blockchain {
        let tip = self.tip();
        Blockchain::from_scratch(self.blocks.len() as u64, tip.id(), tip.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(len: u64) -> Vec<Block> {
        let mut blocks = vec![Block::origin()];
        for index in 1..len {
            let prev = blocks[blocks.len() - 1].id().to_string();
            blocks.push(Block::from_scratch(index, prev, &[]).unwrap());
        }
        blocks
    }

    fn payload(blocks: &[Block]) -> String {
        let serialized: Vec<String> = blocks.iter().map(|b| b.serialize().unwrap()).collect();
        serde_json::to_string(&serialized).unwrap()
    }

    #[test]
    fn test_full_chain_replaces() {
        let remote = chain_of(4);
        let replacement = ChainReplacement::prepare(&payload(&remote), &remote[..1]).unwrap();
        assert_eq!(replacement.blocks().len(), 4);
        assert_eq!(replacement.received(), 4);

        let summary = replacement.blockchain();
        assert_eq!(summary.length(), 4);
        assert_eq!(summary.latest_block_index(), 3);
        assert_eq!(summary.latest_block_id(), remote[3].id());
    }

    #[test]
    fn test_suffix_merges_with_local_prefix() {
        let remote = chain_of(5);
        let replacement = ChainReplacement::prepare(&payload(&remote[3..]), &remote[..3]).unwrap();
        assert_eq!(replacement.blocks().len(), 5);
        assert_eq!(replacement.received(), 2);
        assert_eq!(replacement.tip().id(), remote[4].id());
    }

    #[test]
    fn test_unordered_payload_is_sorted() {
        let remote = chain_of(3);
        let shuffled = vec![remote[2].clone(), remote[0].clone(), remote[1].clone()];
        let replacement = ChainReplacement::prepare(&payload(&shuffled), &[]).unwrap();
        assert_eq!(replacement.tip().index(), 2);
    }

    #[test]
    fn test_tampered_block_rejected() {
        let remote = chain_of(3);
        let mut serialized: Vec<String> = remote.iter().map(|b| b.serialize().unwrap()).collect();
        serialized[2] = serialized[2].replace("\"timestamp\":", "\"timestamp\":1");
        let err = ChainReplacement::prepare(&serde_json::to_string(&serialized).unwrap(), &[]).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock(_)));
    }

    #[test]
    fn test_gap_rejected() {
        let remote = chain_of(4);
        let holes = vec![remote[0].clone(), remote[1].clone(), remote[3].clone()];
        let err = ChainReplacement::prepare(&payload(&holes), &[]).unwrap_err();
        assert!(matches!(err, ChainError::BlockGap { index: 3, expected: 2 }));
    }

    #[test]
    fn test_foreign_fork_rejected() {
        let local = chain_of(3);
        let foreign = Block::from_scratch(3, "not-our-tip", &[]).unwrap();
        let err = ChainReplacement::prepare(&payload(&[foreign]), &local).unwrap_err();
        assert!(matches!(err, ChainError::BlockLinkage { .. }));
    }

    #[test]
    fn test_shorter_chain_rejected() {
        let local = chain_of(4);
        let err = ChainReplacement::prepare(&payload(&local[..2]), &local).unwrap_err();
        assert!(matches!(err, ChainError::StaleBlock { index: 1, latest: 3 }));

        let err = ChainReplacement::prepare(&payload(&local), &local).unwrap_err();
        assert!(matches!(err, ChainError::StaleBlock { index: 3, latest: 3 }));
    }

    #[test]
    fn test_tip_must_reach_requested_index() {
        let remote = chain_of(4);
        let replacement = ChainReplacement::prepare(&payload(&remote), &remote[..1]).unwrap();
        assert!(replacement.require_tip_beyond(2).is_ok());
        assert!(replacement.require_tip_beyond(3).is_err());
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert!(ChainReplacement::prepare("not json", &[]).is_err());
        assert!(ChainReplacement::prepare("[]", &[]).is_err());
    }
}
