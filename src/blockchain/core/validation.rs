use crate::blockchain::core::chain::{Block, Blockchain};
use crate::persistence::Repository;
use tracing::warn;

/// Offline integrity audit: walks back from the chain tip through
/// `previousHash` links to the origin block.
///
/// Returns `false` (never an error) when a link is missing, a stored block
/// fails its hash check, indices do not step down by exactly one, or the walk
/// length disagrees with the summary's `length`.
pub fn validate_blocks(blockchain: &Blockchain, repository: &dyn Repository) -> bool {
    let mut current_id = blockchain.latest_block_id().to_string();
    let mut expected_index = blockchain.latest_block_index();
    let mut walked: u64 = 0;

    loop {
        let block = match repository.get_block(&current_id) {
            Ok(block) => block,
            Err(e) => {
                warn!(block_id = %current_id, error = %e, "chain audit: missing block");
                return false;
            }
        };
        walked += 1;

        if !Block::validate(&block) || block.index() != expected_index {
            warn!(block_id = %current_id, index = block.index(), "chain audit: invalid block");
            return false;
        }

        if block.is_origin_block() {
            return walked == blockchain.length();
        }
        if expected_index == 0 {
            // Index 0 that is not the origin block.
            return false;
        }

        current_id = block.previous_hash().to_string();
        expected_index -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Collection, InMemoryRepository};

    fn seeded_repository() -> (InMemoryRepository, Blockchain) {
        let repo = InMemoryRepository::new();
        for collection in Collection::ALL {
            repo.create_collection(collection).unwrap();
        }

        let origin = Block::origin();
        let b1 = Block::from_scratch(1, origin.id(), &[]).unwrap();
        let b2 = Block::from_scratch(2, b1.id(), &[]).unwrap();
        for block in [&origin, &b1, &b2] {
            repo.add_block(block).unwrap();
        }
        (repo, Blockchain::from_scratch(3, b2.id(), 2))
    }

    #[test]
    fn test_intact_chain_validates() {
        let (repo, chain) = seeded_repository();
        assert!(validate_blocks(&chain, &repo));
    }

    #[test]
    fn test_missing_link_fails() {
        let (repo, chain) = seeded_repository();
        let b2 = repo.get_block(chain.latest_block_id()).unwrap();
        repo.delete_block(b2.previous_hash()).unwrap();
        assert!(!validate_blocks(&chain, &repo));
    }

    #[test]
    fn test_length_mismatch_fails() {
        let (repo, chain) = seeded_repository();
        let wrong = Blockchain::from_scratch(5, chain.latest_block_id(), 2);
        assert!(!validate_blocks(&wrong, &repo));
    }
}
