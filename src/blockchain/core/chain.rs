use crate::crypto::sha256_hex;
use crate::error::ChainError;
use crate::persistence::Validatable;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// `previousHash` of the origin block.
pub const ORIGIN_PREVIOUS_HASH: &str = "-1";

/// Id of the singleton blockchain summary record.
pub const BLOCKCHAIN_ID: &str = "blockchain";

const EMPTY_TRANSACTIONS: &str = "[]";

/// An immutable, hash-linked batch of serialized transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredBlock")]
pub struct Block {
    pub(crate) id: String,
    pub(crate) index: u64,
    #[serde(rename = "previousHash")]
    pub(crate) previous_hash: String,
    pub(crate) timestamp: i64,
    pub(crate) transactions: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredBlock {
    pub id: String,
    pub index: u64,
    #[serde(rename = "previousHash")]
    pub previous_hash: String,
    pub timestamp: i64,
    pub transactions: String,
}

impl TryFrom<StoredBlock> for Block {
    type Error = ChainError;

    fn try_from(stored: StoredBlock) -> Result<Self, Self::Error> {
        Block::from_stored(stored)
    }
}

impl Block {
    /// Builds a new block from in-memory transactions. Every transaction must
    /// pass its hash check; the list is serialized before the block is hashed.
    pub fn from_scratch(
        index: u64,
        previous_hash: impl Into<String>,
        transactions: &[Transaction],
    ) -> Result<Self, ChainError> {
        let mut serialized = Vec::with_capacity(transactions.len());
        for (i, tx) in transactions.iter().enumerate() {
            if !Transaction::validate(tx) {
                return Err(ChainError::InvalidInput(format!(
                    "transaction {} ({}) is not valid",
                    i,
                    tx.id()
                )));
            }
            serialized.push(tx.serialize()?);
        }

        let mut block = Block {
            id: String::new(),
            index,
            previous_hash: previous_hash.into(),
            timestamp: chrono::Utc::now().timestamp(),
            transactions: serde_json::to_string(&serialized)?,
        };
        block.id = block.compute_hash();
        Ok(block)
    }

    /// The fixed root every chain starts from.
    pub fn origin() -> Self {
        let mut block = Block {
            id: String::new(),
            index: 0,
            previous_hash: ORIGIN_PREVIOUS_HASH.to_string(),
            timestamp: 0,
            transactions: EMPTY_TRANSACTIONS.to_string(),
        };
        block.id = block.compute_hash();
        block
    }

    /// Rebuilds a block from its stored or wire form, rejecting it when the
    /// stored id does not match the recomputed hash.
    pub fn from_stored(stored: StoredBlock) -> Result<Self, ChainError> {
        let block = Block {
            id: stored.id,
            index: stored.index,
            previous_hash: stored.previous_hash,
            timestamp: stored.timestamp,
            transactions: stored.transactions,
        };
        if !Block::validate(&block) {
            return Err(ChainError::InvalidBlock(format!(
                "hash mismatch for block {} at index {}",
                block.id, block.index
            )));
        }
        Ok(block)
    }

    pub fn serialize(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(s: &str) -> Result<Self, ChainError> {
        serde_json::from_str(s).map_err(|e| ChainError::InvalidBlock(e.to_string()))
    }

    pub fn compute_hash(&self) -> String {
        sha256_hex(&format!(
            "{}{}{}{}",
            self.index, self.previous_hash, self.timestamp, self.transactions
        ))
    }

    /// Pure hash check, usable without trusting the instance.
    pub fn validate(block: &Block) -> bool {
        block.compute_hash() == block.id
    }

    pub fn is_origin_block(&self) -> bool {
        self.index == 0
            && self.previous_hash == ORIGIN_PREVIOUS_HASH
            && self.transactions == EMPTY_TRANSACTIONS
    }

    /// Decodes the embedded transaction list.
    pub fn transactions(&self) -> Result<Vec<Transaction>, ChainError> {
        let serialized: Vec<String> = serde_json::from_str(&self.transactions)
            .map_err(|e| ChainError::InvalidBlock(format!("malformed transaction list: {}", e)))?;
        serialized
            .iter()
            .map(|s| Transaction::deserialize(s))
            .collect()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Validatable for Block {
    fn is_valid(&self) -> bool {
        Block::validate(self)
    }
}

/// Summary of the local chain tip. The blocks themselves live in block storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredBlockchain")]
pub struct Blockchain {
    id: String,
    length: u64,
    latestblockid: String,
    latestblockindex: u64,
    hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredBlockchain {
    #[serde(default = "default_blockchain_id")]
    pub id: String,
    pub length: u64,
    pub latestblockid: String,
    pub latestblockindex: u64,
    pub hash: String,
}

fn default_blockchain_id() -> String {
    BLOCKCHAIN_ID.to_string()
}

impl TryFrom<StoredBlockchain> for Blockchain {
    type Error = ChainError;

    fn try_from(stored: StoredBlockchain) -> Result<Self, Self::Error> {
        Blockchain::from_stored(
            stored.length,
            stored.latestblockid,
            stored.latestblockindex,
            stored.hash,
        )
    }
}

impl Blockchain {
    pub fn from_scratch(length: u64, latestblockid: impl Into<String>, latestblockindex: u64) -> Self {
        let mut blockchain = Blockchain {
            id: BLOCKCHAIN_ID.to_string(),
            length,
            latestblockid: latestblockid.into(),
            latestblockindex,
            hash: String::new(),
        };
        blockchain.rehash();
        blockchain
    }

    /// A one-block chain rooted at [`Block::origin`].
    pub fn from_origin(origin: &Block) -> Self {
        Self::from_scratch(1, origin.id(), origin.index())
    }

    pub fn from_stored(
        length: u64,
        latestblockid: impl Into<String>,
        latestblockindex: u64,
        hash: impl Into<String>,
    ) -> Result<Self, ChainError> {
        let blockchain = Blockchain {
            id: BLOCKCHAIN_ID.to_string(),
            length,
            latestblockid: latestblockid.into(),
            latestblockindex,
            hash: hash.into(),
        };
        if blockchain.compute_hash() != blockchain.hash {
            return Err(ChainError::InvalidBlockchain(format!(
                "hash mismatch (length {}, latest block {})",
                blockchain.length, blockchain.latestblockid
            )));
        }
        Ok(blockchain)
    }

    pub fn serialize(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(s: &str) -> Result<Self, ChainError> {
        serde_json::from_str(s).map_err(|e| ChainError::InvalidBlockchain(e.to_string()))
    }

    pub fn compute_hash(&self) -> String {
        sha256_hex(&format!(
            "{}{}{}{}",
            self.id, self.length, self.latestblockindex, self.latestblockid
        ))
    }

    /// Recomputes `hash` after a batch of mutations.
    pub fn rehash(&mut self) -> &str {
        self.hash = self.compute_hash();
        &self.hash
    }

    pub fn is_consistent(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn increment_length(&mut self) -> u64 {
        self.length += 1;
        self.length
    }

    pub fn set_latest_block_id(&mut self, id: impl Into<String>) {
        self.latestblockid = id.into();
    }

    pub fn set_latest_block_index(&mut self, index: u64) {
        self.latestblockindex = index;
    }

    pub fn set_length(&mut self, length: u64) {
        self.length = length;
    }

    pub fn set_hash(&mut self, hash: impl Into<String>) {
        self.hash = hash.into();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn latest_block_id(&self) -> &str {
        &self.latestblockid
    }

    pub fn latest_block_index(&self) -> u64 {
        self.latestblockindex
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Validatable for Blockchain {
    fn is_valid(&self) -> bool {
        self.is_consistent()
    }
}
