//! Repository layer for ConsignChain
//!
//! The peer sees storage as a set of named collections of JSON records keyed by
//! id. Backends implement a handful of raw record operations; the typed
//! operations (`add_block`, `get_transaction`, ...) are provided on top and
//! refuse records that fail their [`Validatable`] check.

use crate::blockchain::{Block, Blockchain, ConsignmentIndex, BLOCKCHAIN_ID};
use crate::error::ChainError;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

/// Anything the repository can check before storing it.
pub trait Validatable {
    fn is_valid(&self) -> bool;
}

impl Validatable for Transaction {
    // Pool admission needs the signature check, not just the hash check.
    fn is_valid(&self) -> bool {
        Transaction::validate(self) && Transaction::verify(self)
    }
}

impl Validatable for ConsignmentIndex {
    fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.blockids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    TransactionPool,
    Blocks,
    Blockchain,
    ConsignmentIndex,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::TransactionPool,
        Collection::Blocks,
        Collection::Blockchain,
        Collection::ConsignmentIndex,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::TransactionPool => "transactionpool",
            Collection::Blocks => "blocks",
            Collection::Blockchain => "blockchain",
            Collection::ConsignmentIndex => "consignmentindex",
        }
    }
}

/// Abstraction for persistence backends.
///
/// `list_records` returns bodies ordered by ascending `ordinal`, ties broken by
/// insertion order. Re-putting an existing id replaces the body in place.
pub trait Repository: Send + Sync {
    fn create_collection(&self, collection: Collection) -> Result<(), ChainError>;
    fn delete_collection(&self, collection: Collection) -> Result<(), ChainError>;
    fn put_record(
        &self,
        collection: Collection,
        id: &str,
        ordinal: i64,
        body: &str,
    ) -> Result<(), ChainError>;
    fn get_record(&self, collection: Collection, id: &str) -> Result<Option<String>, ChainError>;
    fn delete_record(&self, collection: Collection, id: &str) -> Result<bool, ChainError>;
    fn list_records(&self, collection: Collection) -> Result<Vec<String>, ChainError>;

    // ------------------------------------------------------------------
    // Transactions (pool)
    // ------------------------------------------------------------------

    fn add_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        if !tx.is_valid() {
            return Err(ChainError::InvalidTransaction(format!(
                "transaction {} failed hash or signature check",
                tx.id()
            )));
        }
        put_json(self, Collection::TransactionPool, tx.id(), tx.timestamp(), tx)
    }

    fn get_transaction(&self, id: &str) -> Result<Transaction, ChainError> {
        get_json(self, Collection::TransactionPool, id)
    }

    fn contains_transaction(&self, id: &str) -> Result<bool, ChainError> {
        Ok(self.get_record(Collection::TransactionPool, id)?.is_some())
    }

    /// Removes a pooled transaction; `Ok(false)` when it was not pooled.
    fn delete_transaction(&self, id: &str) -> Result<bool, ChainError> {
        self.delete_record(Collection::TransactionPool, id)
    }

    /// Pooled transactions in ascending timestamp order.
    fn get_all_transactions(&self) -> Result<Vec<Transaction>, ChainError> {
        list_json(self, Collection::TransactionPool)
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        if !block.is_valid() {
            return Err(ChainError::InvalidBlock(format!(
                "block {} failed hash check",
                block.id()
            )));
        }
        put_json(self, Collection::Blocks, block.id(), block.index() as i64, block)
    }

    fn get_block(&self, id: &str) -> Result<Block, ChainError> {
        get_json(self, Collection::Blocks, id)
    }

    fn delete_block(&self, id: &str) -> Result<bool, ChainError> {
        self.delete_record(Collection::Blocks, id)
    }

    /// Stored blocks in ascending index order.
    fn get_all_blocks(&self) -> Result<Vec<Block>, ChainError> {
        list_json(self, Collection::Blocks)
    }

    // ------------------------------------------------------------------
    // Blockchain summary
    // ------------------------------------------------------------------

    fn add_blockchain(&self, blockchain: &Blockchain) -> Result<(), ChainError> {
        if !blockchain.is_valid() {
            return Err(ChainError::InvalidBlockchain(
                "summary hash does not match its fields".to_string(),
            ));
        }
        put_json(self, Collection::Blockchain, BLOCKCHAIN_ID, 0, blockchain)
    }

    fn get_blockchain(&self) -> Result<Blockchain, ChainError> {
        get_json(self, Collection::Blockchain, BLOCKCHAIN_ID)
    }

    fn delete_blockchain(&self) -> Result<bool, ChainError> {
        self.delete_record(Collection::Blockchain, BLOCKCHAIN_ID)
    }

    // ------------------------------------------------------------------
    // Consignment index
    // ------------------------------------------------------------------

    fn add_consignment_index(&self, index: &ConsignmentIndex) -> Result<(), ChainError> {
        if !index.is_valid() {
            return Err(ChainError::InvalidInput(format!(
                "consignment index '{}' is empty",
                index.id
            )));
        }
        put_json(self, Collection::ConsignmentIndex, &index.id, 0, index)
    }

    fn get_consignment_index(&self, consignmentid: &str) -> Result<ConsignmentIndex, ChainError> {
        get_json(self, Collection::ConsignmentIndex, consignmentid)
    }

    fn get_all_consignment_indexes(&self) -> Result<Vec<ConsignmentIndex>, ChainError> {
        list_json(self, Collection::ConsignmentIndex)
    }
}

fn put_json<R, T>(
    repo: &R,
    collection: Collection,
    id: &str,
    ordinal: i64,
    record: &T,
) -> Result<(), ChainError>
where
    R: Repository + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_string(record)?;
    repo.put_record(collection, id, ordinal, &body)
}

fn get_json<R, T>(repo: &R, collection: Collection, id: &str) -> Result<T, ChainError>
where
    R: Repository + ?Sized,
    T: DeserializeOwned,
{
    let body = repo.get_record(collection, id)?.ok_or_else(|| {
        ChainError::NotFound(format!("{} record '{}'", collection.name(), id))
    })?;
    decode(collection, &body)
}

fn list_json<R, T>(repo: &R, collection: Collection) -> Result<Vec<T>, ChainError>
where
    R: Repository + ?Sized,
    T: DeserializeOwned,
{
    repo.list_records(collection)?
        .iter()
        .map(|body| decode(collection, body))
        .collect()
}

// Stored records go back through the validating deserializers, so a corrupted
// row surfaces as a database error rather than as a silently accepted record.
fn decode<T: DeserializeOwned>(collection: Collection, body: &str) -> Result<T, ChainError> {
    serde_json::from_str(body).map_err(|e| {
        ChainError::DatabaseError(format!(
            "Failed to decode {} record: {}",
            collection.name(),
            e
        ))
    })
}

/// rusqlite-backed repository: one table per collection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ChainError> {
        Self::open(":memory:")
    }
}

impl Repository for Database {
    fn create_collection(&self, collection: Collection) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    ordinal INTEGER NOT NULL,
                    body TEXT NOT NULL
                )",
                collection.name()
            ),
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!(
                "Failed to create {} table: {}",
                collection.name(),
                e
            ))
        })?;
        Ok(())
    }

    fn delete_collection(&self, collection: Collection) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        conn.execute(&format!("DROP TABLE IF EXISTS {}", collection.name()), [])
            .map_err(|e| {
                ChainError::DatabaseError(format!(
                    "Failed to drop {} table: {}",
                    collection.name(),
                    e
                ))
            })?;
        Ok(())
    }

    fn put_record(
        &self,
        collection: Collection,
        id: &str,
        ordinal: i64,
        body: &str,
    ) -> Result<(), ChainError> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (id, ordinal, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET ordinal = excluded.ordinal, body = excluded.body",
                collection.name()
            ),
            params![id, ordinal, body],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!(
                "Failed to save {} record: {}",
                collection.name(),
                e
            ))
        })?;
        Ok(())
    }

    fn get_record(&self, collection: Collection, id: &str) -> Result<Option<String>, ChainError> {
        let conn = self.conn.lock();
        let body = conn
            .query_row(
                &format!("SELECT body FROM {} WHERE id = ?1", collection.name()),
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| {
                ChainError::DatabaseError(format!(
                    "Failed to read {} record: {}",
                    collection.name(),
                    e
                ))
            })?;
        Ok(body)
    }

    fn delete_record(&self, collection: Collection, id: &str) -> Result<bool, ChainError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", collection.name()),
                params![id],
            )
            .map_err(|e| {
                ChainError::DatabaseError(format!(
                    "Failed to delete {} record: {}",
                    collection.name(),
                    e
                ))
            })?;
        Ok(removed > 0)
    }

    fn list_records(&self, collection: Collection) -> Result<Vec<String>, ChainError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT body FROM {} ORDER BY ordinal ASC, rowid ASC",
                collection.name()
            ))
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| {
                ChainError::DatabaseError(format!(
                    "Failed to query {}: {}",
                    collection.name(),
                    e
                ))
            })?;

        let mut bodies = Vec::new();
        for row in rows {
            bodies.push(
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?,
            );
        }
        Ok(bodies)
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    id: String,
    ordinal: i64,
    body: String,
}

/// Simple in-memory repository useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryRepository {
    collections: Mutex<HashMap<Collection, Vec<StoredRecord>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(collection: Collection) -> ChainError {
        ChainError::DatabaseError(format!(
            "collection '{}' does not exist",
            collection.name()
        ))
    }
}

impl Repository for InMemoryRepository {
    fn create_collection(&self, collection: Collection) -> Result<(), ChainError> {
        self.collections.lock().entry(collection).or_default();
        Ok(())
    }

    fn delete_collection(&self, collection: Collection) -> Result<(), ChainError> {
        self.collections.lock().remove(&collection);
        Ok(())
    }

    fn put_record(
        &self,
        collection: Collection,
        id: &str,
        ordinal: i64,
        body: &str,
    ) -> Result<(), ChainError> {
        let mut collections = self.collections.lock();
        let records = collections
            .get_mut(&collection)
            .ok_or_else(|| Self::missing(collection))?;

        match records.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                existing.ordinal = ordinal;
                existing.body = body.to_string();
            }
            None => records.push(StoredRecord {
                id: id.to_string(),
                ordinal,
                body: body.to_string(),
            }),
        }
        Ok(())
    }

    fn get_record(&self, collection: Collection, id: &str) -> Result<Option<String>, ChainError> {
        let collections = self.collections.lock();
        let records = collections
            .get(&collection)
            .ok_or_else(|| Self::missing(collection))?;
        Ok(records.iter().find(|r| r.id == id).map(|r| r.body.clone()))
    }

    fn delete_record(&self, collection: Collection, id: &str) -> Result<bool, ChainError> {
        let mut collections = self.collections.lock();
        let records = collections
            .get_mut(&collection)
            .ok_or_else(|| Self::missing(collection))?;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn list_records(&self, collection: Collection) -> Result<Vec<String>, ChainError> {
        let collections = self.collections.lock();
        let records = collections
            .get(&collection)
            .ok_or_else(|| Self::missing(collection))?;
        let mut sorted = records.clone();
        // stable: equal ordinals keep insertion order
        sorted.sort_by_key(|r| r.ordinal);
        Ok(sorted.into_iter().map(|r| r.body).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::transaction::TransactionType;

    fn backends() -> Vec<Box<dyn Repository>> {
        let backends: Vec<Box<dyn Repository>> = vec![
            Box::new(Database::open_in_memory().unwrap()),
            Box::new(InMemoryRepository::new()),
        ];
        for repo in &backends {
            for collection in Collection::ALL {
                repo.create_collection(collection).unwrap();
            }
        }
        backends
    }

    #[test]
    fn test_database_open() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.conn.lock().is_autocommit());
    }

    #[test]
    fn test_transactions_listed_by_timestamp() {
        let keypair = KeyPair::generate().unwrap();
        let late = Transaction::from_scratch_at("c1", TransactionType::Received, "text/plain", "late", 200, &keypair).unwrap();
        let early = Transaction::from_scratch_at("c1", TransactionType::Despatched, "text/plain", "early", 100, &keypair).unwrap();

        for repo in backends() {
            repo.add_transaction(&late).unwrap();
            repo.add_transaction(&early).unwrap();

            let all = repo.get_all_transactions().unwrap();
            assert_eq!(all, vec![early.clone(), late.clone()]);
            assert_eq!(repo.get_transaction(late.id()).unwrap(), late);

            assert!(repo.delete_transaction(late.id()).unwrap());
            assert!(!repo.delete_transaction(late.id()).unwrap());
            assert!(matches!(
                repo.get_transaction(late.id()),
                Err(ChainError::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_forged_transaction_refused() {
        let owner = KeyPair::generate().unwrap();
        let forger = KeyPair::generate().unwrap();
        let mut tx = Transaction::from_scratch("c1", TransactionType::Waybill, "text/plain", "x", &owner).unwrap();
        tx.publickey = forger.public_key_hex();
        tx.id = tx.compute_hash();

        for repo in backends() {
            assert!(matches!(
                repo.add_transaction(&tx),
                Err(ChainError::InvalidTransaction(_))
            ));
            assert!(repo.get_all_transactions().unwrap().is_empty());
        }
    }

    #[test]
    fn test_blocks_and_summary() {
        let origin = Block::origin();
        let b1 = Block::from_scratch(1, origin.id(), &[]).unwrap();
        let chain = Blockchain::from_scratch(2, b1.id(), 1);

        for repo in backends() {
            repo.add_block(&b1).unwrap();
            repo.add_block(&origin).unwrap();
            let ids: Vec<_> = repo
                .get_all_blocks()
                .unwrap()
                .iter()
                .map(|b| b.id().to_string())
                .collect();
            assert_eq!(ids, vec![origin.id().to_string(), b1.id().to_string()]);

            assert!(matches!(repo.get_blockchain(), Err(ChainError::NotFound(_))));
            repo.add_blockchain(&chain).unwrap();
            assert_eq!(repo.get_blockchain().unwrap(), chain);

            let mut stale = chain.clone();
            stale.increment_length();
            assert!(matches!(
                repo.add_blockchain(&stale),
                Err(ChainError::InvalidBlockchain(_))
            ));
        }
    }

    #[test]
    fn test_consignment_index_upsert() {
        for repo in backends() {
            let mut index = ConsignmentIndex::new("c1", "b1");
            repo.add_consignment_index(&index).unwrap();
            index.insert("b2");
            repo.add_consignment_index(&index).unwrap();

            assert_eq!(repo.get_consignment_index("c1").unwrap().blockids.len(), 2);
            assert_eq!(repo.get_all_consignment_indexes().unwrap().len(), 1);
            assert!(matches!(
                repo.get_consignment_index("unknown"),
                Err(ChainError::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_deleted_collection_is_unavailable() {
        for repo in backends() {
            repo.delete_collection(Collection::Blocks).unwrap();
            assert!(matches!(
                repo.get_all_blocks(),
                Err(ChainError::DatabaseError(_))
            ));
            repo.create_collection(Collection::Blocks).unwrap();
            assert!(repo.get_all_blocks().unwrap().is_empty());
        }
    }

    #[test]
    fn test_sqlite_file_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chain.db");
        let path = path.to_str().unwrap();
        {
            let db = Database::open(path).unwrap();
            db.create_collection(Collection::Blocks).unwrap();
            db.add_block(&Block::origin()).unwrap();
        }
        let db = Database::open(path).unwrap();
        assert_eq!(db.get_block(Block::origin().id()).unwrap(), Block::origin());
    }
}
