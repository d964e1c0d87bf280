/// Transaction types for ConsignChain
use crate::crypto::{sha256_hex, KeyPair};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The lifecycle event a transaction records for its consignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Despatched,
    Received,
    ImportDeclaration,
    PaymentReceived,
    CrossedBorder,
    CvedPresented,
    Waybill,
}

impl TransactionType {
    pub const ALL: [TransactionType; 7] = [
        TransactionType::Despatched,
        TransactionType::Received,
        TransactionType::ImportDeclaration,
        TransactionType::PaymentReceived,
        TransactionType::CrossedBorder,
        TransactionType::CvedPresented,
        TransactionType::Waybill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Despatched => "despatched",
            TransactionType::Received => "received",
            TransactionType::ImportDeclaration => "importdeclaration",
            TransactionType::PaymentReceived => "paymentreceived",
            TransactionType::CrossedBorder => "crossedborder",
            TransactionType::CvedPresented => "cvedpresented",
            TransactionType::Waybill => "waybill",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| ChainError::InvalidTransactionType(s.to_string()))
    }
}

/// A signed record of one consignment event.
///
/// Fields are private: a `Transaction` can only be obtained through
/// [`Transaction::from_scratch`] or [`Transaction::from_stored`], and
/// deserialization goes through the latter so a decoded value always carries a
/// matching `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredTransaction")]
pub struct Transaction {
    pub(crate) consignmentid: String,
    pub(crate) transactiontype: TransactionType,
    pub(crate) datatype: String,
    pub(crate) data: String,
    pub(crate) timestamp: i64,
    pub(crate) publickey: String,
    pub(crate) signature: String,
    pub(crate) id: String,
}

/// Field-for-field mirror of [`Transaction`] used as the deserialization target.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredTransaction {
    pub consignmentid: String,
    pub transactiontype: TransactionType,
    pub datatype: String,
    pub data: String,
    pub timestamp: i64,
    pub publickey: String,
    pub signature: String,
    pub id: String,
}

impl TryFrom<StoredTransaction> for Transaction {
    type Error = ChainError;

    fn try_from(stored: StoredTransaction) -> Result<Self, Self::Error> {
        Transaction::from_stored(stored)
    }
}

impl Transaction {
    /// Creates and signs a new transaction stamped with the current time.
    pub fn from_scratch(
        consignmentid: impl Into<String>,
        transactiontype: TransactionType,
        datatype: impl Into<String>,
        data: impl Into<String>,
        keypair: &KeyPair,
    ) -> Result<Self, ChainError> {
        let timestamp = chrono::Utc::now().timestamp();
        Self::from_scratch_at(consignmentid, transactiontype, datatype, data, timestamp, keypair)
    }

    /// Same as [`Transaction::from_scratch`] with an explicit unix-seconds timestamp.
    pub fn from_scratch_at(
        consignmentid: impl Into<String>,
        transactiontype: TransactionType,
        datatype: impl Into<String>,
        data: impl Into<String>,
        timestamp: i64,
        keypair: &KeyPair,
    ) -> Result<Self, ChainError> {
        let consignmentid = consignmentid.into();
        let datatype = datatype.into();
        if consignmentid.is_empty() {
            return Err(ChainError::MissingField("consignmentid".to_string()));
        }
        if datatype.is_empty() {
            return Err(ChainError::MissingField("datatype".to_string()));
        }

        let mut tx = Transaction {
            consignmentid,
            transactiontype,
            datatype,
            data: data.into(),
            timestamp,
            publickey: keypair.public_key_hex(),
            signature: String::new(),
            id: String::new(),
        };
        tx.signature = keypair.sign_hex(tx.signable_message().as_bytes())?;
        tx.id = tx.compute_hash();
        Ok(tx)
    }

    /// Rebuilds a transaction from its stored form, rejecting it if the stored
    /// `id` does not match the recomputed hash.
    pub fn from_stored(stored: StoredTransaction) -> Result<Self, ChainError> {
        let tx = Transaction {
            consignmentid: stored.consignmentid,
            transactiontype: stored.transactiontype,
            datatype: stored.datatype,
            data: stored.data,
            timestamp: stored.timestamp,
            publickey: stored.publickey,
            signature: stored.signature,
            id: stored.id,
        };
        if !Transaction::validate(&tx) {
            return Err(ChainError::InvalidTransaction(format!(
                "hash mismatch for transaction {}",
                tx.id
            )));
        }
        Ok(tx)
    }

    pub fn serialize(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(s: &str) -> Result<Self, ChainError> {
        serde_json::from_str(s).map_err(|e| ChainError::InvalidTransaction(e.to_string()))
    }

    /// Serialized byte length, the unit of transaction-pool accounting.
    pub fn get_size(&self) -> usize {
        self.serialize().map(|s| s.len()).unwrap_or(0)
    }

    /// The string covered by the signature.
    pub fn signable_message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.consignmentid, self.timestamp, self.transactiontype, self.datatype, self.data
        )
    }

    pub fn compute_hash(&self) -> String {
        sha256_hex(&format!(
            "{}{}{}",
            self.signable_message(),
            self.publickey,
            self.signature
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn consignmentid(&self) -> &str {
        &self.consignmentid
    }

    pub fn transactiontype(&self) -> TransactionType {
        self.transactiontype
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn publickey(&self) -> &str {
        &self.publickey
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}
