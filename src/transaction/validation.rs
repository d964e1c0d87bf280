/// Validation logic for transactions separated from type definitions
use crate::crypto::verify_signature_hex;
use crate::error::ChainError;
use crate::transaction::types::Transaction;

impl Transaction {
    /// Hash check: does `id` match the recomputed hash of the other fields?
    pub fn validate(tx: &Transaction) -> bool {
        tx.compute_hash() == tx.id
    }

    /// Signature check against the embedded public key. Independent of
    /// [`Transaction::validate`]: a forger can recompute a consistent hash,
    /// but not a valid signature.
    pub fn verify(tx: &Transaction) -> bool {
        verify_signature_hex(&tx.publickey, tx.signable_message().as_bytes(), &tx.signature)
            .is_ok()
    }

    /// Admission check used by the pool: hash and signature must both hold.
    pub fn check(&self) -> Result<(), ChainError> {
        if !Transaction::validate(self) {
            return Err(ChainError::InvalidTransaction(format!(
                "hash mismatch for transaction {}",
                self.id
            )));
        }
        verify_signature_hex(&self.publickey, self.signable_message().as_bytes(), &self.signature)
            .map_err(|e| {
                ChainError::InvalidTransaction(format!(
                    "signature check failed for transaction {}: {}",
                    self.id, e
                ))
            })
    }
}
