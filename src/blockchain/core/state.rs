use serde::{Deserialize, Serialize};

/// Secondary index from a consignment id to the blocks holding its transactions.
///
/// `blockids` behaves as an insertion-ordered set: a block id is recorded at
/// most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsignmentIndex {
    pub id: String,
    pub blockids: Vec<String>,
}

impl ConsignmentIndex {
    pub fn new(consignmentid: impl Into<String>, blockid: impl Into<String>) -> Self {
        Self {
            id: consignmentid.into(),
            blockids: vec![blockid.into()],
        }
    }

    pub fn contains(&self, blockid: &str) -> bool {
        self.blockids.iter().any(|b| b == blockid)
    }

    /// Appends `blockid` unless already present. Returns whether it was added.
    pub fn insert(&mut self, blockid: &str) -> bool {
        if self.contains(blockid) {
            return false;
        }
        self.blockids.push(blockid.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut index = ConsignmentIndex::new("c1", "b1");
        assert!(index.insert("b2"));
        assert!(!index.insert("b1"));
        assert!(!index.insert("b2"));
        assert_eq!(index.blockids, vec!["b1".to_string(), "b2".to_string()]);
    }
}
