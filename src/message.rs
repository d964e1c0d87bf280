//! Peer-to-peer message envelope and its line-oriented JSON codec

use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Ping,
    SendBlockchainLength,
    BlockchainLength,
    SendBlocks,
    Blocks,
    AddBlock,
    AddTransaction,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Ping,
        Action::SendBlockchainLength,
        Action::BlockchainLength,
        Action::SendBlocks,
        Action::Blocks,
        Action::AddBlock,
        Action::AddTransaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::SendBlockchainLength => "sendblockchainlength",
            Action::BlockchainLength => "blockchainlength",
            Action::SendBlocks => "sendblocks",
            Action::Blocks => "blocks",
            Action::AddBlock => "addblock",
            Action::AddTransaction => "addtransaction",
        }
    }

    /// Actions whose message is meaningless without a payload.
    pub fn requires_data(&self) -> bool {
        matches!(
            self,
            Action::AddBlock | Action::AddTransaction | Action::Blocks | Action::BlockchainLength
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ChainError::InvalidMessage(format!("a valid action must be provided: '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Private,
    #[default]
    Broadcast,
}

/// One inter-peer message.
///
/// `peer` identifies the remote end: the sender on inbound messages, the
/// recipient of a private reply. It never travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip)]
    pub peer: Option<String>,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
}

impl Message {
    pub fn new(action: Action, data: Option<String>, kind: MessageType) -> Result<Self, ChainError> {
        let message = Message {
            peer: None,
            action,
            data,
            kind,
        };
        message.check()?;
        Ok(message)
    }

    pub fn broadcast(action: Action, data: Option<String>) -> Result<Self, ChainError> {
        Self::new(action, data, MessageType::Broadcast)
    }

    /// A private reply addressed to `peer`.
    pub fn reply(peer: impl Into<String>, action: Action, data: Option<String>) -> Result<Self, ChainError> {
        let mut message = Self::new(action, data, MessageType::Private)?;
        message.peer = Some(peer.into());
        Ok(message)
    }

    pub fn check(&self) -> Result<(), ChainError> {
        if self.action.requires_data() && self.data.is_none() {
            return Err(ChainError::InvalidMessage(format!(
                "'{}' requires data",
                self.action
            )));
        }
        Ok(())
    }

    /// Decodes one wire line and tags it with the connection it arrived on.
    pub fn from_wire(line: &str, peer: &str) -> Result<Self, ChainError> {
        let mut message: Message = serde_json::from_str(line.trim())
            .map_err(|e| ChainError::InvalidMessage(e.to_string()))?;
        message.check()?;
        message.peer = Some(peer.to_string());
        Ok(message)
    }

    /// Encodes the message as a single newline-terminated JSON line.
    pub fn to_wire(&self) -> Result<String, ChainError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
