use crate::config::Config;
use crate::error::ChainError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where the peer is in its mine / resync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Running,
    Mining,
    AwaitingBlockchain,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Running => "running",
            PeerState::Mining => "mining",
            PeerState::AwaitingBlockchain => "awaitingblockchain",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerState {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(PeerState::Running),
            "mining" => Ok(PeerState::Mining),
            "awaitingblockchain" => Ok(PeerState::AwaitingBlockchain),
            other => Err(ChainError::InvalidState(format!(
                "unknown peer state '{}'",
                other
            ))),
        }
    }
}

/// What handling one inbound message amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed,
    /// Dropped without effect (e.g. anything but `blocks` while resyncing).
    Ignored,
    /// An `addblock` revealed a gap; the peer asked for the chain.
    ResyncRequested,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Bytes of pending transactions above which mining is considered.
    pub pool_threshold: usize,
    pub countdown_minimum: Duration,
    pub countdown_range: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PeerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_threshold: config.mining.pool_threshold,
            countdown_minimum: config.mining.countdown_minimum(),
            countdown_range: config.mining.countdown_range(),
        }
    }
}

/// Liveness summary returned by `ping` and `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub status: String,
    pub uptime_millis: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        for state in [PeerState::Running, PeerState::Mining, PeerState::AwaitingBlockchain] {
            assert_eq!(state.to_string().parse::<PeerState>().unwrap(), state);
        }
        assert!(matches!(
            "syncing".parse::<PeerState>(),
            Err(ChainError::InvalidState(_))
        ));
    }

    #[test]
    fn test_status_wire_names() {
        let status = PeerStatus {
            status: "OK".to_string(),
            uptime_millis: 12,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["uptimeMillis"], 12);
        assert_eq!(json["status"], "OK");
    }
}
