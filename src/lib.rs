//! ConsignChain - a peer-to-peer ledger tracking the lifecycle of consignments
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Blockchain
//! - [`blockchain`] - Blocks, the chain summary, consignment index and chain audit
//! - [`transaction`] - Signed consignment events
//!
//! ## Peer Engine
//! - [`peer`] - State machine, message handling, pool accounting and mining
//! - [`miner`] - Cancellable mining countdown
//! - [`sync`] - Validated chain replacement
//! - [`message`] - Inter-peer message envelope and wire codec
//!
//! ## Cryptography
//! - [`crypto`] - Hashing and signatures (secp256k1)
//!
//! ## State Management
//! - [`persistence`] - Repository trait with SQLite and in-memory backends
//!
//! ## Networking & Integration
//! - [`network`] - TCP transport between peers
//! - [`discovery`] - Discovery server and client
//! - [`api`] - REST front door
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Blockchain
// ============================================================================
pub mod blockchain;
pub mod transaction;

// ============================================================================
// Peer Engine
// ============================================================================
pub mod message;
pub mod miner;
pub mod peer;
pub mod sync;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod discovery;
pub mod network;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{ChainError, Result};
