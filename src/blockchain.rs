// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// the chain data model, the consignment index and the offline chain audit.

pub mod core;
pub use self::core::*;
