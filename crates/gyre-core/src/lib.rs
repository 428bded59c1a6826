//! Gyre Core
//!
//! Shared domain types, key derivation and protocol primitives for the
//! Gyre CoinJoin coordinator.
//!
//! # Key tree
//!
//! From a single BIP-39 seed, the account at `m/69'/coin'/0'` yields the
//! per-round signing keys, the signing-nonce sequence (`account/0/index`)
//! and the coordinator fee address (`account/1/0`).

pub mod blind;
pub mod keys;
pub mod memory;
pub mod proof;
pub mod seed;
pub mod types;
pub mod wire;

pub use keys::*;
pub use seed::*;
pub use types::*;
