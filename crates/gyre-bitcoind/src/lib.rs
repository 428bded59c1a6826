//! Bitcoin Core integration for Gyre.
//!
//! The coordinator touches the chain in exactly three places: verifying
//! registered inputs (`getrawtransaction`), broadcasting the final
//! transaction (`sendrawtransaction`) and pricing rounds
//! (`estimatesmartfee`). [`ChainSource`] captures that surface so the
//! round logic can run against a mock chain in tests.

mod client;
mod fees;

pub use client::BitcoindClient;
pub use fees::FeeOracle;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// The three node queries the coordinator consumes.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Look up a transaction by txid; `None` if the node does not know it.
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ClientError>;

    /// Broadcast a transaction, returning its txid.
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, ClientError>;

    /// Estimated fee rate in sat/vB for confirmation within `conf_target`
    /// blocks; `None` when the node has no estimate.
    async fn estimate_smart_fee(&self, conf_target: u16) -> Result<Option<u64>, ClientError>;
}
