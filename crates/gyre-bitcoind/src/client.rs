//! Thin async JSON-RPC client for Bitcoin Core.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use bitcoin::consensus;
use bitcoin::{Transaction, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{ChainSource, ClientError};

/// Core's "no such mempool or blockchain transaction" error.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorPayload>,
}

#[derive(Deserialize)]
struct RpcErrorPayload {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct EstimateSmartFee {
    /// BTC per kvB; absent when the node has no estimate yet.
    feerate: Option<f64>,
}

/// JSON-RPC client against a single bitcoind.
pub struct BitcoindClient {
    url: String,
    auth_header: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl BitcoindClient {
    pub fn new(url: &str, rpc_user: &str, rpc_password: &str) -> Self {
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", rpc_user, rpc_password));
        BitcoindClient {
            url: url.to_string(),
            auth_header: format!("Basic {}", token),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(0),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response: RpcResponse<T> = self
            .http
            .post(&self.url)
            .header("Authorization", &self.auth_header)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| ClientError::Malformed(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl ChainSource for BitcoindClient {
    async fn get_raw_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, ClientError> {
        let hex: String = match self
            .call("getrawtransaction", json!([txid.to_string(), false]))
            .await
        {
            Ok(hex) => hex,
            Err(ClientError::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let bytes = hex::decode(&hex)
            .map_err(|e| ClientError::Malformed(format!("transaction hex: {}", e)))?;
        let tx = consensus::deserialize(&bytes)
            .map_err(|e| ClientError::Malformed(format!("transaction: {}", e)))?;
        Ok(Some(tx))
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid, ClientError> {
        let hex = hex::encode(consensus::serialize(tx));
        let txid: String = self.call("sendrawtransaction", json!([hex])).await?;
        txid.parse()
            .map_err(|e| ClientError::Malformed(format!("txid: {}", e)))
    }

    async fn estimate_smart_fee(&self, conf_target: u16) -> Result<Option<u64>, ClientError> {
        let estimate: EstimateSmartFee =
            self.call("estimatesmartfee", json!([conf_target])).await?;
        Ok(estimate.feerate.map(btc_per_kvb_to_sat_per_vb))
    }
}

/// `estimatesmartfee` reports BTC/kvB; rounds are priced in sat/vB.
pub(crate) fn btc_per_kvb_to_sat_per_vb(btc_per_kvb: f64) -> u64 {
    (btc_per_kvb * 100_000.0).ceil() as u64
}
