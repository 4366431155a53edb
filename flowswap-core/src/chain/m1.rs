//! M1 daemon JSON-RPC client.
//!
//! The M1 daemon speaks a bitcoind-flavoured JSON-RPC dialect; blocks are
//! returned with full transaction bodies so one call per height suffices.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{UtxoChain, UtxoTx, UtxoTxIn, UtxoTxOut};
use crate::error::ChainError;

pub struct M1Client {
    http: reqwest::Client,
    url: String,
}

impl M1Client {
    pub fn new(url: &str, rpc_timeout_secs: u64) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(rpc_timeout_secs))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(M1Client {
            http,
            url: url.to_string(),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "flowswap",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout(0)
                } else {
                    ChainError::Transport(e.to_string())
                }
            })?;
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ChainError::BadResponse(e.to_string()))?;
        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let text = error.to_string();
            return Err(if text.contains("fee") || text.contains("mempool") {
                ChainError::MempoolRejected(text)
            } else {
                ChainError::BadResponse(text)
            });
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::BadResponse("missing result".into()))
    }

    fn parse_tx(tx: &Value) -> Result<UtxoTx, ChainError> {
        let txid = tx
            .get("txid")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::BadResponse("tx without txid".into()))?
            .to_string();
        let mut inputs = Vec::new();
        let no_inputs = Vec::new();
        for input in tx.get("inputs").and_then(Value::as_array).unwrap_or(&no_inputs) {
            let outpoint = input
                .get("outpoint")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let (prev_txid, prev_vout) = outpoint
                .split_once(':')
                .ok_or_else(|| ChainError::BadResponse("malformed outpoint".into()))?;
            let witness = input
                .get("witness")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|s| hex::decode(s).unwrap_or_default())
                        .collect()
                })
                .unwrap_or_default();
            inputs.push(UtxoTxIn {
                prev_txid: prev_txid.to_string(),
                prev_vout: prev_vout
                    .parse()
                    .map_err(|_| ChainError::BadResponse("malformed vout".into()))?,
                witness,
            });
        }
        let outputs = tx
            .get("outputs")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|o| UtxoTxOut {
                        value: o.get("value").and_then(Value::as_u64).unwrap_or(0),
                        address: o
                            .get("address")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(UtxoTx {
            txid,
            inputs,
            outputs,
        })
    }
}

#[async_trait]
impl UtxoChain for M1Client {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        self.rpc("getblockcount", json!([]))
            .await?
            .as_u64()
            .ok_or_else(|| ChainError::BadResponse("non-numeric height".into()))
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        self.rpc("getblockhash", json!([height]))
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("non-string block hash".into()))
    }

    async fn block_txs(&self, height: u64) -> Result<Vec<UtxoTx>, ChainError> {
        let block = self.rpc("getblockbyheight", json!([height, 2])).await?;
        block
            .get("tx")
            .and_then(Value::as_array)
            .map(|txs| txs.iter().map(Self::parse_tx).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn mempool_txs(&self) -> Result<Vec<UtxoTx>, ChainError> {
        let pool = self.rpc("getrawmempool", json!([true])).await?;
        pool.as_array()
            .map(|txs| txs.iter().map(Self::parse_tx).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<String, ChainError> {
        let raw_hex = hex::encode(raw);
        self.rpc("sendrawtransaction", json!([raw_hex]))
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("non-string txid".into()))
    }

    async fn fund_address(&self, address: &str, amount: u64) -> Result<String, ChainError> {
        self.rpc("sendtoaddress", json!([address, amount]))
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("non-string txid".into()))
    }

    async fn estimate_spend_fee(&self) -> Result<u64, ChainError> {
        let fee = self.rpc("estimatefee", json!([])).await?;
        Ok(fee.as_u64().unwrap_or(200))
    }

    async fn wallet_balance(&self) -> Result<u64, ChainError> {
        self.rpc("getbalance", json!([]))
            .await?
            .as_u64()
            .ok_or_else(|| ChainError::BadResponse("non-numeric balance".into()))
    }
}
