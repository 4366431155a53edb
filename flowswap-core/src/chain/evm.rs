//! EVM JSON-RPC client.
//!
//! Transactions are submitted with `eth_sendTransaction`; the connected
//! node holds the LP account key, so the core never signs EVM payloads
//! itself.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{EvmChain, EvmLog};
use crate::error::ChainError;
use crate::htlc::evm_abi;

pub struct EvmRpcClient {
    http: reqwest::Client,
    url: String,
    lp_address: String,
}

fn parse_quantity(value: &Value) -> Result<u64, ChainError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ChainError::BadResponse("non-string quantity".into()))?;
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(stripped, 16)
        .map_err(|_| ChainError::BadResponse(format!("bad quantity {raw}")))
}

fn parse_bytes(value: &Value) -> Result<Vec<u8>, ChainError> {
    let raw = value
        .as_str()
        .ok_or_else(|| ChainError::BadResponse("non-string data".into()))?;
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).map_err(|e| ChainError::BadResponse(e.to_string()))
}

fn parse_topic(value: &Value) -> Result<[u8; 32], ChainError> {
    let bytes = parse_bytes(value)?;
    bytes
        .try_into()
        .map_err(|_| ChainError::BadResponse("topic is not 32 bytes".into()))
}

impl EvmRpcClient {
    pub fn new(url: &str, lp_address: &str, rpc_timeout_secs: u64) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(rpc_timeout_secs))
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(EvmRpcClient {
            http,
            url: url.to_string(),
            lp_address: lp_address.to_string(),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
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
            return Err(ChainError::BadResponse(error.to_string()));
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| ChainError::BadResponse("missing result".into()))
    }
}

#[async_trait]
impl EvmChain for EvmRpcClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        parse_quantity(&self.rpc("eth_blockNumber", json!([])).await?)
    }

    async fn block_hash(&self, number: u64) -> Result<String, ChainError> {
        let block = self
            .rpc(
                "eth_getBlockByNumber",
                json!([format!("0x{number:x}"), false]),
            )
            .await?;
        block
            .get("hash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("block without hash".into()))
    }

    async fn latest_timestamp(&self) -> Result<u64, ChainError> {
        let block = self
            .rpc("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        parse_quantity(
            block
                .get("timestamp")
                .ok_or_else(|| ChainError::BadResponse("block without timestamp".into()))?,
        )
    }

    async fn get_logs(
        &self,
        contract: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EvmLog>, ChainError> {
        let result = self
            .rpc(
                "eth_getLogs",
                json!([{
                    "address": contract,
                    "fromBlock": format!("0x{from_block:x}"),
                    "toBlock": format!("0x{to_block:x}"),
                }]),
            )
            .await?;
        let entries = result
            .as_array()
            .ok_or_else(|| ChainError::BadResponse("non-array logs".into()))?;
        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            let topics = entry
                .get("topics")
                .and_then(Value::as_array)
                .map(|t| t.iter().map(parse_topic).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default();
            logs.push(EvmLog {
                address: entry
                    .get("address")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                topics,
                data: parse_bytes(entry.get("data").unwrap_or(&Value::Null))?,
                block_number: parse_quantity(entry.get("blockNumber").unwrap_or(&Value::Null))?,
                block_hash: entry
                    .get("blockHash")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tx_hash: entry
                    .get("transactionHash")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(logs)
    }

    async fn send_transaction(&self, to: &str, calldata: &[u8]) -> Result<String, ChainError> {
        let result = self
            .rpc(
                "eth_sendTransaction",
                json!([{
                    "from": self.lp_address,
                    "to": to,
                    "data": format!("0x{}", hex::encode(calldata)),
                }]),
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::BadResponse("non-string tx hash".into()))
    }

    async fn call(&self, to: &str, calldata: &[u8]) -> Result<Vec<u8>, ChainError> {
        let result = self
            .rpc(
                "eth_call",
                json!([{
                    "to": to,
                    "data": format!("0x{}", hex::encode(calldata)),
                }, "latest"]),
            )
            .await?;
        parse_bytes(&result)
    }

    async fn token_balance(&self, token: &str) -> Result<u64, ChainError> {
        let holder = evm_abi::parse_address(&self.lp_address)
            .map_err(|e| ChainError::BadResponse(e.to_string()))?;
        let ret = self.call(token, &evm_abi::encode_balance_of(&holder)).await?;
        evm_abi::decode_u64(&ret).map_err(|e| ChainError::BadResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity(&json!("0x10")).unwrap(), 16);
        assert_eq!(parse_quantity(&json!("0x0")).unwrap(), 0);
        assert!(parse_quantity(&json!("zz")).is_err());
        assert!(parse_quantity(&json!(12)).is_err());
    }
}
