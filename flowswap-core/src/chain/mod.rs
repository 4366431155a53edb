//! Chain clients: thin command interfaces over the three chain daemons.
//!
//! Pure I/O — broadcast, query block/tx/UTXO/receipt/event, fee estimate.
//! The engine and watchers depend only on the traits here; the concrete
//! clients live in the per-chain modules and the test suite substitutes
//! in-memory mocks.

pub mod btc;
pub mod evm;
pub mod m1;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

/// A transaction input in the chain-neutral UTXO model the watchers scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoTxIn {
    pub prev_txid: String,
    pub prev_vout: u32,
    /// Witness stack items, raw bytes.
    pub witness: Vec<Vec<u8>>,
}

impl UtxoTxIn {
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.prev_txid, self.prev_vout)
    }
}

/// A transaction output in the chain-neutral UTXO model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoTxOut {
    pub value: u64,
    pub address: Option<String>,
}

/// Chain-neutral view of a UTXO-chain transaction, enough for HTLC
/// funding and spend detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoTx {
    pub txid: String,
    pub inputs: Vec<UtxoTxIn>,
    pub outputs: Vec<UtxoTxOut>,
}

/// An EVM event log as returned by `eth_getLogs`.
#[derive(Clone, Debug)]
pub struct EvmLog {
    pub address: String,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
}

/// Client for a UTXO chain daemon (BTC or M1).
#[async_trait]
pub trait UtxoChain: Send + Sync {
    async fn tip_height(&self) -> Result<u64, ChainError>;

    async fn block_hash(&self, height: u64) -> Result<String, ChainError>;

    async fn block_txs(&self, height: u64) -> Result<Vec<UtxoTx>, ChainError>;

    async fn mempool_txs(&self) -> Result<Vec<UtxoTx>, ChainError>;

    /// Broadcast a fully-signed raw transaction, returning its txid.
    async fn broadcast(&self, raw: &[u8]) -> Result<String, ChainError>;

    /// Have the daemon wallet fund `address` with `amount` sats.
    async fn fund_address(&self, address: &str, amount: u64) -> Result<String, ChainError>;

    /// Estimated fee for a standard HTLC spend, in sats.
    async fn estimate_spend_fee(&self) -> Result<u64, ChainError>;

    async fn wallet_balance(&self) -> Result<u64, ChainError>;
}

/// Client for the EVM chain.
#[async_trait]
pub trait EvmChain: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn block_hash(&self, number: u64) -> Result<String, ChainError>;

    async fn latest_timestamp(&self) -> Result<u64, ChainError>;

    async fn get_logs(
        &self,
        contract: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<EvmLog>, ChainError>;

    /// Submit a contract call signed by the connected LP account.
    async fn send_transaction(&self, to: &str, calldata: &[u8]) -> Result<String, ChainError>;

    /// `eth_call` against latest state.
    async fn call(&self, to: &str, calldata: &[u8]) -> Result<Vec<u8>, ChainError>;

    /// ERC-20 balance of the LP account for `token`, in atomic units.
    async fn token_balance(&self, token: &str) -> Result<u64, ChainError>;
}
