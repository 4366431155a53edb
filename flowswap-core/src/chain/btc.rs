//! Bitcoin Core RPC client.

use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::{Address, Amount, Network};
use bitcoincore_rpc::{Auth, Client, RpcApi};

use super::{UtxoChain, UtxoTx, UtxoTxIn, UtxoTxOut};
use crate::error::ChainError;

pub struct BitcoinCoreClient {
    client: Client,
    network: Network,
}

fn rpc_err(e: bitcoincore_rpc::Error) -> ChainError {
    // bitcoincore-rpc folds transport and server errors together; keep the
    // mempool rejections distinguishable for retry classification.
    let text = e.to_string();
    if text.contains("min relay fee") || text.contains("mempool") {
        ChainError::MempoolRejected(text)
    } else {
        ChainError::Transport(text)
    }
}

impl BitcoinCoreClient {
    pub fn new(
        url: &str,
        user: Option<String>,
        pass: Option<String>,
        network: Network,
    ) -> Result<Self, ChainError> {
        let auth = match (user, pass) {
            (Some(u), Some(p)) => Auth::UserPass(u, p),
            _ => Auth::None,
        };
        let client = Client::new(url, auth).map_err(rpc_err)?;
        Ok(BitcoinCoreClient { client, network })
    }

    fn convert_tx(&self, tx: &bitcoin::Transaction) -> UtxoTx {
        UtxoTx {
            txid: tx.txid().to_string(),
            inputs: tx
                .input
                .iter()
                .map(|input| UtxoTxIn {
                    prev_txid: input.previous_output.txid.to_string(),
                    prev_vout: input.previous_output.vout,
                    witness: input.witness.to_vec(),
                })
                .collect(),
            outputs: tx
                .output
                .iter()
                .map(|output| UtxoTxOut {
                    value: output.value,
                    address: Address::from_script(&output.script_pubkey, self.network)
                        .map(|a| a.to_string())
                        .ok(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl UtxoChain for BitcoinCoreClient {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        self.client.get_block_count().map_err(rpc_err)
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        self.client
            .get_block_hash(height)
            .map(|h| h.to_string())
            .map_err(rpc_err)
    }

    async fn block_txs(&self, height: u64) -> Result<Vec<UtxoTx>, ChainError> {
        let hash = self.client.get_block_hash(height).map_err(rpc_err)?;
        let block = self.client.get_block(&hash).map_err(rpc_err)?;
        Ok(block.txdata.iter().map(|tx| self.convert_tx(tx)).collect())
    }

    async fn mempool_txs(&self) -> Result<Vec<UtxoTx>, ChainError> {
        let txids = self.client.get_raw_mempool().map_err(rpc_err)?;
        let mut txs = Vec::with_capacity(txids.len());
        for txid in txids {
            // Entries can be evicted between the listing and the fetch.
            if let Ok(tx) = self.client.get_raw_transaction(&txid, None) {
                txs.push(self.convert_tx(&tx));
            }
        }
        Ok(txs)
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<String, ChainError> {
        self.client
            .send_raw_transaction(raw)
            .map(|txid| txid.to_string())
            .map_err(rpc_err)
    }

    async fn fund_address(&self, address: &str, amount: u64) -> Result<String, ChainError> {
        let address = Address::from_str(address)
            .map_err(|e| ChainError::Malformed(e.to_string()))?
            .require_network(self.network)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        self.client
            .send_to_address(
                &address,
                Amount::from_sat(amount),
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .map(|txid| txid.to_string())
            .map_err(rpc_err)
    }

    async fn estimate_spend_fee(&self) -> Result<u64, ChainError> {
        let estimate = self.client.estimate_smart_fee(2, None).map_err(rpc_err)?;
        // ~150 vbytes for a single-input single-output HTLC spend.
        let rate = estimate
            .fee_rate
            .map(|r| r.to_sat())
            .unwrap_or(Amount::from_sat(1_000).to_sat());
        Ok(rate * 150 / 1_000)
    }

    async fn wallet_balance(&self) -> Result<u64, ChainError> {
        self.client
            .get_balance(None, None)
            .map(|a| a.to_sat())
            .map_err(rpc_err)
    }
}
