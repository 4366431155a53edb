//! In-memory chain clients and fixture plumbing shared by the scenario
//! tests. The engine is driven by hand-built watcher events, so the mocks
//! only have to answer the calls the engine itself makes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use flowswap_core::chain::{EvmLog, UtxoChain, UtxoTx};
use flowswap_core::config::{LpConfig, PairConfig};
use flowswap_core::crypto::sha256;
use flowswap_core::error::ChainError;
use flowswap_core::{
    Asset, BalanceSources, ChainSet, Inventory, KeyStore, PeerNotifier, SwapEngine, SwapStore,
    WatchRegistry,
};

pub const LP_EVM_ADDRESS: &str = "0x1111111111111111111111111111111111111111";
pub const USDC_TOKEN: &str = "0x2222222222222222222222222222222222222222";
pub const HTLC_CONTRACT: &str = "0x3333333333333333333333333333333333333333";

pub struct MockUtxo {
    pub tip: AtomicU64,
    pub balance: AtomicU64,
    pub fund_txid: String,
    pub funded: Mutex<Vec<(String, u64)>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl MockUtxo {
    pub fn new(tip: u64, balance: u64, fund_txid: &str) -> Arc<Self> {
        Arc::new(MockUtxo {
            tip: AtomicU64::new(tip),
            balance: AtomicU64::new(balance),
            fund_txid: fund_txid.to_string(),
            funded: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        })
    }

    pub fn last_broadcast_txid(&self) -> Option<String> {
        self.broadcasts
            .lock()
            .unwrap()
            .last()
            .map(|raw| hex::encode(sha256(raw)))
    }
}

#[async_trait]
impl UtxoChain for MockUtxo {
    async fn tip_height(&self) -> Result<u64, ChainError> {
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        Ok(format!("hash{height}"))
    }

    async fn block_txs(&self, _height: u64) -> Result<Vec<UtxoTx>, ChainError> {
        Ok(Vec::new())
    }

    async fn mempool_txs(&self) -> Result<Vec<UtxoTx>, ChainError> {
        Ok(Vec::new())
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<String, ChainError> {
        let txid = hex::encode(sha256(raw));
        self.broadcasts.lock().unwrap().push(raw.to_vec());
        Ok(txid)
    }

    async fn fund_address(&self, address: &str, amount: u64) -> Result<String, ChainError> {
        self.funded
            .lock()
            .unwrap()
            .push((address.to_string(), amount));
        Ok(self.fund_txid.clone())
    }

    async fn estimate_spend_fee(&self) -> Result<u64, ChainError> {
        Ok(500)
    }

    async fn wallet_balance(&self) -> Result<u64, ChainError> {
        Ok(self.balance.load(Ordering::SeqCst))
    }
}

pub struct MockEvm {
    pub block: AtomicU64,
    pub timestamp: AtomicU64,
    pub balance: AtomicU64,
    pub sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockEvm {
    pub fn new(block: u64, timestamp: u64, balance: u64) -> Arc<Self> {
        Arc::new(MockEvm {
            block: AtomicU64::new(block),
            timestamp: AtomicU64::new(timestamp),
            balance: AtomicU64::new(balance),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn last_tx_hash(&self) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|(_, calldata)| format!("0x{}", hex::encode(sha256(calldata))))
    }
}

#[async_trait]
impl flowswap_core::chain::EvmChain for MockEvm {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn block_hash(&self, number: u64) -> Result<String, ChainError> {
        Ok(format!("ehash{number}"))
    }

    async fn latest_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.timestamp.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        _contract: &str,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<EvmLog>, ChainError> {
        Ok(Vec::new())
    }

    async fn send_transaction(&self, to: &str, calldata: &[u8]) -> Result<String, ChainError> {
        let hash = format!("0x{}", hex::encode(sha256(calldata)));
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), calldata.to_vec()));
        Ok(hash)
    }

    async fn call(&self, _to: &str, _calldata: &[u8]) -> Result<Vec<u8>, ChainError> {
        Ok(Vec::new())
    }

    async fn token_balance(&self, _token: &str) -> Result<u64, ChainError> {
        Ok(self.balance.load(Ordering::SeqCst))
    }
}

pub struct Fixture {
    pub engine: Arc<SwapEngine>,
    pub store: Arc<SwapStore>,
    pub inventory: Arc<Inventory>,
    pub registry: Arc<WatchRegistry>,
    pub btc: Arc<MockUtxo>,
    pub m1: Arc<MockUtxo>,
    pub evm: Arc<MockEvm>,
    _dir: tempfile::TempDir,
}

pub fn test_config() -> LpConfig {
    let mut config = LpConfig::default();
    config.identity.lp_id = "lp-test".into();
    config.rpc.evm_lp_address = LP_EVM_ADDRESS.into();
    config.rpc.usdc_token = USDC_TOKEN.into();
    config.rpc.evm_htlc_contract = HTLC_CONTRACT.into();
    config.notify.base_delay_secs = 1;
    config.notify.max_delay_secs = 1;
    config.notify.max_attempts = 2;
    config.pairs = vec![
        PairConfig {
            from: Asset::Btc,
            to: Asset::Usdc,
            enabled: true,
            bid_spread_bps: 30,
            ask_spread_bps: 30,
            min_amount: 10_000,
            max_amount: 100_000_000,
        },
        PairConfig {
            from: Asset::Usdc,
            to: Asset::Btc,
            enabled: true,
            bid_spread_bps: 30,
            ask_spread_bps: 30,
            min_amount: 10_000,
            max_amount: 10_000_000_000,
        },
    ];
    config
}

pub fn fixture() -> Fixture {
    let config = test_config();
    let dir = tempfile::tempdir().unwrap();
    let btc = MockUtxo::new(800_000, 10_000_000_000, &"ab".repeat(32));
    let m1 = MockUtxo::new(900_000, 10_000_000_000, &"cd".repeat(32));
    let evm = MockEvm::new(19_000_000, 1_700_000_000, 100_000_000_000);

    let store = Arc::new(SwapStore::load(dir.path().join("db.json"), "lp-test").unwrap());
    let inventory = Arc::new(Inventory::new(
        BalanceSources {
            btc: btc.clone(),
            m1: m1.clone(),
            evm: evm.clone(),
            usdc_token: USDC_TOKEN.into(),
        },
        config.inventory.refresh_secs,
    ));
    let registry = Arc::new(WatchRegistry::default());
    let notifier = Arc::new(PeerNotifier::new(config.notify.clone()));
    let keys = Arc::new(KeyStore::from_keys(
        secp256k1::SecretKey::from_slice(&[3u8; 32]).unwrap(),
        secp256k1::SecretKey::from_slice(&[4u8; 32]).unwrap(),
    ));
    let engine = Arc::new(
        SwapEngine::new(
            Arc::new(config),
            store.clone(),
            inventory.clone(),
            ChainSet {
                btc: btc.clone(),
                m1: m1.clone(),
                evm: evm.clone(),
            },
            keys,
            registry.clone(),
            notifier,
        )
        .unwrap(),
    );
    Fixture {
        engine,
        store,
        inventory,
        registry,
        btc,
        m1,
        evm,
        _dir: dir,
    }
}

/// Compressed pubkey hex for a deterministic test key.
pub fn pubkey_hex(byte: u8) -> String {
    let secp = secp256k1::Secp256k1::new();
    let sk = secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
    hex::encode(secp256k1::PublicKey::from_secret_key(&secp, &sk).serialize())
}
