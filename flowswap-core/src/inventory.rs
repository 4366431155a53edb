//! Inventory: reservations against refreshed wallet balances.
//!
//! Reservations live in memory (mirrored into each swap's record by the
//! engine) and are released wholesale on terminal transitions. Balances
//! refresh on a cadence and on every reservation attempt whose cache has
//! gone stale. If a wallet balance drops below the outstanding
//! reservations — an external spend — new reservations are refused until
//! the operator restores the float.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::chain::{EvmChain, UtxoChain};
use crate::error::InventoryError;
use crate::types::{Asset, Reservation};

/// Wallet balance sources, one per asset.
pub struct BalanceSources {
    pub btc: Arc<dyn UtxoChain>,
    pub m1: Arc<dyn UtxoChain>,
    pub evm: Arc<dyn EvmChain>,
    pub usdc_token: String,
}

struct InventoryState {
    balances: HashMap<Asset, u64>,
    reservations: Vec<Reservation>,
    last_refresh: u64,
}

pub struct Inventory {
    sources: BalanceSources,
    refresh_secs: u64,
    state: RwLock<InventoryState>,
}

impl Inventory {
    pub fn new(sources: BalanceSources, refresh_secs: u64) -> Self {
        Inventory {
            sources,
            refresh_secs,
            state: RwLock::new(InventoryState {
                balances: HashMap::new(),
                reservations: Vec::new(),
                last_refresh: 0,
            }),
        }
    }

    async fn fetch_balance(&self, asset: Asset) -> Option<u64> {
        let result = match asset {
            Asset::Btc => self.sources.btc.wallet_balance().await,
            Asset::M1 => self.sources.m1.wallet_balance().await,
            Asset::Usdc => self.sources.evm.token_balance(&self.sources.usdc_token).await,
        };
        match result {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(%asset, error = %e, "balance refresh failed, keeping cached value");
                None
            }
        }
    }

    /// Refresh all wallet balances from the chain clients.
    pub async fn refresh(&self, now: u64) {
        let mut fresh = HashMap::new();
        for asset in [Asset::Btc, Asset::M1, Asset::Usdc] {
            if let Some(balance) = self.fetch_balance(asset).await {
                fresh.insert(asset, balance);
            }
        }
        let mut state = self.state.write().await;
        for (asset, balance) in fresh {
            let reserved = reserved_for(&state.reservations, asset);
            if balance < reserved {
                warn!(
                    %asset,
                    balance,
                    reserved,
                    "wallet balance below outstanding reservations"
                );
            }
            state.balances.insert(asset, balance);
        }
        state.last_refresh = now;
    }

    /// Atomically reserve `amount` of `asset` for `swap_id`. Refreshes the
    /// balance first when the cache is stale.
    pub async fn reserve(
        &self,
        asset: Asset,
        amount: u64,
        swap_id: &str,
        now: u64,
    ) -> Result<Reservation, InventoryError> {
        let stale = {
            let state = self.state.read().await;
            now.saturating_sub(state.last_refresh) >= self.refresh_secs
        };
        if stale {
            self.refresh(now).await;
        }

        let mut state = self.state.write().await;
        let balance = state.balances.get(&asset).copied().unwrap_or(0);
        let reserved = reserved_for(&state.reservations, asset);
        if balance < reserved {
            return Err(InventoryError::UnderReserved { asset });
        }
        let available = balance - reserved;
        if available < amount {
            return Err(InventoryError::Insufficient {
                asset,
                requested: amount,
                available,
            });
        }
        let reservation = Reservation {
            asset,
            amount,
            swap_id: swap_id.to_string(),
        };
        state.reservations.push(reservation.clone());
        debug!(%asset, amount, swap_id, "reserved inventory");
        Ok(reservation)
    }

    /// Free all reservations owned by `swap_id`.
    pub async fn release(&self, swap_id: &str) {
        let mut state = self.state.write().await;
        let before = state.reservations.len();
        state.reservations.retain(|r| r.swap_id != swap_id);
        if state.reservations.len() != before {
            debug!(swap_id, "released inventory reservations");
        }
    }

    /// Total reserved for an asset across all swaps.
    pub async fn reserved(&self, asset: Asset) -> u64 {
        reserved_for(&self.state.read().await.reservations, asset)
    }

    pub async fn available(&self, asset: Asset) -> u64 {
        let state = self.state.read().await;
        let balance = state.balances.get(&asset).copied().unwrap_or(0);
        balance.saturating_sub(reserved_for(&state.reservations, asset))
    }
}

fn reserved_for(reservations: &[Reservation], asset: Asset) -> u64 {
    reservations
        .iter()
        .filter(|r| r.asset == asset)
        .map(|r| r.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{EvmLog, UtxoTx};
    use crate::error::ChainError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedUtxo(AtomicU64);

    #[async_trait]
    impl UtxoChain for FixedUtxo {
        async fn tip_height(&self) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn block_hash(&self, _: u64) -> Result<String, ChainError> {
            Ok(String::new())
        }
        async fn block_txs(&self, _: u64) -> Result<Vec<UtxoTx>, ChainError> {
            Ok(vec![])
        }
        async fn mempool_txs(&self) -> Result<Vec<UtxoTx>, ChainError> {
            Ok(vec![])
        }
        async fn broadcast(&self, _: &[u8]) -> Result<String, ChainError> {
            Ok(String::new())
        }
        async fn fund_address(&self, _: &str, _: u64) -> Result<String, ChainError> {
            Ok(String::new())
        }
        async fn estimate_spend_fee(&self) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn wallet_balance(&self) -> Result<u64, ChainError> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct FixedEvm(u64);

    #[async_trait]
    impl EvmChain for FixedEvm {
        async fn block_number(&self) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn block_hash(&self, _: u64) -> Result<String, ChainError> {
            Ok(String::new())
        }
        async fn latest_timestamp(&self) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn get_logs(&self, _: &str, _: u64, _: u64) -> Result<Vec<EvmLog>, ChainError> {
            Ok(vec![])
        }
        async fn send_transaction(&self, _: &str, _: &[u8]) -> Result<String, ChainError> {
            Ok(String::new())
        }
        async fn call(&self, _: &str, _: &[u8]) -> Result<Vec<u8>, ChainError> {
            Ok(vec![])
        }
        async fn token_balance(&self, _: &str) -> Result<u64, ChainError> {
            Ok(self.0)
        }
    }

    fn inventory(btc: Arc<FixedUtxo>) -> Inventory {
        Inventory::new(
            BalanceSources {
                btc,
                m1: Arc::new(FixedUtxo(AtomicU64::new(1_000_000))),
                evm: Arc::new(FixedEvm(5_000_000)),
                usdc_token: "0x0".into(),
            },
            60,
        )
    }

    #[tokio::test]
    async fn reserve_and_release() {
        let inv = inventory(Arc::new(FixedUtxo(AtomicU64::new(100_000))));
        inv.refresh(0).await;

        inv.reserve(Asset::Btc, 60_000, "fs_a", 1).await.unwrap();
        assert_eq!(inv.available(Asset::Btc).await, 40_000);

        let err = inv.reserve(Asset::Btc, 50_000, "fs_b", 2).await.unwrap_err();
        assert!(matches!(err, InventoryError::Insufficient { available: 40_000, .. }));

        inv.release("fs_a").await;
        assert_eq!(inv.available(Asset::Btc).await, 100_000);
        inv.reserve(Asset::Btc, 50_000, "fs_b", 3).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_reservations_when_under_reserved() {
        let btc = Arc::new(FixedUtxo(AtomicU64::new(100_000)));
        let inv = inventory(btc.clone());
        inv.refresh(0).await;
        inv.reserve(Asset::Btc, 80_000, "fs_a", 1).await.unwrap();

        // External spend drains the wallet below the reservation total.
        btc.0.store(50_000, Ordering::SeqCst);
        inv.refresh(2).await;

        let err = inv.reserve(Asset::Btc, 1, "fs_b", 3).await.unwrap_err();
        assert!(matches!(err, InventoryError::UnderReserved { .. }));

        // Existing reservations survive; release then works normally.
        inv.release("fs_a").await;
        inv.reserve(Asset::Btc, 10_000, "fs_b", 4).await.unwrap();
    }
}
