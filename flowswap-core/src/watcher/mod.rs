//! Chain watchers.
//!
//! One long-running poll loop per chain. Each loop re-scans forward from
//! its last-scanned height, maps on-chain observations to engine events
//! and pushes them into the engine's queue. Watchers are idempotent:
//! replaying a height range produces the same events, which the engine
//! deduplicates.
//!
//! The watch registry is the only coupling to the engine: the engine
//! registers addresses, outpoints and contract ids when a swap enters a
//! state that expects chain activity, and unregisters the swap on terminal
//! transitions.

pub mod evm;
pub mod utxo;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::crypto::HashlockTriple;
use crate::types::ChainId;

/// What a watcher is looking for on behalf of a swap.
#[derive(Clone, Debug)]
pub enum WatchTarget {
    /// HTLC funding paying this address (BTC/M1), and the leg's expiry so
    /// a never-funded HTLC still surfaces `timelock_expired`.
    FundingAddress {
        address: String,
        amount: u64,
        expiry_height: u64,
    },
    /// Spends of a funded HTLC outpoint, plus its refund-branch expiry.
    /// The hashlocks let the watcher decode claim witnesses in place.
    Outpoint {
        outpoint: String,
        expiry_height: u64,
        hashlocks: HashlockTriple,
    },
    /// `HTLCCreated` on the contract whose `hUser` matches (EVM).
    EvmCreate { contract: String, h_user: [u8; 32] },
    /// Claim/refund events for a known HTLC id, plus its expiry.
    EvmHtlc { id: [u8; 32], expiry_ts: u64 },
}

impl WatchTarget {
    fn key(&self) -> String {
        match self {
            WatchTarget::FundingAddress { address, .. } => format!("addr:{address}"),
            WatchTarget::Outpoint { outpoint, .. } => format!("out:{outpoint}"),
            WatchTarget::EvmCreate { h_user, .. } => format!("create:{}", hex::encode(h_user)),
            WatchTarget::EvmHtlc { id, .. } => format!("id:{}", hex::encode(id)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WatchEntry {
    pub swap_id: String,
    pub target: WatchTarget,
}

/// Per-chain tables of interesting addresses/outpoints/contract ids. Holds
/// swap ids only, never live swap references.
#[derive(Default)]
pub struct WatchRegistry {
    btc: DashMap<String, WatchEntry>,
    m1: DashMap<String, WatchEntry>,
    evm: DashMap<String, WatchEntry>,
}

impl WatchRegistry {
    fn table(&self, chain: ChainId) -> &DashMap<String, WatchEntry> {
        match chain {
            ChainId::Btc => &self.btc,
            ChainId::M1 => &self.m1,
            ChainId::Evm => &self.evm,
        }
    }

    pub fn register(&self, chain: ChainId, swap_id: &str, target: WatchTarget) {
        self.table(chain).insert(
            target.key(),
            WatchEntry {
                swap_id: swap_id.to_string(),
                target,
            },
        );
    }

    pub fn unregister_swap(&self, swap_id: &str) {
        for chain in [ChainId::Btc, ChainId::M1, ChainId::Evm] {
            self.table(chain).retain(|_, entry| entry.swap_id != swap_id);
        }
    }

    pub fn entries(&self, chain: ChainId) -> Vec<WatchEntry> {
        self.table(chain)
            .iter()
            .map(|kv| kv.value().clone())
            .collect()
    }

    /// Direct lookup by target key (`addr:…`, `out:…`, `create:…`, `id:…`).
    pub fn lookup(&self, chain: ChainId, key: &str) -> Option<WatchEntry> {
        self.table(chain).get(key).map(|kv| kv.value().clone())
    }

    pub fn is_empty(&self, chain: ChainId) -> bool {
        self.table(chain).is_empty()
    }
}

/// Liveness flags the watchers maintain and the health endpoint reads.
#[derive(Default)]
pub struct ChainHealth {
    btc_degraded: AtomicBool,
    m1_degraded: AtomicBool,
    evm_degraded: AtomicBool,
}

impl ChainHealth {
    fn flag(&self, chain: ChainId) -> &AtomicBool {
        match chain {
            ChainId::Btc => &self.btc_degraded,
            ChainId::M1 => &self.m1_degraded,
            ChainId::Evm => &self.evm_degraded,
        }
    }

    pub fn set_degraded(&self, chain: ChainId, degraded: bool) {
        self.flag(chain).store(degraded, Ordering::Relaxed);
    }

    pub fn is_degraded(&self, chain: ChainId) -> bool {
        self.flag(chain).load(Ordering::Relaxed)
    }
}

/// Shared handle bundle given to each watcher task.
#[derive(Clone)]
pub struct WatcherContext {
    pub registry: Arc<WatchRegistry>,
    pub health: Arc<ChainHealth>,
    pub events: tokio::sync::mpsc::UnboundedSender<crate::engine::events::WatcherEvent>,
    pub stop: tokio::sync::watch::Receiver<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn test_hashlocks() -> HashlockTriple {
        HashlockTriple {
            user: sha256(b"u"),
            lp1: sha256(b"1"),
            lp2: sha256(b"2"),
        }
    }

    #[test]
    fn registry_register_and_unregister() {
        let registry = WatchRegistry::default();
        registry.register(
            ChainId::Btc,
            "fs_a",
            WatchTarget::FundingAddress {
                address: "bcrt1qxyz".into(),
                amount: 100_000,
                expiry_height: 900,
            },
        );
        registry.register(
            ChainId::Evm,
            "fs_a",
            WatchTarget::EvmHtlc {
                id: [1; 32],
                expiry_ts: 1_000,
            },
        );
        registry.register(
            ChainId::Btc,
            "fs_b",
            WatchTarget::Outpoint {
                outpoint: "aa:0".into(),
                expiry_height: 10,
                hashlocks: test_hashlocks(),
            },
        );

        assert_eq!(registry.entries(ChainId::Btc).len(), 2);
        registry.unregister_swap("fs_a");
        assert_eq!(registry.entries(ChainId::Btc).len(), 1);
        assert!(registry.is_empty(ChainId::Evm));
    }

    #[test]
    fn reregistration_replaces_entry() {
        let registry = WatchRegistry::default();
        let target = WatchTarget::Outpoint {
            outpoint: "aa:0".into(),
            expiry_height: 10,
            hashlocks: test_hashlocks(),
        };
        registry.register(ChainId::M1, "fs_a", target.clone());
        registry.register(ChainId::M1, "fs_b", target);
        let entries = registry.entries(ChainId::M1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].swap_id, "fs_b");
    }
}
