//! Watcher for the UTXO chains (BTC and M1).
//!
//! One instance per chain, parameterized by the chain id, client and
//! reorg depth. Each tick re-scans forward from the last scanned height,
//! checks the recent-block window for reorgs, sweeps the mempool for
//! early funding/claim sightings and fires timelock expiries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{WatchTarget, WatcherContext};
use crate::chain::{UtxoChain, UtxoTx};
use crate::engine::events::{EngineEvent, WatcherEvent};
use crate::error::ChainError;
use crate::htlc::{classify_witness, extract_preimages, SpendKind};
use crate::types::ChainId;

pub struct UtxoWatcherConfig {
    pub chain: ChainId,
    pub poll_secs: u64,
    pub degraded_poll_secs: u64,
    pub reorg_depth: u64,
}

/// A funding match remembered so its confirmation count can be re-reported
/// as the chain extends.
struct SeenFunding {
    swap_id: String,
    txid: String,
    vout: u32,
    amount: u64,
    height: u64,
    block_hash: String,
}

pub struct UtxoWatcher {
    client: Arc<dyn UtxoChain>,
    ctx: WatcherContext,
    config: UtxoWatcherConfig,
    last_scanned: Option<u64>,
    /// Recent (height, hash) pairs, newest last, for reorg detection.
    recent: VecDeque<(u64, String)>,
    /// Funding matches by address key, re-reported while shallow.
    fundings: HashMap<String, SeenFunding>,
}

/// Confirmation re-reporting stops once past the deepest tier any policy
/// uses.
const MAX_REPORTED_CONFS: u64 = 6;

impl UtxoWatcher {
    pub fn new(client: Arc<dyn UtxoChain>, ctx: WatcherContext, config: UtxoWatcherConfig) -> Self {
        UtxoWatcher {
            client,
            ctx,
            config,
            last_scanned: None,
            recent: VecDeque::new(),
            fundings: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let chain = self.config.chain;
        info!(%chain, "utxo watcher started");
        loop {
            if *self.ctx.stop.borrow() {
                break;
            }
            let interval = match self.scan_once().await {
                Ok(()) => {
                    self.ctx.health.set_degraded(chain, false);
                    Duration::from_secs(self.config.poll_secs)
                }
                Err(e) => {
                    warn!(%chain, error = %e, "scan failed; backing off");
                    self.ctx.health.set_degraded(chain, true);
                    Duration::from_secs(self.config.degraded_poll_secs)
                }
            };
            let mut stop = self.ctx.stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {}
            }
        }
        info!(%chain, "utxo watcher stopped");
    }

    fn emit(&self, swap_id: &str, event: EngineEvent) {
        let _ = self.ctx.events.send(WatcherEvent {
            swap_id: swap_id.to_string(),
            event,
        });
    }

    async fn scan_once(&mut self) -> Result<(), ChainError> {
        let chain = self.config.chain;
        let tip = self.client.tip_height().await?;

        self.check_reorg(tip).await?;

        let start = match self.last_scanned {
            Some(last) if last < tip => last + 1,
            Some(_) => tip + 1, // nothing new
            None => tip.saturating_sub(self.config.reorg_depth),
        };
        for height in start..=tip {
            let hash = self.client.block_hash(height).await?;
            let txs = self.client.block_txs(height).await?;
            for tx in &txs {
                self.process_tx(tx, Some((height, hash.as_str())), tip);
            }
            self.recent.push_back((height, hash));
            while self.recent.len() as u64 > self.config.reorg_depth + 1 {
                self.recent.pop_front();
            }
            self.last_scanned = Some(height);
        }

        // Re-report shallow fundings so confirmation tiers fill in; drop
        // matches whose watch entry is gone.
        let stale: Vec<String> = self
            .fundings
            .keys()
            .filter(|key| self.ctx.registry.lookup(chain, key).is_none())
            .cloned()
            .collect();
        for key in stale {
            self.fundings.remove(&key);
        }
        for seen in self.fundings.values() {
            let confirmations = tip.saturating_sub(seen.height) + 1;
            if confirmations <= MAX_REPORTED_CONFS {
                self.emit(
                    &seen.swap_id,
                    EngineEvent::FundingConfirmed {
                        chain,
                        txid: seen.txid.clone(),
                        outpoint: Some(format!("{}:{}", seen.txid, seen.vout)),
                        amount: seen.amount,
                        height: seen.height,
                        block_hash: seen.block_hash.clone(),
                        confirmations: confirmations as u32,
                    },
                );
            }
        }

        // Mempool sweep for zero-conf sightings.
        match self.client.mempool_txs().await {
            Ok(pool) => {
                for tx in &pool {
                    self.process_tx(tx, None, tip);
                }
            }
            Err(e) => debug!(%chain, error = %e, "mempool scan failed"),
        }

        // Timelock expiries for registered legs.
        for entry in self.ctx.registry.entries(chain) {
            let expiry = match &entry.target {
                WatchTarget::FundingAddress { expiry_height, .. } => *expiry_height,
                WatchTarget::Outpoint { expiry_height, .. } => *expiry_height,
                _ => continue,
            };
            if tip >= expiry {
                self.emit(
                    &entry.swap_id,
                    EngineEvent::TimelockExpired {
                        chain,
                        timelock: expiry,
                    },
                );
            }
        }
        Ok(())
    }

    /// Compare the stored recent-block hashes against the chain; on a
    /// mismatch, rewind to the fork point and tell every registered swap.
    async fn check_reorg(&mut self, tip: u64) -> Result<(), ChainError> {
        let chain = self.config.chain;
        let Some((newest_height, newest_hash)) = self.recent.back().cloned() else {
            return Ok(());
        };
        if newest_height > tip {
            // The chain itself shrank; treat the tip as the fork point.
            self.rewind(tip.saturating_sub(1), String::new());
            return Ok(());
        }
        if self.client.block_hash(newest_height).await? == newest_hash {
            return Ok(());
        }
        // Walk back through the window for the deepest still-canonical
        // block.
        let mut fork_height = newest_height;
        let mut new_hash = String::new();
        for (height, stored) in self.recent.iter().rev() {
            let current = self.client.block_hash(*height).await?;
            if current == *stored {
                break;
            }
            fork_height = *height;
            new_hash = current;
        }
        warn!(%chain, fork_height, "reorg detected");
        for entry in self.ctx.registry.entries(chain) {
            self.emit(
                &entry.swap_id,
                EngineEvent::Reorg {
                    chain,
                    height: fork_height,
                    new_hash: new_hash.clone(),
                },
            );
        }
        self.rewind(fork_height.saturating_sub(1), new_hash);
        Ok(())
    }

    fn rewind(&mut self, to_height: u64, _new_hash: String) {
        self.recent.retain(|(h, _)| *h <= to_height);
        self.last_scanned = Some(to_height);
        self.fundings.retain(|_, seen| seen.height <= to_height);
    }

    /// Match one transaction against the watch tables. `confirmed` carries
    /// the containing block when the tx came from a block scan.
    fn process_tx(&mut self, tx: &UtxoTx, confirmed: Option<(u64, &str)>, tip: u64) {
        let chain = self.config.chain;

        // Outputs paying a watched HTLC address: funding.
        for (vout, output) in tx.outputs.iter().enumerate() {
            let Some(address) = output.address.as_deref() else { continue };
            let Some(entry) = self
                .ctx
                .registry
                .lookup(chain, &format!("addr:{address}"))
            else {
                continue;
            };
            match confirmed {
                Some((height, block_hash)) => {
                    let confirmations = tip.saturating_sub(height) + 1;
                    self.fundings.insert(
                        format!("addr:{address}"),
                        SeenFunding {
                            swap_id: entry.swap_id.clone(),
                            txid: tx.txid.clone(),
                            vout: vout as u32,
                            amount: output.value,
                            height,
                            block_hash: block_hash.to_string(),
                        },
                    );
                    self.emit(
                        &entry.swap_id,
                        EngineEvent::FundingConfirmed {
                            chain,
                            txid: tx.txid.clone(),
                            outpoint: Some(format!("{}:{vout}", tx.txid)),
                            amount: output.value,
                            height,
                            block_hash: block_hash.to_string(),
                            confirmations: confirmations as u32,
                        },
                    );
                }
                None => {
                    self.emit(
                        &entry.swap_id,
                        EngineEvent::FundingSeen {
                            chain,
                            txid: tx.txid.clone(),
                            outpoint: Some(format!("{}:{vout}", tx.txid)),
                            amount: output.value,
                        },
                    );
                }
            }
        }

        // Inputs spending a watched outpoint: claim or refund.
        for input in &tx.inputs {
            let key = format!("out:{}", input.outpoint());
            let Some(entry) = self.ctx.registry.lookup(chain, &key) else {
                continue;
            };
            let WatchTarget::Outpoint { hashlocks, .. } = &entry.target else {
                continue;
            };
            let (height, block_hash, confirmations) = match confirmed {
                Some((h, hash)) => (
                    Some(h),
                    Some(hash.to_string()),
                    (tip.saturating_sub(h) + 1) as u32,
                ),
                None => (None, None, 0),
            };
            match classify_witness(&input.witness) {
                Some(SpendKind::Claim) => {
                    let preimages = extract_preimages(&input.witness, hashlocks).ok();
                    if preimages.is_none() {
                        warn!(%chain, txid = %tx.txid, "claim witness without matching preimages");
                    }
                    self.emit(
                        &entry.swap_id,
                        EngineEvent::ClaimObserved {
                            chain,
                            txid: tx.txid.clone(),
                            height,
                            block_hash,
                            confirmations,
                            preimages,
                        },
                    );
                }
                Some(SpendKind::Refund) => {
                    self.emit(
                        &entry.swap_id,
                        EngineEvent::RefundObserved {
                            chain,
                            txid: tx.txid.clone(),
                            height,
                            confirmations,
                        },
                    );
                }
                None => {
                    debug!(%chain, txid = %tx.txid, "unrecognized spend of watched outpoint");
                }
            }
        }

        // A block tx whose txid matches a watched outpoint's funding txid
        // confirms an HTLC we only knew by outpoint (per-leg LP_OUT).
        if let Some((height, block_hash)) = confirmed {
            for entry in self.ctx.registry.entries(chain) {
                let WatchTarget::Outpoint { outpoint, .. } = &entry.target else {
                    continue;
                };
                let Some((funding_txid, vout)) = outpoint.split_once(':') else {
                    continue;
                };
                if funding_txid != tx.txid {
                    continue;
                }
                let Ok(vout) = vout.parse::<usize>() else { continue };
                let Some(output) = tx.outputs.get(vout) else { continue };
                self.emit(
                    &entry.swap_id,
                    EngineEvent::FundingConfirmed {
                        chain,
                        txid: tx.txid.clone(),
                        outpoint: Some(outpoint.clone()),
                        amount: output.value,
                        height,
                        block_hash: block_hash.to_string(),
                        confirmations: (tip.saturating_sub(height) + 1) as u32,
                    },
                );
            }
        }
    }
}
