//! Watcher for the EVM chain.
//!
//! Scans `eth_getLogs` over the HTLC contract at a minimum depth, decodes
//! the three-hashlock events, re-reads contract storage as a tie-break on
//! claims, and fires timestamp-based expiries.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{WatchTarget, WatcherContext};
use crate::chain::{EvmChain, EvmLog};
use crate::engine::events::{EngineEvent, WatcherEvent};
use crate::error::ChainError;
use crate::htlc::evm_abi::{self, EvmHtlcStatus};
use crate::types::ChainId;

pub struct EvmWatcherConfig {
    pub contract: String,
    pub poll_secs: u64,
    pub degraded_poll_secs: u64,
    pub reorg_depth: u64,
    pub min_depth: u64,
}

pub struct EvmWatcher {
    client: Arc<dyn EvmChain>,
    ctx: WatcherContext,
    config: EvmWatcherConfig,
    last_scanned: Option<u64>,
    recent: VecDeque<(u64, String)>,
}

impl EvmWatcher {
    pub fn new(client: Arc<dyn EvmChain>, ctx: WatcherContext, config: EvmWatcherConfig) -> Self {
        EvmWatcher {
            client,
            ctx,
            config,
            last_scanned: None,
            recent: VecDeque::new(),
        }
    }

    pub async fn run(mut self) {
        info!("evm watcher started");
        loop {
            if *self.ctx.stop.borrow() {
                break;
            }
            let interval = match self.scan_once().await {
                Ok(()) => {
                    self.ctx.health.set_degraded(ChainId::Evm, false);
                    Duration::from_secs(self.config.poll_secs)
                }
                Err(e) => {
                    warn!(error = %e, "evm scan failed; backing off");
                    self.ctx.health.set_degraded(ChainId::Evm, true);
                    Duration::from_secs(self.config.degraded_poll_secs)
                }
            };
            let mut stop = self.ctx.stop.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {}
            }
        }
        info!("evm watcher stopped");
    }

    fn emit(&self, swap_id: &str, event: EngineEvent) {
        let _ = self.ctx.events.send(WatcherEvent {
            swap_id: swap_id.to_string(),
            event,
        });
    }

    async fn scan_once(&mut self) -> Result<(), ChainError> {
        let tip = self.client.block_number().await?;
        // Only read logs at the configured depth so single-block wobble
        // never surfaces as state.
        let confirmed_tip = tip.saturating_sub(self.config.min_depth);

        self.check_reorg(confirmed_tip).await?;

        let start = match self.last_scanned {
            Some(last) if last < confirmed_tip => last + 1,
            Some(_) => confirmed_tip + 1,
            None => confirmed_tip.saturating_sub(self.config.reorg_depth),
        };
        if start <= confirmed_tip {
            let logs = self
                .client
                .get_logs(&self.config.contract, start, confirmed_tip)
                .await?;
            for log in &logs {
                self.handle_log(log, tip).await;
            }
            let hash = self.client.block_hash(confirmed_tip).await?;
            self.recent.push_back((confirmed_tip, hash));
            while self.recent.len() as u64 > self.config.reorg_depth + 1 {
                self.recent.pop_front();
            }
            self.last_scanned = Some(confirmed_tip);
        }

        // Timestamp expiries.
        let now_ts = self.client.latest_timestamp().await?;
        for entry in self.ctx.registry.entries(ChainId::Evm) {
            if let WatchTarget::EvmHtlc { expiry_ts, .. } = entry.target {
                if now_ts >= expiry_ts {
                    self.emit(
                        &entry.swap_id,
                        EngineEvent::TimelockExpired {
                            chain: ChainId::Evm,
                            timelock: expiry_ts,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn check_reorg(&mut self, confirmed_tip: u64) -> Result<(), ChainError> {
        let Some((newest_height, newest_hash)) = self.recent.back().cloned() else {
            return Ok(());
        };
        if newest_height > confirmed_tip {
            self.rewind(confirmed_tip.saturating_sub(1));
            return Ok(());
        }
        if self.client.block_hash(newest_height).await? == newest_hash {
            return Ok(());
        }
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
        warn!(fork_height, "evm reorg detected");
        for entry in self.ctx.registry.entries(ChainId::Evm) {
            self.emit(
                &entry.swap_id,
                EngineEvent::Reorg {
                    chain: ChainId::Evm,
                    height: fork_height,
                    new_hash: new_hash.clone(),
                },
            );
        }
        self.rewind(fork_height.saturating_sub(1));
        Ok(())
    }

    fn rewind(&mut self, to_height: u64) {
        self.recent.retain(|(h, _)| *h <= to_height);
        self.last_scanned = Some(to_height);
    }

    async fn handle_log(&self, log: &EvmLog, tip: u64) {
        let confirmations = (tip.saturating_sub(log.block_number) + 1) as u32;
        let Some(topic0) = log.topics.first() else { return };

        if *topic0 == evm_abi::topic_created() {
            let event = match evm_abi::decode_created(&log.topics, &log.data) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "undecodable HTLCCreated log");
                    return;
                }
            };
            let key = format!("create:{}", hex::encode(event.hashlocks.user));
            let Some(entry) = self.ctx.registry.lookup(ChainId::Evm, &key) else {
                return;
            };
            self.emit(
                &entry.swap_id,
                EngineEvent::HtlcCreated {
                    id: event.id,
                    txid: log.tx_hash.clone(),
                    height: log.block_number,
                    block_hash: log.block_hash.clone(),
                    amount: event.amount,
                    recipient: evm_abi::format_address(&event.recipient),
                    timelock: event.timelock,
                },
            );
        } else if *topic0 == evm_abi::topic_claimed() {
            let (id, preimages) = match evm_abi::decode_claimed(&log.topics, &log.data) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "undecodable HTLCClaimed log");
                    return;
                }
            };
            let key = format!("id:{}", hex::encode(id));
            let Some(entry) = self.ctx.registry.lookup(ChainId::Evm, &key) else {
                return;
            };
            // Tie-break: trust the event only if contract storage agrees.
            match self.read_status(&id).await {
                Ok(EvmHtlcStatus::Claimed) | Err(_) => {}
                Ok(other) => {
                    debug!(?other, "claim event contradicts storage; skipping");
                    return;
                }
            }
            self.emit(
                &entry.swap_id,
                EngineEvent::ClaimObserved {
                    chain: ChainId::Evm,
                    txid: log.tx_hash.clone(),
                    height: Some(log.block_number),
                    block_hash: Some(log.block_hash.clone()),
                    confirmations,
                    preimages: Some(preimages),
                },
            );
        } else if *topic0 == evm_abi::topic_refunded() {
            let Ok(id) = evm_abi::decode_refunded(&log.topics) else {
                return;
            };
            let key = format!("id:{}", hex::encode(id));
            let Some(entry) = self.ctx.registry.lookup(ChainId::Evm, &key) else {
                return;
            };
            self.emit(
                &entry.swap_id,
                EngineEvent::RefundObserved {
                    chain: ChainId::Evm,
                    txid: log.tx_hash.clone(),
                    height: Some(log.block_number),
                    confirmations,
                },
            );
        }
    }

    async fn read_status(&self, id: &[u8; 32]) -> Result<EvmHtlcStatus, ChainError> {
        let ret = self
            .client
            .call(&self.config.contract, &evm_abi::encode_status(id))
            .await?;
        evm_abi::decode_status(&ret).map_err(|e| ChainError::BadResponse(e.to_string()))
    }
}
