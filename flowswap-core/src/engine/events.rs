//! Events consumed by the swap engine.
//!
//! Three sources feed the same per-swap queue: API-boundary commands,
//! watcher observations and periodic ticks. Watcher events carry a dedup
//! key so at-least-once delivery stays idempotent.

use crate::types::ChainId;

/// A watcher observation or command addressed to one swap.
#[derive(Clone, Debug)]
pub struct WatcherEvent {
    pub swap_id: String,
    pub event: EngineEvent,
}

#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// Funding transaction seen in the mempool, not yet confirmed.
    FundingSeen {
        chain: ChainId,
        txid: String,
        outpoint: Option<String>,
        amount: u64,
    },

    /// Funding transaction confirmed at `height` with `confirmations`.
    FundingConfirmed {
        chain: ChainId,
        txid: String,
        outpoint: Option<String>,
        amount: u64,
        height: u64,
        block_hash: String,
        confirmations: u32,
    },

    /// `HTLCCreated` observed on the EVM contract at >= min depth.
    HtlcCreated {
        id: [u8; 32],
        txid: String,
        height: u64,
        block_hash: String,
        amount: u64,
        recipient: String,
        timelock: u64,
    },

    /// A claim spend of one leg. `preimages` are present when the witness
    /// or event carried all three (already matched against the hashlocks
    /// by the watcher; the engine re-verifies before persisting).
    ClaimObserved {
        chain: ChainId,
        txid: String,
        height: Option<u64>,
        block_hash: Option<String>,
        confirmations: u32,
        preimages: Option<[[u8; 32]; 3]>,
    },

    /// A refund spend of one leg.
    RefundObserved {
        chain: ChainId,
        txid: String,
        height: Option<u64>,
        confirmations: u32,
    },

    /// The leg's timelock has passed on-chain.
    TimelockExpired { chain: ChainId, timelock: u64 },

    /// Blocks at and above `height` are no longer canonical.
    Reorg {
        chain: ChainId,
        height: u64,
        new_hash: String,
    },

    /// Peer LP_IN reports its M1 HTLC confirmed (LP_OUT side).
    PeerM1Locked {
        outpoint: String,
        amount_sats: u64,
        expiry_height: u64,
    },

    /// Peer LP_OUT hands back the revealed preimages (LP_IN side).
    PeerSecrets {
        claim_txid: String,
        preimages: [[u8; 32]; 3],
    },

    /// User-facing hint that a funding transaction was sent; nudges an
    /// early re-scan but carries no authority of its own.
    FundingHint { chain: ChainId },

    /// Periodic tick: re-derive and retry any pending on-chain action.
    Tick { now: u64 },
}

impl EngineEvent {
    /// Dedup key for at-least-once watcher delivery. Commands and ticks
    /// are not deduplicated; their handlers are idempotent by state.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            EngineEvent::FundingSeen { chain, txid, .. } => {
                Some(format!("{chain}:funding_seen:{txid}"))
            }
            EngineEvent::FundingConfirmed {
                chain,
                txid,
                block_hash,
                confirmations,
                ..
            } => Some(format!("{chain}:funded:{txid}:{block_hash}:{confirmations}")),
            EngineEvent::HtlcCreated { id, txid, block_hash, .. } => {
                Some(format!("evm:created:{}:{txid}:{block_hash}", hex::encode(id)))
            }
            EngineEvent::ClaimObserved {
                chain,
                txid,
                block_hash,
                confirmations,
                ..
            } => Some(format!(
                "{chain}:claim:{txid}:{}:{confirmations}",
                block_hash.as_deref().unwrap_or("mempool")
            )),
            EngineEvent::RefundObserved {
                chain,
                txid,
                confirmations,
                ..
            } => Some(format!("{chain}:refund:{txid}:{confirmations}")),
            EngineEvent::TimelockExpired { chain, timelock } => {
                Some(format!("{chain}:expired:{timelock}"))
            }
            EngineEvent::Reorg {
                chain,
                height,
                new_hash,
            } => Some(format!("{chain}:reorg:{height}:{new_hash}")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_events_have_stable_keys() {
        let event = EngineEvent::FundingConfirmed {
            chain: ChainId::Btc,
            txid: "t1".into(),
            outpoint: Some("t1:0".into()),
            amount: 1,
            height: 10,
            block_hash: "h".into(),
            confirmations: 2,
        };
        assert_eq!(event.dedup_key().unwrap(), "btc:funded:t1:h:2");
        // Deeper confirmation of the same tx is a distinct observation.
        let deeper = EngineEvent::FundingConfirmed {
            chain: ChainId::Btc,
            txid: "t1".into(),
            outpoint: Some("t1:0".into()),
            amount: 1,
            height: 10,
            block_hash: "h".into(),
            confirmations: 3,
        };
        assert_ne!(event.dedup_key(), deeper.dedup_key());
    }

    #[test]
    fn commands_are_not_deduplicated() {
        assert!(EngineEvent::Tick { now: 0 }.dedup_key().is_none());
        assert!(EngineEvent::FundingHint {
            chain: ChainId::Btc
        }
        .dedup_key()
        .is_none());
    }
}
