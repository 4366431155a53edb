//! Core data model: swaps, legs, states and the audit timeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{hex32_opt, HashlockTriple, SecretSet};

/// Assets the LP trades. BTC and M1 amounts are sats; USDC amounts are
/// micro-USDC. Sats on M1 map 1:1 to sats on BTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    M1,
    Usdc,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Btc => write!(f, "BTC"),
            Asset::M1 => write!(f, "M1"),
            Asset::Usdc => write!(f, "USDC"),
        }
    }
}

/// The three chains a swap spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainId {
    Btc,
    M1,
    Evm,
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainId::Btc => write!(f, "btc"),
            ChainId::M1 => write!(f, "m1"),
            ChainId::Evm => write!(f, "evm"),
        }
    }
}

/// Swap direction: `forward` is BTC->USDC, `reverse` is USDC->BTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Reverse,
}

/// Role played in per-leg mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    LpIn,
    LpOut,
}

/// Whether a single LP bridges all three chains or two cooperating LPs
/// hand off at the M1 rail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum RoutingMode {
    SingleLp,
    PerLeg { role: LegRole, peer_url: String },
}

/// Swap lifecycle states. Terminal states are `completed`, `refunded` and
/// `failed`; `peer_unreachable` is a non-terminal warning state and the
/// parked swap keeps its resumable state alongside.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Init,
    // Forward path (BTC -> USDC).
    AwaitingBtc,
    BtcFundingSeen,
    BtcFunded,
    M1Locked,
    UsdcLocked,
    UsdcClaimedByUser,
    M1SelfClaimed,
    BtcClaimed,
    // Reverse path (USDC -> BTC).
    AwaitingUsdc,
    UsdcFundingSeen,
    UsdcFunded,
    BtcLocked,
    BtcClaimedByUser,
    UsdcClaimed,
    // Per-leg handoff states.
    M1LockedForLpOut,
    M1LockedSeen,
    M1ClaimedFromLpIn,
    // Refund path.
    RefundPending,
    // Warning / operator states.
    PeerUnreachable,
    BtcRefundUnrecoverable,
    LegBroken,
    // Terminal.
    Completed,
    Refunded,
    Failed,
}

impl SwapState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Completed | SwapState::Refunded | SwapState::Failed
        )
    }

    /// States from which the operator may still force-fail: nothing has
    /// been funded on any chain yet.
    pub fn is_prefunding(&self) -> bool {
        matches!(
            self,
            SwapState::Init
                | SwapState::AwaitingBtc
                | SwapState::AwaitingUsdc
                | SwapState::BtcFundingSeen
                | SwapState::UsdcFundingSeen
        )
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // snake_case, matching the serde rendering used on the wire.
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// On-chain evidence for one leg operation: the transaction plus where it
/// confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvidence {
    pub txid: String,
    pub height: Option<u64>,
    pub block_hash: Option<String>,
    pub confirmations: u32,
}

impl ChainEvidence {
    pub fn unconfirmed(txid: impl Into<String>) -> Self {
        ChainEvidence {
            txid: txid.into(),
            height: None,
            block_hash: None,
            confirmations: 0,
        }
    }
}

/// Fields shared by all three HTLC variants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HtlcCore {
    pub amount: u64,
    pub hashlocks: HashlockTriple,
    /// Absolute block height for BTC/M1, absolute Unix timestamp for EVM.
    pub timelock: u64,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub funded: bool,
    #[serde(default)]
    pub claimed: bool,
    #[serde(default)]
    pub refunded: bool,
    pub fund_evidence: Option<ChainEvidence>,
    pub claim_evidence: Option<ChainEvidence>,
    pub refund_evidence: Option<ChainEvidence>,
}

impl HtlcCore {
    pub fn new(
        amount: u64,
        hashlocks: HashlockTriple,
        timelock: u64,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        HtlcCore {
            amount,
            hashlocks,
            timelock,
            sender: sender.into(),
            recipient: recipient.into(),
            funded: false,
            claimed: false,
            refunded: false,
            fund_evidence: None,
            claim_evidence: None,
            refund_evidence: None,
        }
    }
}

/// HTLC on a UTXO chain (BTC or M1): a script address plus, once funded,
/// the outpoint holding the locked coins.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtxoHtlc {
    #[serde(flatten)]
    pub core: HtlcCore,
    pub address: String,
    /// `txid:vout` once the funding output is known.
    pub outpoint: Option<String>,
    /// Hex-encoded compressed pubkey for the claim branch.
    pub claim_pubkey: String,
    /// Hex-encoded compressed pubkey for the refund branch.
    pub refund_pubkey: String,
}

/// HTLC held in the EVM contract, identified by the contract-assigned id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvmHtlc {
    #[serde(flatten)]
    pub core: HtlcCore,
    /// The HTLC contract address.
    pub contract: String,
    /// ERC-20 token address held by the HTLC.
    pub token: String,
    /// Contract-assigned id, known once `HTLCCreated` is observed.
    #[serde(with = "hex32_opt", default)]
    pub htlc_id: Option<[u8; 32]>,
}

/// Tagged per-chain HTLC descriptor. The engine only ever dispatches by
/// variant; chain-specific construction lives in the codec layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "chain")]
pub enum HtlcLeg {
    Btc(UtxoHtlc),
    M1(UtxoHtlc),
    Evm(EvmHtlc),
}

impl HtlcLeg {
    pub fn chain(&self) -> ChainId {
        match self {
            HtlcLeg::Btc(_) => ChainId::Btc,
            HtlcLeg::M1(_) => ChainId::M1,
            HtlcLeg::Evm(_) => ChainId::Evm,
        }
    }

    pub fn core(&self) -> &HtlcCore {
        match self {
            HtlcLeg::Btc(l) | HtlcLeg::M1(l) => &l.core,
            HtlcLeg::Evm(l) => &l.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut HtlcCore {
        match self {
            HtlcLeg::Btc(l) | HtlcLeg::M1(l) => &mut l.core,
            HtlcLeg::Evm(l) => &mut l.core,
        }
    }

    pub fn as_utxo(&self) -> Option<&UtxoHtlc> {
        match self {
            HtlcLeg::Btc(l) | HtlcLeg::M1(l) => Some(l),
            HtlcLeg::Evm(_) => None,
        }
    }

    pub fn as_utxo_mut(&mut self) -> Option<&mut UtxoHtlc> {
        match self {
            HtlcLeg::Btc(l) | HtlcLeg::M1(l) => Some(l),
            HtlcLeg::Evm(_) => None,
        }
    }

    pub fn as_evm(&self) -> Option<&EvmHtlc> {
        match self {
            HtlcLeg::Evm(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_evm_mut(&mut self) -> Option<&mut EvmHtlc> {
        match self {
            HtlcLeg::Evm(l) => Some(l),
            _ => None,
        }
    }
}

/// An inventory claim held by a swap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub asset: Asset,
    pub amount: u64,
    pub swap_id: String,
}

/// One entry of the append-only audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub at: u64,
    pub state: SwapState,
    pub note: String,
}

/// Rate quote recorded on the swap; `to_amount` derives from it in integer
/// arithmetic only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteTerms {
    pub rate_num: u64,
    pub rate_den: u64,
    pub spread_bps: u32,
    pub protocol_fee: u64,
}

impl QuoteTerms {
    /// `to_amount = floor(from_amount * rate * (1 - spread)) - fee`, all in
    /// integer atomic units. Returns `None` on overflow or when the fee
    /// exceeds the converted amount.
    pub fn to_amount(&self, from_amount: u64) -> Option<u64> {
        if self.rate_den == 0 || self.spread_bps >= 10_000 {
            return None;
        }
        let converted = (from_amount as u128)
            .checked_mul(self.rate_num as u128)?
            .checked_div(self.rate_den as u128)?;
        let after_spread = converted
            .checked_mul((10_000 - self.spread_bps) as u128)?
            .checked_div(10_000)?;
        let after_fee = after_spread.checked_sub(self.protocol_fee as u128)?;
        u64::try_from(after_fee).ok()
    }
}

/// The canonical swap record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Swap {
    pub swap_id: String,
    pub direction: Direction,
    pub routing: RoutingMode,
    pub from_asset: Asset,
    pub to_asset: Asset,
    pub from_amount: u64,
    pub to_amount: u64,
    pub quote: QuoteTerms,
    pub hashlocks: HashlockTriple,
    #[serde(default)]
    pub secrets: SecretSet,
    pub btc_leg: Option<HtlcLeg>,
    pub m1_leg: Option<HtlcLeg>,
    pub evm_leg: Option<HtlcLeg>,
    pub state: SwapState,
    /// Set while the swap is parked `peer_unreachable`; on-chain events
    /// resume from this state.
    pub resume_state: Option<SwapState>,
    pub timeline: Vec<TimelineEvent>,
    pub user_refund_address: String,
    pub user_payout_address: String,
    /// Hex compressed pubkey for the user's branch of the BTC HTLC:
    /// refund branch when the user funds, claim branch when the LP pays out.
    pub user_btc_pubkey: String,
    /// LP_OUT's M1 claim pubkey, exchanged at init-leg time (LP_IN only).
    pub peer_m1_pubkey: Option<String>,
    #[serde(default)]
    pub m1_notified: bool,
    #[serde(default)]
    pub secrets_notified: bool,
    pub created_at: u64,
    pub updated_at: u64,
    pub terminal_at: Option<u64>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    /// Dedup keys of watcher events already applied, bounded FIFO.
    #[serde(default)]
    pub seen_events: Vec<String>,
}

impl Swap {
    pub fn leg(&self, chain: ChainId) -> Option<&HtlcLeg> {
        match chain {
            ChainId::Btc => self.btc_leg.as_ref(),
            ChainId::M1 => self.m1_leg.as_ref(),
            ChainId::Evm => self.evm_leg.as_ref(),
        }
    }

    pub fn leg_mut(&mut self, chain: ChainId) -> Option<&mut HtlcLeg> {
        match chain {
            ChainId::Btc => self.btc_leg.as_mut(),
            ChainId::M1 => self.m1_leg.as_mut(),
            ChainId::Evm => self.evm_leg.as_mut(),
        }
    }

    /// The state transitions are validated against when the swap is parked.
    pub fn effective_state(&self) -> SwapState {
        if self.state == SwapState::PeerUnreachable {
            self.resume_state.unwrap_or(self.state)
        } else {
            self.state
        }
    }

    /// True once any leg carries confirmed on-chain funding.
    pub fn any_leg_funded(&self) -> bool {
        [&self.btc_leg, &self.m1_leg, &self.evm_leg]
            .into_iter()
            .flatten()
            .any(|leg| leg.core().funded)
    }

    pub fn push_timeline(&mut self, now: u64, state: SwapState, note: impl Into<String>) {
        self.timeline.push(TimelineEvent {
            at: now,
            state,
            note: note.into(),
        });
        self.updated_at = now;
    }

    /// Record a watcher-event dedup key; returns false if already applied.
    pub fn note_event(&mut self, key: String) -> bool {
        if self.seen_events.iter().any(|k| k == &key) {
            return false;
        }
        self.seen_events.push(key);
        const CAP: usize = 256;
        if self.seen_events.len() > CAP {
            let excess = self.seen_events.len() - CAP;
            self.seen_events.drain(..excess);
        }
        true
    }
}

/// Generate an `fs_`-prefixed 128-bit random swap id.
pub fn new_swap_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("fs_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn triple() -> HashlockTriple {
        HashlockTriple {
            user: sha256(b"u"),
            lp1: sha256(b"1"),
            lp2: sha256(b"2"),
        }
    }

    #[test]
    fn swap_id_format() {
        let id = new_swap_id();
        assert!(id.starts_with("fs_"));
        assert_eq!(id.len(), 3 + 32);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_swap_id());
    }

    #[test]
    fn quote_integer_arithmetic() {
        // 100_000 sats at 600 USDC/BTC (micro-USDC per sat: 600_000_000 / 100_000_000)
        let quote = QuoteTerms {
            rate_num: 600_000_000,
            rate_den: 100_000_000,
            spread_bps: 30,
            protocol_fee: 1_000,
        };
        // 100_000 * 6 = 600_000; * 0.997 = 598_200; - 1_000 = 597_200
        assert_eq!(quote.to_amount(100_000), Some(597_200));
    }

    #[test]
    fn quote_rejects_degenerate_terms() {
        let quote = QuoteTerms {
            rate_num: 1,
            rate_den: 0,
            spread_bps: 0,
            protocol_fee: 0,
        };
        assert_eq!(quote.to_amount(1), None);
        let quote = QuoteTerms {
            rate_num: 1,
            rate_den: 1,
            spread_bps: 10_000,
            protocol_fee: 0,
        };
        assert_eq!(quote.to_amount(1), None);
    }

    #[test]
    fn terminal_states() {
        assert!(SwapState::Completed.is_terminal());
        assert!(SwapState::Refunded.is_terminal());
        assert!(SwapState::Failed.is_terminal());
        assert!(!SwapState::PeerUnreachable.is_terminal());
        assert!(!SwapState::BtcRefundUnrecoverable.is_terminal());
    }

    #[test]
    fn event_dedup_is_bounded() {
        let mut swap = Swap {
            swap_id: new_swap_id(),
            direction: Direction::Forward,
            routing: RoutingMode::SingleLp,
            from_asset: Asset::Btc,
            to_asset: Asset::Usdc,
            from_amount: 1,
            to_amount: 1,
            quote: QuoteTerms {
                rate_num: 1,
                rate_den: 1,
                spread_bps: 0,
                protocol_fee: 0,
            },
            hashlocks: triple(),
            secrets: SecretSet::default(),
            btc_leg: None,
            m1_leg: None,
            evm_leg: None,
            state: SwapState::Init,
            resume_state: None,
            timeline: vec![],
            user_refund_address: String::new(),
            user_payout_address: String::new(),
            user_btc_pubkey: String::new(),
            peer_m1_pubkey: None,
            m1_notified: false,
            secrets_notified: false,
            created_at: 0,
            updated_at: 0,
            terminal_at: None,
            reservations: vec![],
            seen_events: vec![],
        };
        assert!(swap.note_event("a".into()));
        assert!(!swap.note_event("a".into()));
        for i in 0..300 {
            swap.note_event(format!("k{i}"));
        }
        assert!(swap.seen_events.len() <= 256);
        // Old keys fell out of the window; the newest are retained.
        assert!(swap.seen_events.iter().any(|k| k == "k299"));
    }
}
