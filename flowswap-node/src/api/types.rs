//! Request and response DTOs for the FlowSwap API.

use serde::{Deserialize, Serialize};

use flowswap_core::types::{Direction, HtlcLeg, LegRole, QuoteTerms, Swap, SwapState};

fn parse_hash32(raw: &str) -> Result<[u8; 32], String> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
    bytes.try_into().map_err(|_| "expected 32 bytes".to_string())
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub direction: Direction,
    pub from_amount: u64,
    pub h_user: String,
    pub rate_num: u64,
    pub rate_den: u64,
    pub spread_bps: u32,
    #[serde(default)]
    pub protocol_fee: u64,
    pub user_refund_address: String,
    pub user_payout_address: String,
    pub user_btc_pubkey: String,
}

impl InitRequest {
    pub fn h_user(&self) -> Result<[u8; 32], String> {
        parse_hash32(&self.h_user)
    }

    pub fn quote(&self) -> QuoteTerms {
        QuoteTerms {
            rate_num: self.rate_num,
            rate_den: self.rate_den,
            spread_bps: self.spread_bps,
            protocol_fee: self.protocol_fee,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InitLegRequest {
    #[serde(flatten)]
    pub init: InitRequest,
    pub role: LegRole,
    pub peer_url: String,
    pub h_lp1: Option<String>,
    pub h_lp2: Option<String>,
    pub peer_m1_pubkey: String,
}

impl InitLegRequest {
    pub fn h_lp1(&self) -> Result<Option<[u8; 32]>, String> {
        self.h_lp1.as_deref().map(parse_hash32).transpose()
    }

    pub fn h_lp2(&self) -> Result<Option<[u8; 32]>, String> {
        self.h_lp2.as_deref().map(parse_hash32).transpose()
    }
}

#[derive(Debug, Deserialize)]
pub struct M1LockedRequest {
    pub outpoint: String,
    pub amount_sats: u64,
    pub expiry_height: u64,
}

#[derive(Debug, Deserialize)]
pub struct BtcClaimedRequest {
    pub claim_txid: String,
    pub s_user: String,
    pub s_lp1: String,
    pub s_lp2: String,
}

impl BtcClaimedRequest {
    pub fn preimages(&self) -> Result<[[u8; 32]; 3], String> {
        Ok([
            parse_hash32(&self.s_user)?,
            parse_hash32(&self.s_lp1)?,
            parse_hash32(&self.s_lp2)?,
        ])
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub max_age_hours: Option<u64>,
}

/// Swap rendered for API consumers: the record itself plus the addresses
/// the caller acts on next.
#[derive(Debug, Serialize)]
pub struct SwapResponse {
    pub swap_id: String,
    pub state: SwapState,
    pub btc_htlc_address: Option<String>,
    pub m1_htlc_address: Option<String>,
    pub evm_htlc_id: Option<String>,
    pub swap: Swap,
}

impl From<Swap> for SwapResponse {
    fn from(swap: Swap) -> Self {
        let btc_htlc_address = swap
            .btc_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .map(|l| l.address.clone());
        let m1_htlc_address = swap
            .m1_leg
            .as_ref()
            .and_then(HtlcLeg::as_utxo)
            .map(|l| l.address.clone());
        let evm_htlc_id = swap
            .evm_leg
            .as_ref()
            .and_then(HtlcLeg::as_evm)
            .and_then(|l| l.htlc_id)
            .map(hex::encode);
        SwapResponse {
            swap_id: swap.swap_id.clone(),
            state: swap.state,
            btc_htlc_address,
            m1_htlc_address,
            evm_htlc_id,
            swap,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub lp_id: String,
    pub btc_degraded: bool,
    pub m1_degraded: bool,
    pub evm_degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub archived: usize,
}
