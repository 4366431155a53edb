//! Error types for the FlowSwap engine and its collaborators.

use thiserror::Error;

use crate::types::{ChainId, SwapState};

/// Top-level error for the FlowSwap core.
#[derive(Error, Debug)]
pub enum FlowSwapError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("notify error: {0}")]
    Notify(#[from] NotifyError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("config error: {0}")]
    Config(String),
}

/// Swap-engine errors. The variants mirror the policy classes the engine
/// distinguishes: transient and permanent chain failures, invariant
/// violations, peer outages, reorg rollbacks and unrecoverable refunds.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown swap: {0}")]
    UnknownSwap(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: SwapState, to: SwapState },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("chain error on {chain}: {source}")]
    Chain {
        chain: ChainId,
        #[source]
        source: ChainError,
    },

    #[error("peer unreachable after {attempts} attempts")]
    PeerUnreachable { attempts: u32 },

    #[error("reorg rollback on {chain} from height {height}")]
    ReorgRollback { chain: ChainId, height: u64 },

    #[error("refund unrecoverable on {chain}: {reason}")]
    UnrecoverableRefund { chain: ChainId, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl EngineError {
    pub fn chain(chain: ChainId, source: ChainError) -> Self {
        EngineError::Chain { chain, source }
    }
}

/// Errors surfaced by the chain clients. The engine classifies these as
/// transient (retry with backoff) or permanent (park the leg).
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc transport failure: {0}")]
    Transport(String),

    #[error("rpc timeout after {0}s")]
    Timeout(u64),

    #[error("transaction rejected by mempool: {0}")]
    MempoolRejected(String),

    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("insufficient wallet funds on chain")]
    InsufficientFunds,

    #[error("unexpected rpc response: {0}")]
    BadResponse(String),
}

impl ChainError {
    /// Transient failures are retried with backoff; everything else marks
    /// the leg broken and parks the swap for the operator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_) | ChainError::Timeout(_) | ChainError::MempoolRejected(_)
        )
    }
}

/// HTLC codec errors: script assembly/parsing, witness extraction, ABI
/// encoding/decoding.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("script error: {0}")]
    Script(String),

    #[error("witness error: {0}")]
    Witness(String),

    #[error("abi error: {0}")]
    Abi(String),

    #[error("preimage does not match any hashlock")]
    PreimageMismatch,

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot version {found} is newer than supported {supported}")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("swap not found: {0}")]
    NotFound(String),
}

/// Inventory errors.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("insufficient {asset} balance: requested {requested}, available {available}")]
    Insufficient {
        asset: crate::types::Asset,
        requested: u64,
        available: u64,
    },

    #[error("{asset} wallet balance below outstanding reservations; refusing new reservations")]
    UnderReserved { asset: crate::types::Asset },
}

/// Peer-notification errors.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(String),

    #[error("peer rejected notification with status {0}")]
    Rejected(u16),

    #[error("retry budget exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Key-material errors. Missing key material during a refund makes the
/// refund unrecoverable and requires operator intervention.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key file missing for {0}")]
    Missing(String),

    #[error("key file for {chain} has loose permissions {mode:o}")]
    Permissions { chain: String, mode: u32 },

    #[error("invalid key material: {0}")]
    Invalid(String),
}
