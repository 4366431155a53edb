//! FlowSwap LP core: the three-secret HTLC swap engine.
//!
//! A liquidity-provider node for trustless BTC <-> USDC swaps bridged over
//! the M1 settlement rail. Atomicity comes from hashed-timelock contracts
//! on all three chains sharing a triple of SHA-256 hashlocks, so a single
//! claim reveals every preimage the LP needs to collect upstream.
//!
//! This crate holds the swap-state machine, the chain watchers, the HTLC
//! codecs, the durable store, inventory reservations and the peer-LP
//! notification client. The HTTP surface lives in the node crate.

pub mod chain;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod htlc;
pub mod inventory;
pub mod keys;
pub mod notify;
pub mod store;
pub mod types;
pub mod watcher;

pub use config::LpConfig;
pub use engine::{ChainSet, InitSwapRequest, SwapEngine};
pub use error::{ChainError, EngineError, FlowSwapError};
pub use inventory::{BalanceSources, Inventory};
pub use keys::KeyStore;
pub use notify::PeerNotifier;
pub use store::SwapStore;
pub use types::{Asset, ChainId, Direction, LegRole, RoutingMode, Swap, SwapState};
pub use watcher::{ChainHealth, WatchRegistry};
